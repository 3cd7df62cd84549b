use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

/// Returned whenever a service could not be identified.
pub const UNKNOWN_SERVICE: &str = "Unknown";

/// Default time budget for one banner grab.
pub const DEFAULT_BANNER_TIMEOUT: Duration = Duration::from_secs(2);

const HEAD_REQUEST: &[u8] = b"HEAD / HTTP/1.0\r\n\r\n";
const READ_CAP: usize = 1024;
const KEEP_CHARS: usize = 100;

/// Send a minimal HTTP HEAD on an open connection and return the start of the reply.
///
/// The write and the single read share `budget`. Timeouts, resets, empty replies and
/// anything else that goes wrong yield [`UNKNOWN_SERVICE`]. Never retried.
pub async fn grab_banner(stream: &mut TcpStream, budget: Duration) -> String {
    let exchange = async {
        stream.write_all(HEAD_REQUEST).await?;
        let mut buf = vec![0u8; READ_CAP];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok::<_, std::io::Error>(buf)
    };

    match time::timeout(budget, exchange).await {
        Ok(Ok(buf)) => render(&buf).unwrap_or_else(|| UNKNOWN_SERVICE.to_string()),
        Ok(Err(e)) => {
            trace!(error = %e, "banner exchange failed");
            UNKNOWN_SERVICE.to_string()
        }
        Err(_) => {
            trace!("banner exchange timed out");
            UNKNOWN_SERVICE.to_string()
        }
    }
}

/// Printable single-line form of a raw reply, at most `KEEP_CHARS` characters.
///
/// Invalid UTF-8 is dropped rather than replaced. Line breaks are escaped before the cut.
fn render(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let out: String = text
        .chars()
        .filter(|&c| c != char::REPLACEMENT_CHARACTER)
        .flat_map(|c| match c {
            '\n' => vec!['\\', 'n'],
            '\r' => vec!['\\', 'r'],
            c => vec![c],
        })
        .take(KEEP_CHARS)
        .collect();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Open a fresh connection to `host:port` and grab a banner from it.
pub async fn identify_service(host: &str, port: u16, budget: Duration) -> String {
    match time::timeout(budget, TcpStream::connect((host, port))).await {
        Ok(Ok(mut stream)) => grab_banner(&mut stream, budget).await,
        _ => UNKNOWN_SERVICE.to_string(),
    }
}
