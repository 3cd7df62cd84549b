//! Read-only firewall status inspection.
//!
//! Runs `ufw status numbered` and `iptables -L -n` and returns their output. Nothing in
//! this module adds, removes or reorders rules.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

/// Per-command limit.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// How many lines of `iptables -L -n` are kept.
pub const IPTABLES_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Output of both status commands. Each side fails independently.
#[derive(Debug)]
pub struct FirewallStatus {
    pub ufw: Result<String, InspectError>,
    pub iptables: Result<String, InspectError>,
}

/// Run a status command with no stdin and return its stdout.
///
/// The child is killed if it outlives `timeout`.
pub async fn run_status_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, InspectError> {
    debug!(program, ?args, "running firewall status command");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match time::timeout(timeout, child).await {
        Ok(Ok(out)) => out,
        Ok(Err(source)) => {
            return Err(InspectError::Spawn {
                program: program.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(InspectError::Timeout {
                program: program.to_string(),
                after: timeout,
            })
        }
    };

    if !output.status.success() {
        return Err(InspectError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// First `n` lines of `text`.
pub fn head_lines(text: &str, n: usize) -> String {
    text.lines().take(n).collect::<Vec<_>>().join("\n")
}

/// Query ufw and iptables, one after the other.
pub async fn inspect() -> FirewallStatus {
    let ufw = run_status_command("ufw", &["status", "numbered"], COMMAND_TIMEOUT).await;
    let iptables = run_status_command("iptables", &["-L", "-n"], COMMAND_TIMEOUT)
        .await
        .map(|out| head_lines(&out, IPTABLES_LINES));
    FirewallStatus { ufw, iptables }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_status_command("sh", &["-c", "printf 'Status: active\\n'"], COMMAND_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(out, "Status: active\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let err = run_status_command("sh", &["-c", "echo denied >&2; exit 3"], COMMAND_TIMEOUT)
            .await
            .unwrap_err();
        match err {
            InspectError::Failed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = run_status_command("no-such-firewall-tool", &[], COMMAND_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, InspectError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let start = std::time::Instant::now();
        let err = run_status_command("sh", &["-c", "sleep 5"], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, InspectError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn head_lines_keeps_prefix() {
        let text: String = (0..30).map(|i| format!("rule {i}\n")).collect();
        let head = head_lines(&text, IPTABLES_LINES);
        assert_eq!(head.lines().count(), IPTABLES_LINES);
        assert!(head.ends_with("rule 19"));
    }
}
