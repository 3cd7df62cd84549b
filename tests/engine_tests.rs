use std::collections::HashMap;
use std::time::Duration;

use port_audit_rs::ports::KnownPorts;
use port_audit_rs::scanner::{probe_batch, probe_range, BatchOptions};
use port_audit_rs::types::{Category, ProbeOutcome, Target, TargetTag};
use tokio::net::{TcpListener, TcpSocket};

fn opts() -> BatchOptions {
    BatchOptions {
        concurrency: 16,
        timeout: Duration::from_secs(1),
        banner_timeout: Duration::from_millis(200),
    }
}

/// Bound but not listening: refused, and held until the socket is dropped.
fn closed_port() -> (TcpSocket, u16) {
    let sock = TcpSocket::new_v4().unwrap();
    sock.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let port = sock.local_addr().unwrap().port();
    (sock, port)
}

#[tokio::test]
async fn ssh_only_host_scenario() {
    let ssh = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ssh_port = ssh.local_addr().unwrap().port();
    let (_redis, redis_port) = closed_port();
    let (_unknown, unknown_port) = closed_port();

    let targets = vec![
        Target::labeled(ssh_port, "SSH", TargetTag::Expected),
        Target::labeled(redis_port, "Redis", TargetTag::Common),
        Target::new(unknown_port),
    ];
    let report = probe_batch("127.0.0.1", &targets, &KnownPorts::empty(), &opts()).await;

    assert_eq!(report.len(), 3);
    let ssh_r = report.get(ssh_port).unwrap();
    assert!(ssh_r.open);
    assert_eq!(ssh_r.category, Category::Expected);

    let redis_r = report.get(redis_port).unwrap();
    assert!(!redis_r.open);
    assert_eq!(redis_r.category, Category::CommonService);
    assert_eq!(redis_r.outcome, ProbeOutcome::Refused);

    let unknown_r = report.get(unknown_port).unwrap();
    assert!(!unknown_r.open);
    assert_eq!(unknown_r.category, Category::Rogue);
    assert!(unknown_r.banner.is_none());

    assert!(!report.has_rogue());
}

#[tokio::test]
async fn all_listening_targets_are_open() {
    let mut listeners = Vec::new();
    let mut targets = Vec::new();
    for _ in 0..20 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        targets.push(Target::labeled(
            l.local_addr().unwrap().port(),
            "svc",
            TargetTag::Expected,
        ));
        listeners.push(l);
    }
    let report = probe_batch("127.0.0.1", &targets, &KnownPorts::empty(), &opts()).await;
    assert_eq!(report.len(), targets.len());
    assert!(report.results.values().all(|r| r.open));
    assert_eq!(report.summary().expected, targets.len());
}

#[tokio::test]
async fn repeated_batches_agree_on_open_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();
    let (_a, closed_a) = closed_port();
    let (_b, closed_b) = closed_port();
    let targets = vec![
        Target::labeled(open_port, "svc", TargetTag::Expected),
        Target::new(closed_a),
        Target::new(closed_b),
    ];

    let first = probe_batch("127.0.0.1", &targets, &KnownPorts::empty(), &opts()).await;
    let second = probe_batch("127.0.0.1", &targets, &KnownPorts::empty(), &opts()).await;
    let a: HashMap<u16, bool> = first.results.values().map(|r| (r.port, r.open)).collect();
    let b: HashMap<u16, bool> = second.results.values().map(|r| (r.port, r.open)).collect();
    assert_eq!(a, b);
}

#[tokio::test]
async fn range_probe_covers_every_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let start = port.saturating_sub(5).max(1);
    let end = port.saturating_add(5);

    let report = probe_range("127.0.0.1", start, end, &KnownPorts::empty(), &opts()).await;
    assert_eq!(report.len(), (end - start + 1) as usize);
    let hit = report.get(port).unwrap();
    assert!(hit.open);
    assert_eq!(hit.category, Category::Rogue);
    assert!(hit.label.is_none());
    assert!(hit.banner.is_some());
}

#[tokio::test]
async fn open_rogue_with_http_service_gets_banner() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut req = [0u8; 64];
        let _ = sock.read(&mut req).await;
        let _ = sock.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let report = probe_batch(
        "127.0.0.1",
        &[Target::new(port)],
        &KnownPorts::empty(),
        &opts(),
    )
    .await;
    let r = report.get(port).unwrap();
    assert!(report.has_rogue());
    assert!(r.banner.as_deref().unwrap().starts_with("HTTP/1.1 404"));
}
