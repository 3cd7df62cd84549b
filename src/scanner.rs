use crate::banner::{self, DEFAULT_BANNER_TIMEOUT};
use crate::ports::{range_targets, KnownPorts, SWEEP_CHUNKS};
use crate::types::{Category, ProbeOutcome, ProbeReport, ProbeResult, Target};
use ::time::{format_description::well_known, OffsetDateTime};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Upper bound applied to any requested concurrency limit.
pub const MAX_CONCURRENCY: usize = 5_000;

/// Knobs for one batch.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum number of probes in flight at once. Clamped to `1..=MAX_CONCURRENCY`.
    pub concurrency: usize,
    /// Per-probe connect timeout, including name resolution.
    pub timeout: Duration,
    /// Budget for the banner grab on open rogue ports.
    pub banner_timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 200,
            timeout: Duration::from_millis(500),
            banner_timeout: DEFAULT_BANNER_TIMEOUT,
        }
    }
}

/// Counters that can be read while a batch is still running.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub total: Arc<AtomicU64>,
    pub probed: Arc<AtomicU64>,
    pub open_count: Arc<AtomicU64>,
    pub rogue_count: Arc<AtomicU64>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            total: Arc::new(AtomicU64::new(0)),
            probed: Arc::new(AtomicU64::new(0)),
            open_count: Arc::new(AtomicU64::new(0)),
            rogue_count: Arc::new(AtomicU64::new(0)),
        }
    }

    fn observe(&self, result: &ProbeResult) {
        self.probed.fetch_add(1, Ordering::Relaxed);
        if result.open {
            self.open_count.fetch_add(1, Ordering::Relaxed);
            if result.category == Category::Rogue {
                self.rogue_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// True iff a TCP connection to `host:port` completes within `timeout`.
///
/// Refused, timed out, unresolvable and unreachable are all reported as `false`.
/// A zero timeout returns `false` without touching the network.
pub async fn probe_one(host: &str, port: u16, timeout: Duration) -> bool {
    probe_outcome(host, port, timeout).await.is_open()
}

/// Like [`probe_one`] but keeps the reason a port was not reachable.
pub async fn probe_outcome(host: &str, port: u16, timeout: Duration) -> ProbeOutcome {
    match connect(host, port, timeout).await {
        Ok(_stream) => ProbeOutcome::Connected,
        Err(outcome) => outcome,
    }
}

/// Resolve and connect within one deadline. The returned stream is the caller's to drop.
async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProbeOutcome> {
    if timeout.is_zero() {
        return Err(ProbeOutcome::TimedOut);
    }

    let attempt = async {
        let addrs: Vec<_> = match lookup_host((host, port)).await {
            Ok(a) => a.collect(),
            Err(_) => return Err(ProbeOutcome::ResolutionFailed),
        };
        if addrs.is_empty() {
            return Err(ProbeOutcome::ResolutionFailed);
        }
        let mut last = ProbeOutcome::Unreachable;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last = ProbeOutcome::from_io_error(&e),
            }
        }
        Err(last)
    };

    match time::timeout(timeout, attempt).await {
        Ok(res) => res,
        Err(_) => Err(ProbeOutcome::TimedOut),
    }
}

/// Check one target and classify it, as for a targeted single-port check.
///
/// An open rogue port is identified over a fresh connection, so the reachability socket is
/// already released when the banner grab starts.
pub async fn check_port(
    host: &str,
    target: &Target,
    known: &KnownPorts,
    timeout: Duration,
    banner_timeout: Duration,
) -> ProbeResult {
    let category = known.classify(target);
    let start = Instant::now();
    let outcome = probe_outcome(host, target.port, timeout).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let banner = if outcome.is_open() && category == Category::Rogue {
        Some(banner::identify_service(host, target.port, banner_timeout).await)
    } else {
        None
    };
    ProbeResult {
        port: target.port,
        open: outcome.is_open(),
        outcome,
        label: target
            .label
            .clone()
            .or_else(|| known.label(target.port).map(str::to_string)),
        category,
        banner,
        latency_ms,
        timestamp: now_iso_like(),
    }
}

/// Probe every target concurrently and return the completed report.
///
/// - At most `opts.concurrency` probes run at once, enforced with a `Semaphore`.
/// - Each probe sends its result over a channel; one aggregator owns the report and does
///   every insertion.
/// - Returns only after every launched probe has finished.
/// - Duplicate ports are probed once, using the first target that names them.
pub async fn probe_batch(
    host: &str,
    targets: &[Target],
    known: &KnownPorts,
    opts: &BatchOptions,
) -> ProbeReport {
    probe_batch_internal(host, targets, known, opts, None).await
}

/// Variant that publishes progress counters while the batch runs.
pub async fn probe_batch_with_shared(
    host: &str,
    targets: &[Target],
    known: &KnownPorts,
    opts: &BatchOptions,
    shared: SharedProgress,
) -> ProbeReport {
    probe_batch_internal(host, targets, known, opts, Some(shared)).await
}

/// Probe every port in `start..=end`, unlabeled and untagged.
pub async fn probe_range(
    host: &str,
    start: u16,
    end: u16,
    known: &KnownPorts,
    opts: &BatchOptions,
) -> ProbeReport {
    probe_batch(host, &range_targets(start, end), known, opts).await
}

/// Sweep 1-65535 as sequential chunks and merge the results.
///
/// `cancel` is checked before each chunk; a chunk that already started always runs to
/// completion. Returns the report covering the chunks that ran.
pub async fn full_sweep(
    host: &str,
    known: &KnownPorts,
    opts: &BatchOptions,
    cancel: CancellationToken,
) -> ProbeReport {
    let mut report = ProbeReport::new(host, now_iso_like());
    for &(start, end, name) in SWEEP_CHUNKS {
        if cancel.is_cancelled() {
            info!(start, end, "sweep cancelled, skipping remaining chunks");
            break;
        }
        info!(chunk = name, start, end, "scanning chunk");
        let chunk = probe_range(host, start, end, known, opts).await;
        let rogue = chunk.open_in(Category::Rogue).len();
        if rogue > 0 {
            info!(chunk = name, rogue, "unexpected open ports in chunk");
        }
        report.merge(chunk);
    }
    report.finished_at = Some(now_iso_like());
    report
}

async fn probe_batch_internal(
    host: &str,
    targets: &[Target],
    known: &KnownPorts,
    opts: &BatchOptions,
    shared_opt: Option<SharedProgress>,
) -> ProbeReport {
    let mut seen = HashSet::new();
    let unique: Vec<&Target> = targets.iter().filter(|t| seen.insert(t.port)).collect();

    let shared = shared_opt.unwrap_or_default();
    shared.total.store(unique.len() as u64, Ordering::Relaxed);

    let concurrency = opts.concurrency.clamp(1, MAX_CONCURRENCY);
    debug!(
        host,
        targets = unique.len(),
        concurrency,
        timeout_ms = opts.timeout.as_millis() as u64,
        "starting batch"
    );

    let host: Arc<str> = Arc::from(host);
    let mut report = ProbeReport::new(&*host, now_iso_like());
    let (tx, mut rx) = mpsc::unbounded_channel::<ProbeResult>();

    let launch = async {
        let sem = Arc::new(Semaphore::new(concurrency));
        let mut set = JoinSet::new();

        for target in unique {
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            let category = known.classify(target);
            let label = target
                .label
                .clone()
                .or_else(|| known.label(target.port).map(str::to_string));
            let port = target.port;
            let host = host.clone();
            let tx = tx.clone();
            let timeout = opts.timeout;
            let banner_timeout = opts.banner_timeout;

            set.spawn(async move {
                let _permit = permit; // keep permit until task completes

                let start = Instant::now();
                let (outcome, banner) = match connect(&host, port, timeout).await {
                    Ok(mut stream) => {
                        let banner = if category == Category::Rogue {
                            Some(banner::grab_banner(&mut stream, banner_timeout).await)
                        } else {
                            None
                        };
                        (ProbeOutcome::Connected, banner)
                    }
                    Err(outcome) => (outcome, None),
                };
                let latency_ms = start.elapsed().as_millis() as u64;
                trace!(port, ?outcome, latency_ms, "probe finished");

                let result = ProbeResult {
                    port,
                    open: outcome.is_open(),
                    outcome,
                    label,
                    category,
                    banner,
                    latency_ms,
                    timestamp: now_iso_like(),
                };
                // Receiver lives until every sender is gone.
                let _ = tx.send(result);
            });
        }
        drop(tx);

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "probe task failed");
            }
        }
    };

    let aggregate = async {
        while let Some(result) = rx.recv().await {
            shared.observe(&result);
            if result.open && result.category == Category::Rogue {
                info!(
                    port = result.port,
                    service = result.banner.as_deref().unwrap_or(banner::UNKNOWN_SERVICE),
                    "rogue port found"
                );
            }
            report.record(result);
        }
    };

    tokio::join!(launch, aggregate);

    report.finished_at = Some(now_iso_like());
    debug!(
        host = %report.host,
        probed = report.len(),
        open = report.open().count(),
        "batch complete"
    );
    report
}

/// RFC3339 UTC timestamp.
pub fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
