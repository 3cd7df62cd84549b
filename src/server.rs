use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::AuditConfig,
    ports::{self, KnownPorts},
    scanner::{self, SharedProgress},
    types::{Category, ProbeOutcome, ProbeReport, Target},
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>,
    config: Arc<AuditConfig>,
    known: Arc<KnownPorts>,
}

#[derive(Debug)]
struct ServerState {
    state: ScanState,
    generation: u64,
    results: Option<ProbeReport>,
    progress: Option<SharedProgress>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Running,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub total: u64,
    pub probed: u64,
    pub open: u64,
    pub rogue: u64,
    pub state: ScanState,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub range: Option<(u16, u16)>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TestPortRequest {
    pub port: u16,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TestPortResponse {
    pub host: String,
    pub port: u16,
    pub open: bool,
    pub outcome: ProbeOutcome,
    pub category: Category,
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
}

impl AppState {
    pub fn new(config: AuditConfig) -> Self {
        let known = config.known_ports();
        Self {
            inner: Arc::new(RwLock::new(ServerState {
                state: ScanState::Idle,
                generation: 0,
                results: None,
                progress: None,
            })),
            config: Arc::new(config),
            known: Arc::new(known),
        }
    }
}

/// Build the API router: `/health` plus `/api/{status,scan,results,test-port}`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/results", get(get_results))
        .route("/test-port", post(post_test_port))
        .with_state(state);

    Router::new()
        .route("/health", get(get_health))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, config: AuditConfig) -> Result<()> {
    let app = router(AppState::new(config));
    info!(bind, "serving API");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn get_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": scanner::now_iso_like(),
    }))
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let out = match (s.progress.as_ref(), s.results.as_ref()) {
        (Some(p), _) => Status {
            total: p.total.load(Ordering::Relaxed),
            probed: p.probed.load(Ordering::Relaxed),
            open: p.open_count.load(Ordering::Relaxed),
            rogue: p.rogue_count.load(Ordering::Relaxed),
            state: s.state,
        },
        (None, Some(r)) => {
            let sum = r.summary();
            Status {
                total: sum.total_probed as u64,
                probed: sum.total_probed as u64,
                open: sum.total_open as u64,
                rogue: sum.rogue as u64,
                state: s.state,
            }
        }
        (None, None) => Status {
            total: 0,
            probed: 0,
            open: 0,
            rogue: 0,
            state: s.state,
        },
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    if let Some(res) = s.results.as_ref() {
        (StatusCode::OK, Json(res.clone())).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn post_test_port(
    State(app): State<AppState>,
    Json(req): Json<TestPortRequest>,
) -> impl IntoResponse {
    if req.port == 0 {
        return (StatusCode::BAD_REQUEST, "port out of range: 0").into_response();
    }
    let host = req.host.unwrap_or_else(|| app.config.host.clone());
    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| app.config.check_timeout());
    let banner_timeout = app.config.batch_options().banner_timeout;
    let target = Target::new(req.port);
    let r = scanner::check_port(&host, &target, &app.known, timeout, banner_timeout).await;
    let out = TestPortResponse {
        host,
        port: r.port,
        open: r.open,
        outcome: r.outcome,
        category: r.category,
        label: r.label,
        banner: r.banner,
    };
    (StatusCode::OK, Json(out)).into_response()
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> impl IntoResponse {
    let targets: Vec<Target> = match (req.range, req.ports.is_empty()) {
        (Some((start, end)), _) => {
            if let Err(e) = ports::validate_range(start, end) {
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
            ports::range_targets(start, end)
        }
        (None, false) => {
            if req.ports.contains(&0) {
                return (StatusCode::BAD_REQUEST, "port out of range: 0").into_response();
            }
            req.ports.iter().copied().map(Target::new).collect()
        }
        (None, true) => app.known.targets(),
    };

    let host = req.host.unwrap_or_else(|| app.config.host.clone());
    let mut opts = app.config.batch_options();
    if let Some(c) = req.concurrency {
        opts.concurrency = c;
    }
    if let Some(ms) = req.timeout_ms {
        opts.timeout = Duration::from_millis(ms);
    }

    let total = targets.len() as u64;
    let progress = SharedProgress::new();
    progress.total.store(total, Ordering::Relaxed);
    let generation = {
        let mut s = app.inner.write().await;
        s.generation += 1;
        s.state = ScanState::Running;
        s.results = None;
        s.progress = Some(progress.clone());
        s.generation
    };

    let app2 = app.clone();
    tokio::spawn(async move {
        let report =
            scanner::probe_batch_with_shared(&host, &targets, &app2.known, &opts, progress).await;
        info!(
            host = %report.host,
            probed = report.len(),
            rogue = report.summary().rogue,
            "api scan finished"
        );
        let mut s = app2.inner.write().await;
        if s.generation != generation {
            // superseded by a newer scan
            return;
        }
        s.state = ScanState::Done;
        s.results = Some(report);
        s.progress = None;
    });

    let status = Status {
        total,
        probed: 0,
        open: 0,
        rogue: 0,
        state: ScanState::Running,
    };
    (StatusCode::ACCEPTED, Json(status)).into_response()
}
