use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use port_audit_rs::config::AuditConfig;
use port_audit_rs::firewall;
use port_audit_rs::ports::{self, KnownPorts};
use port_audit_rs::scanner;
use port_audit_rs::server;
use port_audit_rs::types::{Category, ProbeReport, ProbeResult, Target};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// port-audit-rs: probe a host's TCP ports and flag anything that should not be open.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "port-audit-rs",
    version,
    about = "Probe a host's TCP ports and flag expected, common and rogue open ports.",
    long_about = None
)]
struct Cli {
    /// TOML config file with host, timings and expected/common port tables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to audit (IP or hostname). Overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Scan the expected and common port tables (default mode).
    #[arg(long, default_value_t = false)]
    common: bool,

    /// Scan an inclusive port range.
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    range: Option<Vec<u16>>,

    /// Check a single port.
    #[arg(long)]
    port: Option<u16>,

    /// Path to ports list file (one port or range per line).
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// Sweep all 65535 ports in sequential chunks. Ctrl+C skips the remaining chunks.
    #[arg(long, default_value_t = false)]
    full: bool,

    /// Max concurrent TCP connect attempts.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Write the report as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Show ufw and iptables status before scanning. Read-only, may need sudo.
    #[arg(long, default_value_t = false)]
    firewall: bool,

    /// Print firewall commands that would open the closed ports. Nothing is executed.
    #[arg(long, default_value_t = false)]
    suggest: bool,

    /// Serve the HTTP API on this address instead of scanning (e.g. 127.0.0.1:9090).
    #[arg(long = "serve-ui")]
    serve_ui: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let mut cfg = match cli.config.as_deref() {
        Some(path) => AuditConfig::load(path)?,
        None => AuditConfig::default(),
    };
    if let Some(h) = cli.host.clone() {
        cfg.host = h;
    }
    if let Some(c) = cli.concurrency {
        cfg.concurrency = c;
    }
    if let Some(ms) = cli.timeout_ms {
        cfg.timeout_ms = ms;
        cfg.check_timeout_ms = ms;
    }
    cfg.validate()?;

    if let Some(bind) = cli.serve_ui.as_deref() {
        println!("API server starting at http://{bind} (Ctrl+C to stop)");
        tokio::select! {
            res = server::spawn_server(bind, cfg) => res?,
            _ = tokio::signal::ctrl_c() => {}
        }
        return Ok(ExitCode::SUCCESS);
    }

    println!("port-audit-rs configuration:");
    println!("  host         : {}", cfg.host);
    println!("  concurrency  : {}", cfg.concurrency);
    println!("  timeout_ms   : {}", cfg.timeout_ms);

    let known = cfg.known_ports();
    let opts = cfg.batch_options();

    if cli.firewall {
        print_firewall_status().await;
    }

    if let Some(port) = cli.port {
        let target = Target::new(port);
        let r = scanner::check_port(
            &cfg.host,
            &target,
            &known,
            cfg.check_timeout(),
            opts.banner_timeout,
        )
        .await;
        let status = if r.open { "OPEN" } else { "CLOSED" };
        let label = r.label.as_deref().unwrap_or("-");
        println!(
            "\nPort {port} ({label}): {status} [{:?}] category: {}",
            r.outcome,
            r.category.as_str()
        );
        if let Some(service) = r.banner.as_deref() {
            println!("  service: {service}");
        }
        if r.open && r.category == Category::Rogue {
            println!("\nSECURITY ALERT: port {port} is open and not in any known table");
            return Ok(ExitCode::from(1));
        }
        return Ok(ExitCode::SUCCESS);
    }

    let report = if let Some(range) = cli.range.as_deref() {
        let (start, end) = (range[0], range[1]);
        ports::validate_range(start, end)?;
        println!("\nScanning port range {start}-{end} on {}...", cfg.host);
        scanner::probe_range(&cfg.host, start, end, &known, &opts).await
    } else if let Some(path) = cli.ports_file.as_deref() {
        let list = ports::load_ports_from_path(path)?;
        let targets: Vec<Target> = list.into_iter().map(Target::new).collect();
        println!(
            "\nScanning {} ports from {} on {}...",
            targets.len(),
            path.display(),
            cfg.host
        );
        scanner::probe_batch(&cfg.host, &targets, &known, &opts).await
    } else {
        if !cli.common && !cli.full {
            info!("no mode selected, running common port scan");
        }
        let targets = known.targets();
        println!("\nScanning {} known ports on {}...", targets.len(), cfg.host);
        let mut report = scanner::probe_batch(&cfg.host, &targets, &known, &opts).await;
        print_quick_scan(&report);

        if cli.full {
            println!(
                "\nFull scan of all 65535 ports requested (Ctrl+C to skip remaining chunks)..."
            );
            let cancel = CancellationToken::new();
            let cancel_ctrlc = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing current chunk");
                    cancel_ctrlc.cancel();
                }
            });
            let sweep = scanner::full_sweep(&cfg.host, &known, &opts, cancel).await;
            report.merge(sweep);
        }
        report
    };

    print_results_table(&report);
    print_category_summary(&report, &known);

    if let Some(path) = cli.output.as_deref() {
        match write_results_json(path, &report) {
            Ok(()) => println!("\nWrote JSON report to {}", path.display()),
            Err(e) => eprintln!("Failed to write JSON to {}: {e:#}", path.display()),
        }
    }

    if cli.suggest {
        suggest_firewall_rules(&report);
    }

    if report.has_rogue() {
        println!("\nSECURITY ALERT: rogue ports detected");
        Ok(ExitCode::from(1))
    } else {
        println!("\nScan complete - no rogue ports found");
        Ok(ExitCode::SUCCESS)
    }
}

fn print_quick_scan(report: &ProbeReport) {
    for r in report.results.values() {
        let label = r.label.as_deref().unwrap_or("-");
        match (r.open, r.category) {
            (true, Category::Expected) => {
                println!("  Port {:5} ({label:15}): OPEN (expected)", r.port)
            }
            (true, _) => println!("  Port {:5} ({label:15}): OPEN (unexpected)", r.port),
            (false, Category::Expected) => {
                println!("  Port {:5} ({label:15}): CLOSED", r.port)
            }
            (false, _) => {}
        }
    }
}

async fn print_firewall_status() {
    let status = firewall::inspect().await;

    println!("\nUFW firewall status:");
    match status.ufw {
        Ok(out) => println!("{}", out.trim_end()),
        Err(e) => println!("  unable to check UFW status (may need sudo): {e}"),
    }

    println!("\niptables rules (first {} lines):", firewall::IPTABLES_LINES);
    match status.iptables {
        Ok(out) => println!("{out}"),
        Err(e) => println!("  unable to check iptables (may need sudo): {e}"),
    }
}

fn print_results_table(report: &ProbeReport) {
    let open: Vec<&ProbeResult> = report.open().collect();
    let closed: Vec<&ProbeResult> = report.closed().collect();

    let mut label_w = "label".len();
    let mut banner_w = "service".len();
    for e in &open {
        label_w = label_w.max(e.label.as_deref().map_or(0, str::len));
        if let Some(b) = &e.banner {
            banner_w = banner_w.max(b.len().min(60));
        }
    }
    let port_w = 5usize;
    let cat_w = "common-service".len();

    println!(
        "\nHost: {}  probed: {}  open: {}  closed: {}",
        report.host,
        report.len(),
        open.len(),
        closed.len()
    );
    println!(
        "{:>port_w$}  {:<cat_w$}  {:<label_w$}  {:<banner_w$}",
        "port", "category", "label", "service"
    );
    println!(
        "{:-<port_w$}  {:-<cat_w$}  {:-<label_w$}  {:-<banner_w$}",
        "", "", "", ""
    );
    for e in &open {
        let mut bsnip = e.banner.clone().unwrap_or_default();
        if bsnip.len() > 60 {
            let cut = (0..=60).rev().find(|&i| bsnip.is_char_boundary(i)).unwrap_or(0);
            bsnip.truncate(cut);
        }
        println!(
            "{:>port_w$}  {:<cat_w$}  {:<label_w$}  {:<banner_w$}",
            e.port,
            e.category.as_str(),
            e.label.as_deref().unwrap_or(""),
            bsnip
        );
    }

    if !closed.is_empty() {
        println!("\nClosed ports:");
        for e in closed.iter().take(10) {
            println!("  - {:5} : {}", e.port, e.label.as_deref().unwrap_or(""));
        }
        if closed.len() > 10 {
            println!("  ... and {} more", closed.len() - 10);
        }
    }
}

fn print_category_summary(report: &ProbeReport, known: &KnownPorts) {
    let s = report.summary();
    println!(
        "\nExpected open: {}  common services: {}  rogue: {}",
        s.expected, s.common_service, s.rogue
    );
    for r in report.open_in(Category::CommonService) {
        let label = r.label.as_deref().or_else(|| known.label(r.port)).unwrap_or("");
        println!("  common service exposed: {:5} {label}", r.port);
    }
    for r in report.open_in(Category::Rogue) {
        println!(
            "  ROGUE: {:5} {}",
            r.port,
            r.banner.as_deref().unwrap_or(port_audit_rs::banner::UNKNOWN_SERVICE)
        );
    }
}

fn suggest_firewall_rules(report: &ProbeReport) {
    let closed: Vec<u16> = report.closed().map(|r| r.port).take(5).collect();
    if closed.is_empty() {
        return;
    }
    println!("\nSuggested firewall rules (not applied):");
    println!("\n# Using UFW:");
    for p in &closed {
        println!("sudo ufw allow {p}/tcp");
    }
    println!("\n# Using iptables:");
    for p in &closed {
        println!("sudo iptables -A INPUT -p tcp --dport {p} -j ACCEPT");
    }
    println!("\n# Save iptables rules:");
    println!("sudo iptables-save > /etc/iptables/rules.v4");
}

fn write_results_json(path: &Path, report: &ProbeReport) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create report file: {}", path.display()))?;
    let doc = serde_json::json!({
        "host": report.host,
        "started_at": report.started_at,
        "finished_at": report.finished_at,
        "summary": report.summary(),
        "results": report.results,
    });
    serde_json::to_writer_pretty(file, &doc)?;
    Ok(())
}
