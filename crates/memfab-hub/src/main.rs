use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use memfab_core::analyzer::LeakAnalyzer;

mod analysis;
mod analyzers;
mod api;
mod hub;
mod publisher;
mod reassembly;
mod store;

use analyzers::{CommandAnalyzer, GrowthDeltaAnalyzer};
use hub::{router, Hub};

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dashboard_origin: String,
    pub snapshot_dir: PathBuf,
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
    pub metric_cap: usize,
    pub alert_cap: usize,
    pub max_frame_bytes: usize,
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub initial_alerts: usize,
    pub analyzer_cmd: Option<String>,
    pub growth_alert_mb: f64,
    pub leak_threshold_mb: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            dashboard_origin: "*".to_string(),
            snapshot_dir: PathBuf::from("./dashboard-snapshots"),
            inactivity_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            metric_cap: 1000,
            alert_cap: 100,
            max_frame_bytes: 1024 * 1024,
            queue_capacity: 256,
            write_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            initial_alerts: 10,
            analyzer_cmd: None,
            growth_alert_mb: 50.0,
            leak_threshold_mb: 10.0,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "memfab-hub", about = "Memory-observability fabric hub")]
struct Args {
    #[arg(long, env = "MEMFAB_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "MEMFAB_PORT", default_value_t = 4000)]
    port: u16,
    /// Origin allowed to reach the dashboard endpoints; "*" disables the check.
    #[arg(long, env = "MEMFAB_DASHBOARD_ORIGIN", default_value = "*")]
    dashboard_origin: String,
    #[arg(long, env = "MEMFAB_SNAPSHOT_DIR", default_value = "./dashboard-snapshots")]
    snapshot_dir: PathBuf,
    /// Seconds of silence before a connected service is marked disconnected.
    #[arg(long, default_value_t = 60)]
    inactivity_timeout_secs: u64,
    #[arg(long, default_value_t = 30)]
    sweep_interval_secs: u64,
    #[arg(long, default_value_t = 1000)]
    metric_cap: usize,
    #[arg(long, default_value_t = 100)]
    alert_cap: usize,
    #[arg(long, default_value_t = 1024 * 1024)]
    max_frame_bytes: usize,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 5)]
    write_timeout_secs: u64,
    #[arg(long, default_value_t = 30)]
    ping_interval_secs: u64,
    /// External analyzer command; falls back to the built-in size-delta
    /// analyzer when unset.
    #[arg(long, env = "MEMFAB_ANALYZER_CMD")]
    analyzer_cmd: Option<String>,
    /// Suspicious growth above this many MB raises a critical alert.
    #[arg(long, default_value_t = 50.0)]
    growth_alert_mb: f64,
    /// Growth threshold (MB) handed to the analyzer.
    #[arg(long, default_value_t = 10.0)]
    leak_threshold_mb: f64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn load_config(args: &Args) -> Config {
    Config {
        host: args.host.clone(),
        port: args.port,
        dashboard_origin: args.dashboard_origin.clone(),
        snapshot_dir: args.snapshot_dir.clone(),
        inactivity_timeout: Duration::from_secs(args.inactivity_timeout_secs),
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        metric_cap: args.metric_cap,
        alert_cap: args.alert_cap,
        max_frame_bytes: args.max_frame_bytes,
        queue_capacity: args.queue_capacity,
        write_timeout: Duration::from_secs(args.write_timeout_secs),
        ping_interval: Duration::from_secs(args.ping_interval_secs),
        initial_alerts: 10,
        analyzer_cmd: args.analyzer_cmd.clone(),
        growth_alert_mb: args.growth_alert_mb,
        leak_threshold_mb: args.leak_threshold_mb,
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("MEMFAB_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_analyzers(config: &Config) -> (Arc<dyn LeakAnalyzer>, Arc<dyn LeakAnalyzer>) {
    let primary: Arc<dyn LeakAnalyzer> = match &config.analyzer_cmd {
        Some(command) => Arc::new(CommandAnalyzer::new(command.clone())),
        None => Arc::new(GrowthDeltaAnalyzer),
    };
    (primary, Arc::new(GrowthDeltaAnalyzer))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);
    let config = load_config(&args);

    let (primary, fallback) = build_analyzers(&config);
    let hub = Arc::new(Hub::new(config.clone(), primary, fallback));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    hub.clone().spawn_liveness_sweeper(shutdown_rx);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        event = "hub_start",
        addr = %addr,
        snapshot_dir = %config.snapshot_dir.display(),
        inactivity_timeout_secs = config.inactivity_timeout.as_secs(),
        sweep_interval_secs = config.sweep_interval.as_secs()
    );

    let app = router(hub);
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
        let _ = shutdown_tx.send(true);
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;
    Ok(())
}
