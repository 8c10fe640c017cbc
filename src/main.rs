//! ft8mon CLI - Monitor WSJT-X decodes and aggregate FT8 band activity.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ft8mon::{
    aggregate::Aggregator,
    config::{Config, MonitorSettings, ServerSettings},
    cty::CountryTable,
    delivery::{OverflowPolicy, Reporter, message_queue},
    metrics::start_metrics_server,
    monitor::{Monitor, MonitorConfig},
    server::{self, AppState},
    stats::PipelineStats,
    store::MemoryStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// ft8mon - FT8 activity monitor for WSJT-X
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "FT8MON_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for WSJT-X telegrams and report decodes to a data server
    Monitor(MonitorArgs),
    /// Run the HTTP data server that aggregates reports
    Serve(ServeArgs),
}

#[derive(Args, Debug, Default)]
struct MonitorArgs {
    /// Address to listen on for WSJT-X UDP telegrams
    #[arg(short, long)]
    address: Option<String>,

    /// UDP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to cty.dat
    #[arg(short, long)]
    cty_file: Option<PathBuf>,

    /// Report endpoint (http://host/report?id=<monitor>&band=<band>)
    #[arg(short = 'w', long, env = "FT8MON_REPORT_URL")]
    report_url: Option<String>,

    /// Seconds between report batches
    #[arg(long)]
    send_interval: Option<u64>,

    /// Messages buffered for delivery
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// What to do when the delivery queue is full
    #[arg(long, value_enum)]
    overflow: Option<OverflowPolicy>,

    /// Print statistics every N seconds (0 disables)
    #[arg(short, long)]
    stats_interval: Option<u64>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Address for the HTTP API
    #[arg(short, long)]
    address: Option<String>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Print statistics every N seconds (0 disables)
    #[arg(short, long)]
    stats_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle Ctrl+C
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = ctrl_c_tx.send(true);
    });

    match cli.command {
        Command::Monitor(args) => {
            let settings = monitor_settings(config.monitor, args);
            settings.validate()?;
            run_monitor(settings, shutdown_tx, shutdown_rx).await
        }
        Command::Serve(args) => run_server(server_settings(config.server, args), shutdown_rx).await,
    }
}

/// Overlay command-line flags onto the file settings.
fn monitor_settings(mut settings: MonitorSettings, args: MonitorArgs) -> MonitorSettings {
    if let Some(address) = args.address {
        settings.address = address;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(cty_file) = args.cty_file {
        settings.cty_file = cty_file;
    }
    if let Some(url) = args.report_url {
        settings.report_url = Some(url);
    }
    if let Some(secs) = args.send_interval {
        settings.send_interval = secs;
    }
    if let Some(capacity) = args.queue_capacity {
        settings.queue_capacity = capacity;
    }
    if let Some(overflow) = args.overflow {
        settings.overflow = overflow;
    }
    if let Some(secs) = args.stats_interval {
        settings.stats_interval = secs;
    }
    if args.metrics_port.is_some() {
        settings.metrics_port = args.metrics_port;
    }
    settings
}

fn server_settings(mut settings: ServerSettings, args: ServeArgs) -> ServerSettings {
    if let Some(address) = args.address {
        settings.address = address;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(secs) = args.stats_interval {
        settings.stats_interval = secs;
    }
    settings
}

/// Print a statistics summary every `secs` seconds.
fn spawn_stats_printer(stats: Arc<PipelineStats>, secs: u64) {
    if secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let period = Duration::from_secs(secs);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            println!("\n{}", stats.summary());
        }
    });
}

async fn run_monitor(
    settings: MonitorSettings,
    shutdown_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!("ft8mon monitor starting...");

    let table = CountryTable::load(&settings.cty_file)
        .with_context(|| format!("Failed to load {}", settings.cty_file.display()))?;
    info!(
        "Loaded {} countries ({} prefixes, {} exact calls)",
        table.countries().len(),
        table.prefix_count(),
        table.exact_count()
    );

    let stats = Arc::new(PipelineStats::new());
    let url = settings.report_url.as_deref().unwrap_or_default();
    let reporter = Reporter::new(
        url,
        Duration::from_secs(settings.send_interval),
        Arc::clone(&stats),
    )?;

    let (queue_tx, queue_rx) = message_queue(settings.queue_capacity, settings.overflow);

    let monitor = Monitor::bind(
        MonitorConfig {
            address: settings.address.clone(),
            port: settings.port,
            client_id: settings.client_id.clone(),
            peer_client_id: settings.peer_client_id.clone(),
            ..Default::default()
        },
        Arc::new(table),
        queue_tx,
        Arc::clone(&stats),
    )
    .await?;

    if let Some(port) = settings.metrics_port {
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, stats).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }
    spawn_stats_printer(Arc::clone(&stats), settings.stats_interval);

    let reporter_task = tokio::spawn(reporter.run(queue_rx, shutdown.clone()));
    let result = monitor.run(shutdown).await;

    // A Close telegram ends the monitor without a signal; stop the reporter too.
    let _ = shutdown_tx.send(true);
    if let Err(e) = reporter_task.await {
        warn!("Reporter task ended abnormally: {}", e);
    }

    println!("\n\nFINAL STATISTICS");
    println!("{}", stats.summary());

    result
}

async fn run_server(settings: ServerSettings, shutdown: watch::Receiver<bool>) -> Result<()> {
    info!("ft8mon data server starting...");

    let addr: SocketAddr = format!("{}:{}", settings.address, settings.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", settings.address, settings.port))?;

    let stats = Arc::new(PipelineStats::new());
    let state = AppState {
        aggregator: Arc::new(Aggregator::new(Arc::new(MemoryStore::new()))),
        stats: Arc::clone(&stats),
    };
    spawn_stats_printer(stats, settings.stats_interval);

    server::serve(addr, state, shutdown).await?;
    info!("ft8mon data server stopped");
    Ok(())
}
