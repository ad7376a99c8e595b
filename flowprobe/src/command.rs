use crate::api::flows::FlowApiHandler;
use crate::api::{ApiHandler, ApiRouter};
use crate::capture::{CaptureConfig, CaptureSpec, PcapSource};
use crate::flow::FlowTable;
use crate::monitor::{assign_round_robin, IngestConfig, IngestManager};
use crate::system::log_startup_info;
use crate::utils::format_utils::format_bytes;
use crate::web;
use clap::{Args, Parser};
use flowprobe_common::{DEFAULT_ENTRIES, MAX_ENTRIES};
use log::{info, warn, LevelFilter};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;

/// Capture arguments
#[derive(Debug, Args, Clone)]
pub struct CaptureArgs {
    #[clap(long, help = "Network interface to capture from (repeatable, one queue each)")]
    pub iface: Vec<String>,

    #[clap(long, help = "Capture file to replay (repeatable, one queue each)")]
    pub file: Vec<PathBuf>,

    #[clap(long, default_value = "65535", help = "Capture snapshot length in bytes")]
    pub snaplen: i32,

    #[clap(
        long,
        default_value = "false",
        help = "Do not put live interfaces into promiscuous mode"
    )]
    pub no_promisc: bool,
}

/// Flow table arguments
#[derive(Debug, Args, Clone)]
pub struct TableArgs {
    #[clap(
        long,
        default_value_t = DEFAULT_ENTRIES,
        help = "Flow table buckets, a power of two (values above 2097152 are clamped)"
    )]
    pub entries: u32,

    #[clap(long, default_value = "0", help = "Seed for the bucket hash")]
    pub hash_seed: u32,
}

/// Common arguments
#[derive(Debug, Args, Clone)]
pub struct CommonArgs {
    #[clap(long, default_value = "1", help = "Number of ingest worker threads")]
    pub workers: usize,

    #[clap(
        long,
        default_value = "false",
        help = "Pin ingest worker N to CPU core N"
    )]
    pub pin_cores: bool,

    #[clap(
        long,
        default_value = "100",
        help = "Sleep after a poll pass that received nothing (microseconds)"
    )]
    pub idle_backoff_us: u64,

    #[clap(long, help = "Serve the read-only HTTP API on this port")]
    pub api_port: Option<u16>,

    #[clap(long, default_value = "0.0.0.0", help = "HTTP API bind address")]
    pub api_bind: IpAddr,

    #[clap(
        long,
        default_value = "false",
        help = "Enable web request logging (per-HTTP-request line)"
    )]
    pub web_log: bool,

    #[clap(
        long,
        default_value = "info",
        help = "Log level (off, error, warn, info, debug, trace)"
    )]
    pub log_level: String,
}

#[derive(Debug, Parser, Clone)]
#[clap(name = "flowprobe")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Per-flow IPv4 traffic accounting from live interfaces or capture files")]
pub struct Options {
    #[clap(flatten)]
    pub capture: CaptureArgs,

    #[clap(flatten)]
    pub table: TableArgs,

    #[clap(flatten)]
    pub common: CommonArgs,
}

impl Options {
    /// Live interfaces first, then files, in command line order
    pub fn capture_specs(&self) -> Vec<CaptureSpec> {
        self.capture
            .iface
            .iter()
            .cloned()
            .map(CaptureSpec::Live)
            .chain(self.capture.file.iter().cloned().map(CaptureSpec::File))
            .collect()
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            promisc: !self.capture.no_promisc,
            snaplen: self.capture.snaplen,
            ..CaptureConfig::default()
        }
    }

    pub fn entries(&self) -> u32 {
        self.table.entries
    }

    pub fn hash_seed(&self) -> u32 {
        self.table.hash_seed
    }

    pub fn workers(&self) -> usize {
        self.common.workers
    }

    pub fn pin_cores(&self) -> bool {
        self.common.pin_cores
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.common.idle_backoff_us)
    }

    pub fn api_port(&self) -> Option<u16> {
        self.common.api_port
    }

    pub fn api_bind(&self) -> IpAddr {
        self.common.api_bind
    }

    pub fn web_log(&self) -> bool {
        self.common.web_log
    }

    pub fn log_level(&self) -> &str {
        &self.common.log_level
    }
}

// Validate arguments
fn validate_arguments(opt: &Options) -> Result<(), anyhow::Error> {
    let queues = opt.capture_specs().len();
    if queues == 0 {
        return Err(anyhow::anyhow!(
            "No capture configured. Use --iface <NAME> and/or --file <PATH>"
        ));
    }

    // Table size is checked the way the table checks it: clamp, then validate
    let entries = opt.entries().min(MAX_ENTRIES);
    if entries == 0 {
        return Err(anyhow::anyhow!("entries must be greater than 0"));
    }
    if !entries.is_power_of_two() {
        return Err(anyhow::anyhow!(
            "entries must be a power of two, got {}",
            entries
        ));
    }

    if opt.capture.snaplen <= 0 {
        return Err(anyhow::anyhow!("snaplen must be greater than 0"));
    }

    if opt.workers() == 0 {
        return Err(anyhow::anyhow!("workers must be at least 1"));
    }
    if opt.workers() > queues {
        return Err(anyhow::anyhow!(
            "{} workers requested for {} capture queue(s), each worker needs at least one",
            opt.workers(),
            queues
        ));
    }

    if opt.api_port() == Some(0) {
        return Err(anyhow::anyhow!("Port number cannot be 0"));
    }

    LevelFilter::from_str(opt.log_level())
        .map_err(|_| anyhow::anyhow!("Invalid log level '{}'", opt.log_level()))?;

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    let _ = signal::ctrl_c().await;
}

// First SIGINT/SIGTERM stops the workers and the API. The API server is the
// only waiter on the notify, and notify_one keeps the wakeup if it is not
// listening yet.
fn start_signal_task(shutdown: Arc<AtomicBool>, shutdown_notify: Arc<Notify>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal, gracefully shutting down...");
        shutdown.store(true, Ordering::Relaxed);
        shutdown_notify.notify_one();
    });
}

// Write the final table dump and totals to stdout
fn report_table(table: &FlowTable) -> Result<(), anyhow::Error> {
    {
        let stdout = io::stdout();
        let mut out = io::BufWriter::new(stdout.lock());
        table.write_dump(&mut out)?;
        out.flush()?;
    }

    let totals = table.aggregate_totals();
    let occupancy = table.occupancy();
    info!(
        "Totals: {} packets, {} ({} bytes) sent",
        totals.total_packets_sent,
        format_bytes(totals.total_bytes_sent),
        totals.total_bytes_sent
    );
    info!(
        "Table: {} of {} buckets used, {} records, longest chain {}",
        occupancy.used_buckets,
        table.capacity(),
        occupancy.records,
        occupancy.longest_chain
    );
    Ok(())
}

// Run service: ingest workers, optional HTTP API, final report
async fn run_service(options: &Options) -> Result<(), anyhow::Error> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_notify = Arc::new(Notify::new());
    start_signal_task(Arc::clone(&shutdown), Arc::clone(&shutdown_notify));

    let table = Arc::new(FlowTable::create(options.entries(), options.hash_seed())?);

    // One source per worker, queues dealt out round-robin
    let capture_config = options.capture_config();
    let sources = assign_round_robin(options.capture_specs(), options.workers())
        .iter()
        .map(|specs| PcapSource::open(specs, &capture_config))
        .collect::<Result<Vec<_>, _>>()?;

    let mut manager = IngestManager::new(
        Arc::clone(&table),
        Arc::clone(&shutdown),
        IngestConfig {
            workers: options.workers(),
            pin_cores: options.pin_cores(),
            idle_backoff: options.idle_backoff(),
        },
    );
    let counters = manager.counters();
    manager.start(sources)?;

    let web_task = options.api_port().map(|port| {
        let mut api_router = ApiRouter::new();
        api_router.register_handler(ApiHandler::Flows(FlowApiHandler::new(
            Arc::clone(&table),
            Arc::clone(&counters),
            Arc::clone(&shutdown),
        )));
        let bind_addr = SocketAddr::new(options.api_bind(), port);
        let shutdown_notify = Arc::clone(&shutdown_notify);
        let web_log = options.web_log();
        tokio::spawn(async move {
            if let Err(e) = web::start_server(bind_addr, api_router, shutdown_notify, web_log).await
            {
                log::error!("Web server error: {}", e);
            }
        })
    });

    // Workers return on shutdown, at the end of every capture file, or on a
    // fatal error
    let ingest = tokio::task::spawn_blocking(move || manager.join()).await?;

    shutdown.store(true, Ordering::Relaxed);
    shutdown_notify.notify_one();
    if let Some(task) = web_task {
        if let Err(e) = task.await {
            log::error!("Web server task error: {}", e);
        }
    }

    let stats = ingest?;
    info!(
        "Ingest stopped: {} packets in {} bursts",
        stats.packets, stats.bursts
    );
    let frames = stats.frames;
    info!(
        "Frames by type: ipv4 {}, arp {}, ipv6 {}, vlan {}, unknown {}",
        frames.ipv4, frames.arp, frames.ipv6, frames.vlan, frames.unknown
    );

    report_table(&table)?;

    match Arc::try_unwrap(table) {
        Ok(table) => table.destroy(),
        Err(_) => warn!("Flow table still referenced at exit"),
    }

    info!("All modules stopped, program exiting");
    Ok(())
}

pub async fn run(options: Options) -> Result<(), anyhow::Error> {
    validate_arguments(&options)?;

    // Set up logging
    let level = LevelFilter::from_str(options.log_level()).unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter(None, level)
        .target(env_logger::Target::Stdout)
        .init();

    log_startup_info(&options);

    run_service(&options).await?;

    Ok(())
}
