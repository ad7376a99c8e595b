use crate::capture::{Burst, PacketSource};
use crate::flow::FlowTable;
use crate::pipeline::{classify_burst, EtherCounts, SharedEtherCounts};
use crate::system::pin_current_thread;
use crate::utils::format_utils::format_mac;
use log::{debug, error, info, log_enabled, trace, warn, Level};
use network_types::eth::EthHdr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A progress line is logged each time a worker crosses a multiple of this
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub workers: usize,
    pub pin_cores: bool,
    pub idle_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            pin_cores: false,
            idle_backoff: Duration::from_micros(100),
        }
    }
}

/// Counters kept by one worker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub packets: u64,
    pub bursts: u64,
    pub passes: u64,
    pub frames: EtherCounts,
}

impl IngestStats {
    fn merge(&mut self, other: &IngestStats) {
        self.packets += other.packets;
        self.bursts += other.bursts;
        self.passes += other.passes;
        self.frames.merge(&other.frames);
    }
}

/// Split items across `workers` lists, item `i` going to worker `i % workers`
pub fn assign_round_robin<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1);
    let mut lists: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        lists[i % workers].push(item);
    }
    lists
}

// ============================================================================
// Worker
// ============================================================================

/// Polls a fixed set of receive queues and feeds every burst to the table.
pub struct IngestWorker<S: PacketSource> {
    id: usize,
    source: S,
    table: Arc<FlowTable>,
    shutdown: Arc<AtomicBool>,
    idle_backoff: Duration,
    counters: Arc<SharedEtherCounts>,
    stats: IngestStats,
}

impl<S: PacketSource> IngestWorker<S> {
    pub fn new(
        id: usize,
        source: S,
        table: Arc<FlowTable>,
        shutdown: Arc<AtomicBool>,
        idle_backoff: Duration,
    ) -> Self {
        Self {
            id,
            source,
            table,
            shutdown,
            idle_backoff,
            counters: Arc::default(),
            stats: IngestStats::default(),
        }
    }

    /// Publish per-type frame counts to `counters` after every burst.
    pub fn with_counters(mut self, counters: Arc<SharedEtherCounts>) -> Self {
        self.counters = counters;
        self
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Loop until shutdown is requested or every queue is exhausted.
    ///
    /// The shutdown flag is checked once per pass over all queues, so a
    /// burst already pulled is always classified completely.
    pub fn run(mut self) -> Result<IngestStats, anyhow::Error> {
        info!(
            "Ingest worker {} polling {} queue(s)",
            self.id,
            self.source.queue_count()
        );
        let mut burst = Burst::default();

        while !self.shutdown.load(Ordering::Relaxed) {
            let received = self.poll_pass(&mut burst)?;
            if received == 0 {
                if self.source.is_exhausted() {
                    info!("Ingest worker {} has no more packets", self.id);
                    break;
                }
                thread::sleep(self.idle_backoff);
            }
        }

        info!(
            "Ingest worker {} stopped after {} packets",
            self.id, self.stats.packets
        );
        Ok(self.stats)
    }

    /// One pass over every queue in order; returns the packets received.
    pub fn poll_pass(&mut self, burst: &mut Burst) -> Result<usize, anyhow::Error> {
        let mut received = 0;

        for queue in 0..self.source.queue_count() {
            let n = self.source.rx_burst(queue, burst)?;
            if n == 0 {
                continue;
            }

            if log_enabled!(Level::Trace) {
                self.trace_burst(queue, burst);
            }
            let mut frames = EtherCounts::default();
            classify_burst(&self.table, burst.frames(), &mut frames)?;
            burst.release();
            self.stats.frames.merge(&frames);
            self.counters.add(&frames);

            self.count(n as u64);
            received += n;
        }

        self.stats.passes += 1;
        Ok(received)
    }

    fn count(&mut self, n: u64) {
        let before = self.stats.packets;
        self.stats.packets += n;
        self.stats.bursts += 1;

        let crossed = self.stats.packets / PROGRESS_INTERVAL;
        if crossed > before / PROGRESS_INTERVAL {
            info!("{} packets received", crossed * PROGRESS_INTERVAL);
        }
    }

    fn trace_burst(&self, queue: usize, burst: &Burst) {
        let name = self.source.queue_name(queue);
        for frame in burst.frames() {
            if frame.len() < EthHdr::LEN {
                continue;
            }
            let mut dst = [0u8; 6];
            let mut src = [0u8; 6];
            dst.copy_from_slice(&frame[0..6]);
            src.copy_from_slice(&frame[6..12]);
            trace!(
                "src {} dst {} queue {}",
                format_mac(&src),
                format_mac(&dst),
                name
            );
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

// Raises the shutdown flag when a worker thread unwinds
struct StopOnPanic(Arc<AtomicBool>);

impl Drop for StopOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::Relaxed);
        }
    }
}

/// Owns the worker threads that share one flow table.
pub struct IngestManager {
    table: Arc<FlowTable>,
    shutdown: Arc<AtomicBool>,
    config: IngestConfig,
    counters: Arc<SharedEtherCounts>,
    workers: Vec<JoinHandle<Result<IngestStats, anyhow::Error>>>,
}

impl IngestManager {
    pub fn new(table: Arc<FlowTable>, shutdown: Arc<AtomicBool>, config: IngestConfig) -> Self {
        Self {
            table,
            shutdown,
            config,
            counters: Arc::default(),
            workers: Vec::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Frame counts summed over every worker, updated per burst
    pub fn counters(&self) -> Arc<SharedEtherCounts> {
        Arc::clone(&self.counters)
    }

    /// Spawn one thread per source. Worker `i` is pinned to core `i` when
    /// pinning is enabled. A worker that fails or panics raises the shutdown
    /// flag so the rest stop too.
    pub fn start<S>(&mut self, sources: Vec<S>) -> Result<(), anyhow::Error>
    where
        S: PacketSource + 'static,
    {
        for source in sources {
            let id = self.workers.len();
            let worker = IngestWorker::new(
                id,
                source,
                Arc::clone(&self.table),
                Arc::clone(&self.shutdown),
                self.config.idle_backoff,
            )
            .with_counters(Arc::clone(&self.counters));
            let shutdown = Arc::clone(&self.shutdown);
            let pin = self.config.pin_cores;

            let handle = thread::Builder::new()
                .name(format!("ingest-{}", id))
                .spawn(move || {
                    let _guard = StopOnPanic(Arc::clone(&shutdown));
                    if pin {
                        match pin_current_thread(id) {
                            Ok(()) => debug!("Ingest worker {} pinned to core {}", id, id),
                            Err(e) => warn!("Failed to pin ingest worker {}: {}", id, e),
                        }
                    }
                    let result = worker.run();
                    if let Err(e) = &result {
                        error!("Ingest worker {} failed: {}", id, e);
                        shutdown.store(true, Ordering::Relaxed);
                    }
                    result
                })?;
            self.workers.push(handle);
        }

        info!("Started {} ingest worker(s)", self.workers.len());
        Ok(())
    }

    /// Block until every worker has exited; returns the summed counters or
    /// the first worker error.
    pub fn join(self) -> Result<IngestStats, anyhow::Error> {
        let mut total = IngestStats::default();
        let mut first_error = None;

        for (id, handle) in self.workers.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(stats)) => total.merge(&stats),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(anyhow::anyhow!("ingest worker {} panicked", id));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}
