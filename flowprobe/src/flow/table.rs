use super::clock::{Clock, SystemClock};
use super::extract::Ipv4View;
use super::hash::bucket_hash;
use flowprobe_common::{FlowKey, FlowRecord, FlowTotals, MAX_ENTRIES};
use network_types::ip::IpProto;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// Spins on try_lock before parking on a contended bucket
const SPIN_LIMIT: u32 = 64;

// Timed wait between shutdown checks for interruptible acquisition
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum FlowTableError {
    #[error("flow table capacity must be greater than 0")]
    ZeroCapacity,

    #[error("flow table capacity {0} is not a power of two")]
    NotPowerOfTwo(u32),

    #[error("cannot allocate {0} flow table buckets")]
    TableAllocation(u32),

    #[error("cannot allocate a flow record in bucket {bucket}")]
    RecordAllocation { bucket: usize },

    #[error("flow table walk interrupted by shutdown")]
    Interrupted,
}

/// Bucket usage, counted over full chains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableOccupancy {
    pub used_buckets: usize,
    pub records: usize,
    pub longest_chain: usize,
}

impl TableOccupancy {
    fn add_chain(&mut self, len: usize) {
        if len > 0 {
            self.used_buckets += 1;
            self.records += len;
            self.longest_chain = self.longest_chain.max(len);
        }
    }
}

/// One slot of the table: a record slab whose index order is the collision
/// chain (index 0 is the chain head), behind its own lock.
#[derive(Default)]
struct Bucket {
    chain: Mutex<Vec<FlowRecord>>,
}

impl Bucket {
    fn lock(&self) -> MutexGuard<'_, Vec<FlowRecord>> {
        for _ in 0..SPIN_LIMIT {
            if let Some(guard) = self.chain.try_lock() {
                return guard;
            }
            std::hint::spin_loop();
        }
        self.chain.lock()
    }

    fn lock_interruptible(&self, shutdown: &AtomicBool) -> Option<MutexGuard<'_, Vec<FlowRecord>>> {
        loop {
            if shutdown.load(Ordering::Acquire) {
                return None;
            }
            if let Some(guard) = self.chain.try_lock_for(INTERRUPT_POLL) {
                return Some(guard);
            }
        }
    }
}

/// Fixed-capacity flow cache with one lock per bucket.
pub struct FlowTable {
    buckets: Box<[Bucket]>,
    n_entries: u32,
    seed: u32,
    clock: Arc<dyn Clock>,
}

impl FlowTable {
    pub fn create(requested_capacity: u32, hash_seed: u32) -> Result<Self, FlowTableError> {
        Self::create_with_clock(requested_capacity, hash_seed, Arc::new(SystemClock))
    }

    /// Requests above [`MAX_ENTRIES`] are clamped before validation.
    pub fn create_with_clock(
        requested_capacity: u32,
        hash_seed: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FlowTableError> {
        let mut n_entries = requested_capacity;
        if n_entries > MAX_ENTRIES {
            log::warn!(
                "Requested {} entries is larger than MAX_ENTRIES ({}), clamping",
                n_entries,
                MAX_ENTRIES
            );
            n_entries = MAX_ENTRIES;
        }

        if n_entries == 0 {
            return Err(FlowTableError::ZeroCapacity);
        }
        if !n_entries.is_power_of_two() {
            return Err(FlowTableError::NotPowerOfTwo(n_entries));
        }

        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(n_entries as usize)
            .map_err(|_| FlowTableError::TableAllocation(n_entries))?;
        buckets.resize_with(n_entries as usize, Bucket::default);

        log::debug!(
            "Flow table created: {} buckets, seed {:#010x}",
            n_entries,
            hash_seed
        );

        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            n_entries,
            seed: hash_seed,
            clock,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.n_entries
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn bucket_index(&self, key: &FlowKey) -> usize {
        (bucket_hash(key, self.seed) % self.n_entries) as usize
    }

    /// Account one packet to its flow, creating the record on first sight.
    ///
    /// Records are matched on (ip_src, ip_dst) only. Allocation failure is
    /// returned as [`FlowTableError::RecordAllocation`] and the packet is not
    /// accounted.
    pub fn upsert(&self, key: &FlowKey, ip: &Ipv4View<'_>) -> Result<(), FlowTableError> {
        let idx = self.bucket_index(key);
        let mut chain = self.buckets[idx].lock();
        let now = self.clock.now_micros();

        if let Some(record) = chain.iter_mut().find(|r| r.matches(key)) {
            accumulate(record, key, ip, now);
            return Ok(());
        }

        if !chain.is_empty() {
            log::trace!("Bucket collision at {} (chain length {})", idx, chain.len());
        }

        // First record of a bucket gets an exact-size slab
        let reserved = if chain.is_empty() {
            chain.try_reserve_exact(1)
        } else {
            chain.try_reserve(1)
        };
        reserved.map_err(|_| FlowTableError::RecordAllocation { bucket: idx })?;

        let mut record = FlowRecord::from_key(key, now);
        accumulate(&mut record, key, ip, now);
        chain.push(record);
        Ok(())
    }

    /// Chain heads in ascending bucket order. Longer chains are not walked.
    pub fn snapshot(&self) -> Vec<FlowRecord> {
        let mut heads = Vec::new();
        self.for_each_head(|head| heads.push(*head));
        heads
    }

    pub fn snapshot_interruptible(
        &self,
        shutdown: &AtomicBool,
    ) -> Result<Vec<FlowRecord>, FlowTableError> {
        let mut heads = Vec::new();
        self.for_each_head_interruptible(shutdown, |head| heads.push(*head))?;
        Ok(heads)
    }

    pub fn aggregate_totals(&self) -> FlowTotals {
        let mut totals = FlowTotals::default();
        self.for_each_head(|head| add_head(&mut totals, head));
        totals
    }

    pub fn aggregate_totals_interruptible(
        &self,
        shutdown: &AtomicBool,
    ) -> Result<FlowTotals, FlowTableError> {
        let mut totals = FlowTotals::default();
        self.for_each_head_interruptible(shutdown, |head| add_head(&mut totals, head))?;
        Ok(totals)
    }

    /// Text dump of every chain head.
    pub fn snapshot_dump(&self) -> String {
        let mut out = dump_header(self.n_entries);
        self.for_each_head(|head| push_record(&mut out, head));
        out
    }

    pub fn snapshot_dump_interruptible(
        &self,
        shutdown: &AtomicBool,
    ) -> Result<String, FlowTableError> {
        let mut out = dump_header(self.n_entries);
        self.for_each_head_interruptible(shutdown, |head| push_record(&mut out, head))?;
        Ok(out)
    }

    /// Streaming form of [`FlowTable::snapshot_dump`] for the final report.
    pub fn write_dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(dump_header(self.n_entries).as_bytes())?;
        for bucket in self.buckets.iter() {
            // Copy the head out so the lock is not held across I/O
            let head = bucket.lock().first().copied();
            if let Some(head) = head {
                write!(out, "{}", DumpRecord(&head))?;
            }
        }
        Ok(())
    }

    pub fn occupancy(&self) -> TableOccupancy {
        let mut occupancy = TableOccupancy::default();
        for bucket in self.buckets.iter() {
            occupancy.add_chain(bucket.lock().len());
        }
        occupancy
    }

    pub fn occupancy_interruptible(
        &self,
        shutdown: &AtomicBool,
    ) -> Result<TableOccupancy, FlowTableError> {
        let mut occupancy = TableOccupancy::default();
        for bucket in self.buckets.iter() {
            let len = bucket
                .lock_interruptible(shutdown)
                .ok_or(FlowTableError::Interrupted)?
                .len();
            occupancy.add_chain(len);
        }
        Ok(occupancy)
    }

    /// Release the table. Bucket slabs own their records, so every record
    /// goes with it.
    pub fn destroy(self) {
        log::debug!("Releasing flow table of {} buckets", self.n_entries);
        drop(self);
    }

    fn for_each_head<F: FnMut(&FlowRecord)>(&self, mut f: F) {
        for bucket in self.buckets.iter() {
            let chain = bucket.lock();
            if let Some(head) = chain.first() {
                f(head);
            }
        }
    }

    fn for_each_head_interruptible<F: FnMut(&FlowRecord)>(
        &self,
        shutdown: &AtomicBool,
        mut f: F,
    ) -> Result<(), FlowTableError> {
        for bucket in self.buckets.iter() {
            let chain = bucket
                .lock_interruptible(shutdown)
                .ok_or(FlowTableError::Interrupted)?;
            if let Some(head) = chain.first() {
                f(head);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn chain(&self, bucket: usize) -> Vec<FlowRecord> {
        self.buckets[bucket].lock().clone()
    }
}

fn accumulate(record: &mut FlowRecord, key: &FlowKey, ip: &Ipv4View<'_>, now: u64) {
    record.tos_bits |= ip.tos();

    if key.proto == IpProto::Tcp as u8 {
        if let Some(flags) = ip.tcp_flags() {
            record.tcp_flags |= flags;
        }
    }

    record.bytes_sent += ip.total_length() as u64;
    record.packets_sent += 1;
    record.last_seen = now;
}

fn add_head(totals: &mut FlowTotals, head: &FlowRecord) {
    totals.total_bytes_sent += head.bytes_sent;
    totals.total_packets_sent += head.packets_sent;
}

fn dump_header(n_entries: u32) -> String {
    format!("t->n_entries = {}\n", n_entries)
}

fn push_record(out: &mut String, head: &FlowRecord) {
    out.push_str(&DumpRecord(head).to_string());
}

/// One record in dump layout, blank line included
struct DumpRecord<'a>(&'a FlowRecord);

impl fmt::Display for DumpRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.0;
        writeln!(f, "src_ip = {}", r.ip_src)?;
        writeln!(f, "dst_ip = {}", r.ip_dst)?;
        writeln!(f, "src_port = {}", r.port_src)?;
        writeln!(f, "dst_port = {}", r.port_dst)?;
        writeln!(f, "proto = {}", r.proto)?;
        writeln!(f, "bytes_sent = {}", r.bytes_sent)?;
        writeln!(f, "bytes_recv = {}", r.bytes_received)?;
        writeln!(f, "packets_sent = {}", r.packets_sent)?;
        writeln!(f, "packets_recv = {}", r.packets_received)?;
        writeln!(f)
    }
}
