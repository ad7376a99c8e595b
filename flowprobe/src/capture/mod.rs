pub mod pcap_source;

use flowprobe_common::MAX_PKT_BURST;
use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

pub use pcap_source::{CaptureConfig, PcapSource};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open capture {queue}: {source}")]
    Open {
        queue: String,
        #[source]
        source: pcap::Error,
    },

    #[error("capture error on {queue}: {source}")]
    Receive {
        queue: String,
        #[source]
        source: pcap::Error,
    },

    #[error("queue {0} does not exist")]
    NoSuchQueue(usize),
}

/// Where one receive queue reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSpec {
    Live(String),
    File(PathBuf),
}

impl Display for CaptureSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureSpec::Live(iface) => write!(f, "iface:{}", iface),
            CaptureSpec::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Reusable frame buffers for one poll of one queue.
///
/// Buffers keep their allocation across polls; `release` hands every slot
/// back for the next burst.
#[derive(Debug)]
pub struct Burst {
    frames: Vec<Vec<u8>>,
    len: usize,
}

impl Default for Burst {
    fn default() -> Self {
        Self::with_capacity(MAX_PKT_BURST)
    }
}

impl Burst {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: (0..capacity).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.frames.len()
    }

    /// Copy a frame into the next free slot. Returns false when full.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.is_full() {
            return false;
        }
        let slot = &mut self.frames[self.len];
        slot.clear();
        slot.extend_from_slice(data);
        self.len += 1;
        true
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames[..self.len]
    }

    pub fn release(&mut self) {
        self.len = 0;
    }
}

/// A set of receive queues polled by one ingest worker
pub trait PacketSource: Send {
    fn queue_count(&self) -> usize;

    fn queue_name(&self, queue: usize) -> &str;

    /// Fill `burst` with at most its capacity of frames from `queue`;
    /// returns how many were added. Never blocks waiting for traffic.
    fn rx_burst(&mut self, queue: usize, burst: &mut Burst) -> Result<usize, SourceError>;

    /// True once no queue can produce packets again (end of capture files)
    fn is_exhausted(&self) -> bool {
        false
    }
}
