pub mod classify;
pub mod counters;

pub use classify::{classify_burst, classify_packet, EtherKind, PREFETCH_OFFSET};
pub use counters::{EtherCounts, SharedEtherCounts};
