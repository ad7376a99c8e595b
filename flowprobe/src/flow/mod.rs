pub mod clock;
pub mod extract;
pub mod hash;
pub mod table;

pub use extract::{extract_flow_key, FrameError, Ipv4View};
pub use table::{FlowTable, FlowTableError};
