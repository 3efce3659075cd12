//! Running sessions and their client connections

mod multiplexer;
mod registry;

pub use multiplexer::{ConnectionId, ConnectionMultiplexer, Outbound, OutboundTx};
pub use registry::{SessionRegistry, StartOutcome};
