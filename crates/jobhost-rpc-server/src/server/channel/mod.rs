//! Worker channels: the stream registry, the correlated transport and the
//! per-worker channel built on top of them.

mod pending;
pub mod registry;
pub mod transport;
mod worker_channel;

pub use pending::{PendingRequests, PendingResponse};
pub use registry::StreamRegistry;
pub use transport::{AttachedStream, InboundStream, OutboundSender, RpcTransport, read_loop};
pub use worker_channel::{
    ChannelOptions, ChannelParts, ChannelState, EventSender, WorkerChannel, WorkerEvent,
    WorkerStatus,
};
