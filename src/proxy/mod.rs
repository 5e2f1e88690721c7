//! Frame routing between UI clients and pooled conductor connections

pub mod frame;
pub mod handle;
pub mod multiplexer;
pub mod pool;
pub mod registry;
pub mod router;

pub use frame::{inspect, FrameHeader, FrameKind};
pub use handle::{spawn_writer, ConnId, ConnectionHandle};
pub use multiplexer::{Multiplexer, ShardEvent, ShardHandle, ShardStatus};
pub use pool::{UpstreamConnector, UpstreamPool};
pub use registry::LocalRegistry;
pub use router::RequestRouter;
