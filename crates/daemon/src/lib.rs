//! bpfsync daemon client
//!
//! Typed access to the program-loading daemon: the wire protocol, a Unix
//! socket client, an in-memory stand-in, map pin discovery and the adapter the
//! reconciler drives.
//!
//! # Protocol
//!
//! Every call is one request frame answered by one response frame:
//! - **Length prefix**: 4-byte big-endian u32 indicating payload size
//! - **Payload**: bincode-encoded [`DaemonRequest`] or [`DaemonResponse`]
//!
//! ```text
//! +--------+--------+--------+--------+--------------------------+
//! | Byte 0 | Byte 1 | Byte 2 | Byte 3 | Bytes 4..(4+N)           |
//! |--------+--------+--------+--------+--------------------------|
//! |     Length (big-endian u32)       |    Bincode Payload       |
//! |       N = payload size            |    (N bytes)             |
//! +--------+--------+--------+--------+--------------------------+
//! ```
//!
//! # Constraints
//!
//! - Maximum payload size: 1MB (1,048,576 bytes)
//! - Empty payloads (length = 0) are rejected
//! - A failed call drops the connection; the next call reconnects

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod adapter;
mod client;
mod error;
mod maps;
mod memory;
mod messages;
mod rpc;
mod transport;

pub use adapter::{DaemonAdapter, LoadedProgram, Observed};
pub use client::{SocketDaemonClient, serve_connection};
pub use error::{IoOp, RpcError, StatusCode, TransportError, TransportResult};
pub use maps::{DEFAULT_MAP_ROOT, MapDiscovery};
pub use memory::{CallCounts, InMemoryDaemon};
pub use messages::{
    DaemonRequest, DaemonResponse, ImageLocation, KernelInfo, ListRequest, ListResult, Location,
    LoadRequest, UnloadRequest,
};
pub use rpc::DaemonRpc;
pub use transport::FrameTransport;

/// Maximum allowed payload size in bytes (1MB)
pub const MAX_PAYLOAD_SIZE: usize = 1_048_576;

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;
