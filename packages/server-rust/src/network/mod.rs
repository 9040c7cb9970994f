//! Networking: framing, HTTP, connection acceptance, and shutdown control.

pub mod acceptor;
pub mod client;
pub mod config;
pub mod connection;
pub mod framing;
pub mod http;
pub mod pool;
pub mod shutdown;

pub use acceptor::{Acceptor, Processed, RequestProcessor, ServeOutcome};
pub use client::{ClientError, RpcClient};
pub use config::NetworkConfig;
pub use connection::{ConnectionGuard, ConnectionId, ConnectionInfo, ConnectionRegistry};
pub use framing::{FrameError, Framing, RawRequest, RequestCodec};
pub use shutdown::{HealthState, PendingRequest, ShutdownController, ShutdownKind};
