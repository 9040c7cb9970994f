//! The RPC server core.
//!
//! 1. **Server** (`server`): binds the method registry to the acceptor and
//!    dispatches binary-framed calls
//! 2. **Routing** (`router`): HTTP admin opnames, JSON calls, static files
//! 3. **Admin pages** (`admin`): usage, status, threads, health probe
//! 4. **Recording** (`recording`): live traffic capture

pub mod admin;
pub mod config;
pub mod recording;
pub mod router;
pub mod server;

pub use admin::{HealthProbe, TcpProbe};
pub use config::{HealthConfig, RecordingConfig, ServerConfig};
pub use recording::TrafficRecorder;
pub use server::{BoundServer, RpcServer};
