//! In-process RPC serving framework.
//!
//! One TCP listener speaks two protocols: length-prefixed binary RPC and
//! HTTP-wrapped JSON. Requests are routed by opname to methods registered
//! in a [`method::MethodRegistry`], with per-call context, call tracking,
//! admission control and graceful drain.

pub mod method;
pub mod network;
pub mod service;
pub mod tracker;

pub use method::{CallContext, MethodRegistry, RegistryBuilder, ServerMethod};
pub use network::{NetworkConfig, RpcClient, ServeOutcome};
pub use service::{RpcServer, ServerConfig};
pub use tracker::CallTracker;
