//! Network configuration for the connection acceptor.

use std::time::Duration;

/// Listener, admission, and drain settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Connections beyond this count are answered with `busy_message` and closed.
    pub max_connections: usize,
    /// Per-request read timeout. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Largest request a connection may buffer before it is refused.
    pub max_request_size: usize,
    /// Number of pool workers, or `None` to spawn one task per connection.
    pub worker_pool: Option<usize>,
    /// Upper bound on the drain phase after shutdown is requested.
    pub drain_timeout: Duration,
    /// How often the drain phase re-checks pending work.
    pub drain_poll_interval: Duration,
    /// How often the accept loop wakes while idle.
    pub accept_poll_interval: Duration,
    /// Sent to connections rejected by admission control.
    pub busy_message: String,
}

impl NetworkConfig {
    /// Default worker count when the pool is switched on without a size.
    pub const DEFAULT_POOL_SIZE: usize = 512;
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            max_connections: 1024,
            request_timeout: Some(Duration::from_secs(60)),
            max_request_size: 100_000_000,
            worker_pool: None,
            drain_timeout: Duration::from_secs(60),
            drain_poll_interval: Duration::from_secs(1),
            accept_poll_interval: Duration::from_secs(1),
            busy_message: "Server busy, please try again later.\n".to_string(),
        }
    }
}
