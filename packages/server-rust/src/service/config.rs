use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::method::{ResponseLimits, SessionConfig};

/// Server-level configuration for dispatch, admin pages, and recording.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Comma-separated server identities whose methods this server serves.
    pub identities: String,
    /// Root directory for static file fallback.
    pub webroot: PathBuf,
    /// Pretty-print JSON replies unless the caller passes `d`.
    pub debug_json: bool,
    /// Largest encoded binary reply payload.
    pub max_binary_response_size: usize,
    /// Largest encoded JSON reply payload.
    pub max_json_response_size: usize,
    /// Close every connection after its first reply.
    pub one_request_per_connection: bool,
    pub recording: RecordingConfig,
    pub session: SessionConfig,
    pub health: HealthConfig,
}

impl ServerConfig {
    #[must_use]
    pub fn response_limits(&self) -> ResponseLimits {
        ResponseLimits {
            max_binary: self.max_binary_response_size,
            max_json: self.max_json_response_size,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            identities: String::new(),
            webroot: PathBuf::from("."),
            debug_json: false,
            max_binary_response_size: 100_000_000,
            max_json_response_size: 100_000_000,
            one_request_per_connection: false,
            recording: RecordingConfig::default(),
            session: SessionConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Traffic capture settings. File names get `_<port>` appended.
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub input_path: PathBuf,
    /// Replies are captured only when set.
    pub output_path: Option<PathBuf>,
    /// Recording stops taking entries this long after `_startrecord`.
    pub max_duration: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("recorded_input"),
            output_path: None,
            max_duration: Duration::from_secs(3600),
        }
    }
}

/// Outbound connectivity probe used by `_health`.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Candidate targets. An empty list always reports healthy.
    pub targets: Vec<SocketAddr>,
    pub connect_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            connect_timeout: Duration::from_secs(2),
        }
    }
}
