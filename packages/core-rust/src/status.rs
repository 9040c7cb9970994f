//! Result vocabulary shared by handlers, validators, and clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured error payload returned when a call fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error_msg: String,
}

impl ErrorMessage {
    #[must_use]
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error_msg: msg.into(),
        }
    }
}

/// Outcome of a method self-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodStatus {
    Valid,
    Invalid,
    NotImplemented,
}

impl MethodStatus {
    /// Label used in validation reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "PASSED",
            Self::Invalid => "FAILED",
            Self::NotImplemented => "NOT IMPLEMENTED",
        }
    }
}

impl fmt::Display for MethodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which calling convention carried a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Binary,
    Json,
}

impl Protocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }
}
