use std::time::Duration;
use thiserror::Error;

use crate::ring::Score;

/// Ring error types
#[derive(Debug, Error)]
pub enum RingError {
    #[error("Node already exists: {0}")]
    NodeAlreadyExists(String),

    #[error("Invalid virtual node id: {0}")]
    InvalidVirtualNodeId(String),

    #[error("Virtual node not found at score {0}")]
    VirtualNodeNotFound(Score),

    #[error("Ring lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("Ring lock not held")]
    LockNotHeld,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RingError {
    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeAlreadyExists(_) => "node_exists",
            Self::InvalidVirtualNodeId(_) => "invalid_vnode_id",
            Self::VirtualNodeNotFound(_) => "vnode_not_found",
            Self::LockTimeout(_) => "lock_timeout",
            Self::LockNotHeld => "lock_not_held",
            Self::Cancelled => "cancelled",
            Self::Store(_) => "store",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for RingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Ring result type
pub type RingResult<T> = Result<T, RingError>;
