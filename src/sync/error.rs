use thiserror::Error;

use crate::convergent::{OpId, OperationError};
use crate::mindmap::StoreError;

/// Failures reported by a transport send
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("Unknown replica: {0}")]
    UnknownReplica(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Why a queued operation never completed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Operation {0} was cancelled")]
    Cancelled(OpId),

    #[error("Operation {id} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        id: OpId,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Operation queue closed")]
    Closed,

    #[error("No conflict entry for operation {0}")]
    NotInConflicts(OpId),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Operation cannot be applied to the current document: {0}")]
    Precondition(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
