//! # Error Types
//!
//! Error handling for the Galaxy coherence engine and its collaborators.

use crate::{LineId, NodeId};
use thiserror::Error;

/// Error types that can occur while running cache operations or handling
/// protocol messages.
///
/// # Error Categories
///
/// - **Application failures**: `Timeout`, `RefNotFound`, `Aborted`. Returned to
///   the caller whose operation failed; other in-flight operations are unaffected.
/// - **Transport failures**: `NodeNotFound`, `Network`. Absorbed inside the
///   engine (self-acknowledgment, retry via timeouts).
/// - **Contract breaches**: `ProtocolViolation`, `InvalidOperation`. Fatal and
///   never retried.
/// - **Capacity**: `ItemTooLarge`, rejected synchronously.
///
/// # Examples
///
/// ```rust
/// use galaxy_core::{GalaxyError, LineId};
///
/// let error = GalaxyError::Timeout { line: LineId::new(0x1_0000_0001) };
/// assert!(error.is_retryable());
///
/// let error = GalaxyError::protocol("backup ack for unmodified line");
/// assert!(error.is_fatal());
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalaxyError {
    /// A pending protocol exchange exceeded its deadline
    #[error("Timeout waiting on line {line}")]
    Timeout { line: LineId },

    /// No node in the cluster (including the server) owns the line
    #[error("Ref {line} not found")]
    RefNotFound { line: LineId },

    /// The transport could not reach a node that left the cluster
    #[error("Node {node} not found")]
    NodeNotFound { node: NodeId },

    /// A collaborator or caller broke the protocol contract
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// The operation is not valid in the current context
    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    /// Data larger than the configured maximum item size
    #[error("Item of {size} bytes exceeds maximum item size of {max} bytes")]
    ItemTooLarge { size: usize, max: usize },

    /// The operation's transaction was aborted before it completed
    #[error("Transaction aborted")]
    Aborted,

    /// Transient network failure
    #[error("Network error: {message}")]
    Network { message: String },

    /// Message encoding or decoding failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Buffer allocation failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results in the Galaxy data grid.
pub type Result<T> = std::result::Result<T, GalaxyError>;

impl GalaxyError {
    /// Creates a new network error with the given message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a new protocol violation with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use galaxy_core::GalaxyError;
    ///
    /// let error = GalaxyError::protocol("two concurrent slaves");
    /// assert!(!error.is_retryable());
    /// ```
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Determines if this error condition is potentially recoverable.
    ///
    /// Retryable errors are transient conditions: the same operation may
    /// succeed if issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Contract breaches that must be raised to the operator rather than
    /// handled locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. } | Self::Internal { .. })
    }
}

impl From<serde_json::Error> for GalaxyError {
    fn from(err: serde_json::Error) -> Self {
        GalaxyError::serialization(err.to_string())
    }
}

impl From<bincode::Error> for GalaxyError {
    fn from(err: bincode::Error) -> Self {
        GalaxyError::serialization(err.to_string())
    }
}
