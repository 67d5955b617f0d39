//! Error types for the transaction coordinator
//!
//! This module defines the error taxonomy used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! Errors fall into three classes:
//! - Attempt-level outcomes (`ConcurrentModification`, `AttemptExpired`,
//!   `AttemptAlreadyResolved`) that unwind or conclude a whole attempt.
//! - Store-level outcomes (`CasMismatch`, `DocNotFound`, `PathNotFound`,
//!   `PathExists`, `TransientStore`, `TerminalStore`) surfaced by the KV
//!   collaborator and classified as retryable or not via `is_transient()`.
//! - `ProtocolInvariantViolation`: an illegal state transition was
//!   observed. Always a bug, never retried.

use crate::types::AttemptId;
use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the transaction coordinator
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Another writer raced this attempt on a document
    ///
    /// Attempt-retryable: the application may retry the whole attempt,
    /// never just the losing write.
    #[error("concurrent modification of document {id}")]
    ConcurrentModification {
        /// Document that lost the race
        id: String,
    },

    /// The attempt's expiry elapsed before it finished
    ///
    /// Not retryable by the same attempt. Only a cleanup sweeper may
    /// resolve the attempt from here on.
    #[error("attempt {attempt_id} has exceeded its expiry")]
    AttemptExpired {
        /// The expired attempt
        attempt_id: AttemptId,
    },

    /// Another actor (usually a sweeper) already decided this attempt
    ///
    /// Callers treat this as success: the effect on the documents is the
    /// same whoever drove the resolution.
    #[error("attempt {attempt_id} was already resolved by another actor")]
    AttemptAlreadyResolved {
        /// The attempt that was resolved elsewhere
        attempt_id: AttemptId,
    },

    /// CAS token did not match the document's current token
    #[error("CAS mismatch on document {id}")]
    CasMismatch {
        /// Document whose token moved
        id: String,
    },

    /// Document does not exist
    #[error("document not found: {id}")]
    DocNotFound {
        /// Missing document
        id: String,
    },

    /// Sub-document path does not exist within the document
    #[error("subdocument path not found: {id} {path}")]
    PathNotFound {
        /// Document holding the path
        id: String,
        /// The missing path
        path: String,
    },

    /// Sub-document path already exists where a create was requested
    #[error("subdocument path already exists: {id} {path}")]
    PathExists {
        /// Document holding the path
        id: String,
        /// The conflicting path
        path: String,
    },

    /// Transient store failure (timeout, overload, topology movement)
    ///
    /// Absorbed by the retry policy; never surfaced to callers unless the
    /// retry deadline is exhausted.
    #[error("transient store failure: {message}")]
    TransientStore {
        /// What the store reported
        message: String,
    },

    /// Terminal store failure (permission denied, bucket missing)
    #[error("terminal store failure: {message}")]
    TerminalStore {
        /// What the store reported
        message: String,
    },

    /// An illegal state transition was observed
    ///
    /// For example an entry found ROLLED_BACK and then asked to commit.
    /// Always a bug somewhere; logged loudly and never retried.
    #[error("protocol invariant violated: {message}")]
    ProtocolInvariantViolation {
        /// Description of the violated invariant
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether the retry policy may absorb this error
    ///
    /// Only transient store failures qualify. CAS mismatches are
    /// deliberately excluded: the non-decision CAS loops re-read the
    /// document and retry with a fresh token instead of blindly
    /// re-issuing the same write, and a mismatch at a decision point is
    /// terminal for the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStore { .. })
    }

    /// Convenience constructor for invariant violations
    pub fn invariant(message: impl Into<String>) -> Self {
        Error::ProtocolInvariantViolation {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_concurrent_modification() {
        let err = Error::ConcurrentModification {
            id: "orders/ord-17".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("concurrent modification"));
        assert!(msg.contains("orders/ord-17"));
    }

    #[test]
    fn test_error_display_attempt_expired() {
        let attempt_id = AttemptId::new();
        let err = Error::AttemptExpired { attempt_id };
        let msg = err.to_string();
        assert!(msg.contains("exceeded its expiry"));
        assert!(msg.contains(&attempt_id.to_string()));
    }

    #[test]
    fn test_error_display_already_resolved() {
        let attempt_id = AttemptId::new();
        let err = Error::AttemptAlreadyResolved { attempt_id };
        assert!(err.to_string().contains("already resolved"));
    }

    #[test]
    fn test_error_display_path_variants() {
        let missing = Error::PathNotFound {
            id: "_txn:atr-3".to_string(),
            path: "attempts.xyz".to_string(),
        };
        assert!(missing.to_string().contains("attempts.xyz"));

        let exists = Error::PathExists {
            id: "_txn:atr-3".to_string(),
            path: "attempts.xyz".to_string(),
        };
        assert!(exists.to_string().contains("already exists"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientStore {
            message: "timeout".to_string()
        }
        .is_transient());

        assert!(!Error::TerminalStore {
            message: "permission denied".to_string()
        }
        .is_transient());

        assert!(!Error::CasMismatch {
            id: "doc".to_string()
        }
        .is_transient());

        assert!(!Error::invariant("entry ROLLED_BACK asked to commit").is_transient());
    }

    #[test]
    fn test_error_from_serde_json() {
        let result: std::result::Result<u64, serde_json::Error> =
            serde_json::from_str("not-a-number");
        let err: Error = result.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(7)
        }
        assert_eq!(returns_result().unwrap(), 7);
    }
}
