// src/error.rs
//! Error taxonomy of the collection loop.
//!
//! Collector errors are recovered inside the cycle, collaborator errors halt the
//! cycle of one channel, and nothing escapes `Orchestrator::run_cycle`.

use thiserror::Error;

use crate::collect::types::Channel;

/// Source-side failure reported by a `Collector`.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Source unreachable, slow or answering with a non-2xx status. The cycle
    /// treats this as "zero items found".
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Source answered but the payload cannot be parsed. Terminal for the cycle.
    #[error("malformed source payload: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unavailable(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Unavailable(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store unavailable: {0}")]
    Connectivity(String),

    #[error("store rejected item: {0}")]
    Constraint(String),

    #[error("store timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher unavailable: {0}")]
    Connectivity(String),

    #[error("cannot serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publisher returned non-success status: {status}")]
    NonSuccess { status: u16 },

    #[error("publish timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl From<reqwest::Error> for PublishError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => PublishError::NonSuccess {
                status: status.as_u16(),
            },
            None => PublishError::Connectivity(e.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint store unavailable: {0}")]
    Connectivity(String),

    #[error("checkpoint store timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// A collector emitted a record that breaks the item contract. The record is
/// dropped, the rest of the batch goes on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("item {source_ref} has no published_at")]
    MissingPublishedAt { source_ref: String },

    #[error("item {source_ref} has empty content")]
    EmptyContent { source_ref: String },

    #[error("item {source_ref} claims channel {found}, collector is {expected}")]
    ForeignChannel {
        source_ref: String,
        expected: Channel,
        found: Channel,
    },
}

/// Why a single channel's cycle stopped short.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("cycle cancelled")]
    Cancelled,

    #[error("cycle task aborted: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_transient() {
        assert!(FetchError::Unavailable("down".into()).is_transient());
        assert!(!FetchError::Malformed("bad xml".into()).is_transient());
    }

    #[test]
    fn contract_violation_names_the_item() {
        let v = ContractViolation::ForeignChannel {
            source_ref: "https://example.test/1".into(),
            expected: Channel::Dummy,
            found: Channel::TruthSocial,
        };
        assert_eq!(
            v.to_string(),
            "item https://example.test/1 claims channel truth_social, collector is dummy"
        );
    }
}
