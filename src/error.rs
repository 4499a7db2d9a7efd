//! Error types shared across the control plane

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A referenced object does not exist (in any consulted cache tier)
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Create raced with another writer
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Optimistic-concurrency failure on a write
    #[error("conflicting write on {kind} {name}")]
    Conflict { kind: &'static str, name: String },

    /// Transient storage or transport failure
    #[error("storage error: {0}")]
    Storage(String),

    /// A queue key did not have the expected `cluster|name` shape
    #[error("invalid key {0:?}")]
    InvalidKey(String),

    /// A resource schema could not be rendered as a resource definition
    #[error("schema translation failed: {0}")]
    SchemaTranslation(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation or programmer error surfaced at runtime
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Whether a retry has a chance of succeeding without any input changing.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        let err = Error::not_found("ApiExport", "root:a:e");
        assert!(err.is_not_found());
        assert!(!err.is_retriable());
        assert_eq!(err.to_string(), "ApiExport root:a:e not found");
    }

    #[test]
    fn test_retriable() {
        assert!(Error::Storage("connection reset".into()).is_retriable());
        assert!(!Error::Internal("bug".into()).is_retriable());
    }
}
