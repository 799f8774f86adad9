use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors an operation reports back to its caller through the completion
/// frame. They are expected outcomes, never fatal to the server process.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityError {
    #[error("Entity '{type_name}:{name}' not found")]
    NotFound { type_name: String, name: String },

    #[error("Entity '{type_name}:{name}' already exists")]
    AlreadyExists { type_name: String, name: String },

    #[error(
        "Entity '{type_name}:{name}' version mismatch: requested {requested}, server supports {}",
        describe_supported(.expected)
    )]
    VersionMismatch {
        type_name: String,
        name: String,
        expected: Option<u64>,
        requested: u64,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

fn describe_supported(expected: &Option<u64>) -> String {
    match expected {
        Some(version) => version.to_string(),
        None => "no version of this type".to_string(),
    }
}

impl EntityError {
    pub fn not_found(type_name: &str, name: &str) -> Self {
        Self::NotFound {
            type_name: type_name.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists(type_name: &str, name: &str) -> Self {
        Self::AlreadyExists {
            type_name: type_name.to_string(),
            name: name.to_string(),
        }
    }

    pub fn version_mismatch(
        type_name: &str,
        name: &str,
        expected: Option<u64>,
        requested: u64,
    ) -> Self {
        Self::VersionMismatch {
            type_name: type_name.to_string(),
            name: name.to_string(),
            expected,
            requested,
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Synchronization failed: {0}")]
    Sync(String),

    #[error("Server process is not running")]
    NotRunning,

    #[error("Server worker failed: {0}")]
    WorkerFailed(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl<T> From<std::sync::PoisonError<T>> for ServerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

/// Aborts the worker after a broken internal precondition.
///
/// The single execution order makes these states unreachable under correct
/// use, so continuing would only compound the inconsistency.
#[track_caller]
pub(crate) fn invariant_violation(detail: impl std::fmt::Display) -> ! {
    tracing::error!(%detail, "server invariant violated");
    panic!("server invariant violated: {detail}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_message_names_both_versions() {
        let err = EntityError::version_mismatch("Cache", "orders", Some(2), 1);
        assert_eq!(
            err.to_string(),
            "Entity 'Cache:orders' version mismatch: requested 1, server supports 2"
        );

        let unknown = EntityError::version_mismatch("Cache", "orders", None, 1);
        assert!(unknown.to_string().ends_with("no version of this type"));
    }

    #[test]
    fn entity_errors_convert_into_server_errors() {
        let err: ServerError = EntityError::not_found("Cache", "orders").into();
        assert!(matches!(err, ServerError::Entity(EntityError::NotFound { .. })));
    }
}
