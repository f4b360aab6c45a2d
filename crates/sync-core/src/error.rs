//! Error taxonomy shared by every store and pipeline stage.
//!
//! Data malformation is deliberately absent: the row transformer absorbs it
//! by substituting defaults, so it never reaches the run controller.

use thiserror::Error;

/// Fatal error raised by a store or by statement preparation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Source or target store unreachable, or connection dropped mid-run
    #[error("Connection to {store} failed: {message}")]
    Connectivity { store: String, message: String },

    /// Malformed SQL, constraint violation or any other statement failure
    #[error("Statement failed on {store}: {message}")]
    Statement { store: String, message: String },

    /// The target table resolved without primary-key columns
    #[error("Table {0} has no primary key - upsert requires key columns")]
    NoPrimaryKey(String),

    /// Identifier rejected by the allow-list before interpolation
    #[error("Invalid identifier {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: String },

    /// Any other configuration problem detected before target mutation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Staging artifact could not be written or read
    #[error("Staging error: {0}")]
    Staging(String),
}

impl SyncError {
    pub fn connectivity(store: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Connectivity {
            store: store.into(),
            message: message.to_string(),
        }
    }

    pub fn statement(store: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Statement {
            store: store.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_identifier(name: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::InvalidIdentifier {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True for errors detected before anything touched the target store.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SyncError::NoPrimaryKey(_)
                | SyncError::InvalidIdentifier { .. }
                | SyncError::Configuration(_)
        )
    }
}

/// Result alias for store and preparation operations.
pub type Result<T> = std::result::Result<T, SyncError>;
