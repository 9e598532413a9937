//! Session-layer error types.
//!
//! Every session primitive returns [`DbError`] on failure. Native driver
//! failures keep their original error as the source so callers can inspect
//! engine-specific codes, while the session's own failures (binding, state,
//! configuration) carry a human-readable message.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the session layer and its engine adapters.
#[derive(Debug, Error)]
pub enum DbError {
    /// Invalid or missing credentials, or an unusable configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Parameters or data could not be bound to a native command.
    #[error("bind error: {0}")]
    Bind(String),

    /// The session is in the wrong state for the requested operation.
    #[error("invalid session state: {0}")]
    State(String),

    /// A query that must return rows returned none.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine does not support the requested operation.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// PostgreSQL, MySQL or SQLite driver error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// SQL Server driver error.
    #[cfg(feature = "sqlserver")]
    #[error("sql server error: {0}")]
    SqlServer(#[from] tiberius::error::Error),

    /// Oracle driver error.
    #[cfg(feature = "oracle")]
    #[error("oracle error: {0}")]
    Oracle(#[from] oracle_rs::Error),

    /// File system failure while writing exports or blobs.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The command did not complete within its timeout.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// A value could not be converted to the requested Rust type.
    #[error("cannot convert {value} to {target}")]
    Conversion {
        /// Requested Rust type.
        target: &'static str,
        /// Rendering of the offending value.
        value: String,
    },
}

impl DbError {
    /// Returns `true` if the error originated in a native database driver.
    pub fn is_native(&self) -> bool {
        match self {
            DbError::Sqlx(_) => true,
            #[cfg(feature = "sqlserver")]
            DbError::SqlServer(_) => true,
            #[cfg(feature = "oracle")]
            DbError::Oracle(_) => true,
            _ => false,
        }
    }

    pub(crate) fn conversion(target: &'static str, value: impl std::fmt::Display) -> Self {
        DbError::Conversion {
            target,
            value: value.to_string(),
        }
    }

    pub(crate) fn not_open() -> Self {
        DbError::State("connection is not open".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_classification() {
        assert!(DbError::Sqlx(sqlx::Error::RowNotFound).is_native());
        assert!(!DbError::Bind("x".into()).is_native());
        assert!(!DbError::Timeout(Duration::from_secs(1)).is_native());
    }

    #[test]
    fn test_display_messages() {
        let err = DbError::conversion("i64", "abc");
        assert_eq!(err.to_string(), "cannot convert abc to i64");

        let err = DbError::not_open();
        assert_eq!(err.to_string(), "invalid session state: connection is not open");
    }
}
