//! Session construction: credentials, options and the builder.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{Adapter, EngineKind};

use super::error::DbError;
use super::lock::BulkInsertLock;
use super::Session;

/// Default timeout for ordinary commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default timeout for CSV exports and blob retrieval.
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

// =============================================================================
// Credentials
// =============================================================================

/// Connection credentials. For SQLite, `database` is the file path.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    /// 0 selects the engine's default port.
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl Credentials {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            database: database.into(),
        }
    }

    /// Credentials for a file-based engine.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            database: path.into(),
            ..Self::default()
        }
    }

    /// The configured port, or the engine default when 0.
    pub fn port_or_default(&self, kind: EngineKind) -> u16 {
        if self.port == 0 {
            kind.default_port()
        } else {
            self.port
        }
    }

    /// Checks the fields required by `kind`.
    ///
    /// # Errors
    /// Returns `DbError::Configuration` naming the first missing field.
    pub fn validate(&self, kind: EngineKind) -> Result<(), DbError> {
        let required: Vec<(&str, &str)> = if kind.is_file_based() {
            vec![("database", self.database.as_str())]
        } else {
            vec![
                ("host", self.host.as_str()),
                ("username", self.username.as_str()),
                ("database", self.database.as_str()),
            ]
        };
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(DbError::Configuration(format!(
                    "{kind} credentials require a non-empty {field}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"****")
            .field("database", &self.database)
            .finish()
    }
}

// =============================================================================
// Options
// =============================================================================

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub command_timeout: Duration,
    /// Timeout for CSV exports and blob retrieval.
    pub export_timeout: Duration,
    /// Folder for CSV files when the caller gives none.
    pub export_folder: PathBuf,
    /// Folder for blob files when the caller gives none.
    pub blob_folder: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            export_folder: PathBuf::from("exports"),
            blob_folder: PathBuf::from("blobs"),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Session`].
pub struct SessionBuilder {
    adapter: Arc<dyn Adapter>,
    credentials: Credentials,
    options: SessionOptions,
    bulk_lock: Option<BulkInsertLock>,
}

impl SessionBuilder {
    pub fn new(adapter: Arc<dyn Adapter>, credentials: Credentials) -> Self {
        Self {
            adapter,
            credentials,
            options: SessionOptions::default(),
            bulk_lock: None,
        }
    }

    /// Replace all options at once.
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.options.command_timeout = timeout;
        self
    }

    pub fn export_timeout(mut self, timeout: Duration) -> Self {
        self.options.export_timeout = timeout;
        self
    }

    pub fn export_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.options.export_folder = folder.into();
        self
    }

    pub fn blob_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.options.blob_folder = folder.into();
        self
    }

    /// Use `lock` instead of the process-wide bulk-insert lock.
    pub fn bulk_lock(mut self, lock: BulkInsertLock) -> Self {
        self.bulk_lock = Some(lock);
        self
    }

    /// Validate the credentials and build the session. No connection is
    /// opened.
    pub fn build(self) -> Result<Session, DbError> {
        let kind = self.adapter.kind();
        self.credentials.validate(kind)?;
        if self.options.command_timeout.is_zero() || self.options.export_timeout.is_zero() {
            return Err(DbError::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(Session::from_parts(
            self.adapter,
            self.credentials,
            self.options,
            self.bulk_lock.unwrap_or_else(BulkInsertLock::global),
        ))
    }
}
