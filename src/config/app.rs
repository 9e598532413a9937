//! Application configuration structures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::{self, EngineKind};
use crate::session::{
    BulkInsertLock, Credentials, DEFAULT_COMMAND_TIMEOUT, DEFAULT_EXPORT_TIMEOUT, Session,
    SessionOptions,
};

use super::validation::{ConfigError, expand_env_vars, require_timeout};

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_export_timeout() -> Duration {
    DEFAULT_EXPORT_TIMEOUT
}

fn default_export_folder() -> PathBuf {
    PathBuf::from("exports")
}

fn default_blob_folder() -> PathBuf {
    PathBuf::from("blobs")
}

// =============================================================================
// Session Defaults
// =============================================================================

/// Settings shared by every session opened from this file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    /// Timeout for ordinary commands (default: 10m).
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Timeout for CSV exports and blob retrieval (default: 30m).
    #[serde(default = "default_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Folder for CSV exports (default: "exports").
    #[serde(default = "default_export_folder")]
    pub export_folder: PathBuf,

    /// Folder for retrieved blobs (default: "blobs").
    #[serde(default = "default_blob_folder")]
    pub blob_folder: PathBuf,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            export_folder: default_export_folder(),
            blob_folder: default_blob_folder(),
        }
    }
}

impl Defaults {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            command_timeout: self.command_timeout,
            export_timeout: self.export_timeout,
            export_folder: self.export_folder.clone(),
            blob_folder: self.blob_folder.clone(),
        }
    }
}

// =============================================================================
// Connection Profiles
// =============================================================================

/// One named connection profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Engine: oracle, postgres, sqlserver, mysql or sqlite.
    pub driver: EngineKind,

    #[serde(default)]
    pub host: String,

    /// Omitted or 0 selects the engine's default port.
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Database, service name, or file path for SQLite.
    pub database: String,
}

impl DatabaseConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            &self.host,
            self.port,
            &self.username,
            &self.password,
            &self.database,
        )
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: Defaults,

    /// Connection profiles by name.
    pub connections: BTreeMap<String, DatabaseConfig>,

    /// Handed to every session this configuration opens.
    #[serde(skip)]
    pub bulk_lock: BulkInsertLock,
}

impl AppConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` references
    /// first.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections.is_empty() {
            return Err(ConfigError::Validation(
                "at least one connection must be configured".to_string(),
            ));
        }

        require_timeout("defaults.command_timeout", self.defaults.command_timeout)?;
        require_timeout("defaults.export_timeout", self.defaults.export_timeout)?;

        for (name, connection) in &self.connections {
            connection
                .credentials()
                .validate(connection.driver)
                .map_err(|e| ConfigError::Validation(format!("connection '{name}': {e}")))?;
        }

        Ok(())
    }

    pub fn connection(&self, name: &str) -> Result<&DatabaseConfig, ConfigError> {
        self.connections
            .get(name)
            .ok_or_else(|| ConfigError::Validation(format!("unknown connection: '{name}'")))
    }

    /// Builds a closed session for the named profile.
    pub fn open_session(&self, name: &str) -> Result<Session, ConfigError> {
        let connection = self.connection(name)?;
        let adapter = adapter::adapter_for(connection.driver)?;
        let session = Session::builder(adapter, connection.credentials())
            .options(self.defaults.session_options())
            .bulk_lock(self.bulk_lock.clone())
            .build()?;
        tracing::debug!(connection = name, engine = %connection.driver, "session configured");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
defaults:
  command_timeout: 2m
  export_folder: /var/polysql/exports
connections:
  main:
    driver: postgres
    host: db.internal
    username: app
    password: ${POLYSQL_UNSET_SAMPLE_PW:-secret}
    database: lob
  local:
    driver: sqlite
    database: ./local.db
"#;

    #[test]
    fn test_load_sample() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.defaults.command_timeout, Duration::from_secs(120));
        assert_eq!(config.defaults.export_timeout, DEFAULT_EXPORT_TIMEOUT);
        assert_eq!(config.defaults.blob_folder, PathBuf::from("blobs"));

        let main = config.connection("main").unwrap();
        assert_eq!(main.driver, EngineKind::Postgres);
        assert_eq!(main.password, "secret");
        assert_eq!(main.credentials().port_or_default(main.driver), 5432);
    }

    #[test]
    fn test_sqlserver_driver_name() {
        let yaml = "connections:\n  ms:\n    driver: sqlserver\n    host: h\n    username: u\n    database: d\n";
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.connections["ms"].driver, EngineKind::SqlServer);
    }

    #[test]
    fn test_validation_requires_connections() {
        let err = AppConfig::from_yaml("connections: {}\n").unwrap_err();
        assert!(err.to_string().contains("at least one connection"));
    }

    #[test]
    fn test_validation_names_profile() {
        let yaml = "connections:\n  broken:\n    driver: mysql\n    host: h\n    database: d\n";
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("connection 'broken'"));
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let yaml = "defaults:\n  command_timeout: 0s\nconnections:\n  l:\n    driver: sqlite\n    database: a.db\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_open_session_applies_defaults() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        let session = config.open_session("local").unwrap();
        assert_eq!(session.kind(), EngineKind::Sqlite);
        assert_eq!(session.options().command_timeout, Duration::from_secs(120));
        assert_eq!(
            session.options().export_folder,
            PathBuf::from("/var/polysql/exports")
        );
        assert!(config.open_session("missing").is_err());
    }

    #[test]
    fn test_profiles_share_bulk_lock() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        let main = config.open_session("main").unwrap();
        let local = config.open_session("local").unwrap();
        assert!(main.bulk_lock().is_shared_with(local.bulk_lock()));
        assert!(main.bulk_lock().is_shared_with(&BulkInsertLock::global()));
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("absent.yaml"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.connections.len(), 2);
    }

    #[test]
    fn test_invalid_yaml() {
        let err = AppConfig::from_yaml("connections: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
