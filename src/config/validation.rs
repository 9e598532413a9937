//! Configuration errors and the checks shared by the loader and the CLI.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use thiserror::Error;

use crate::session::DbError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML in connection profiles: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A profile passed validation but the session builder refused it.
    #[error("cannot configure session: {0}")]
    Session(#[from] DbError),
}

/// Parses a session timeout such as `45s` or `2m`. Zero is rejected.
pub fn parse_timeout(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("timeout is empty".to_string());
    }
    let timeout = humantime::parse_duration(s).map_err(|e| format!("timeout '{s}': {e}"))?;
    if timeout.is_zero() {
        return Err(format!("timeout '{s}' must be greater than zero"));
    }
    Ok(timeout)
}

/// Fails with the offending setting's name when `timeout` is zero.
pub(crate) fn require_timeout(setting: &str, timeout: Duration) -> Result<(), ConfigError> {
    if timeout.is_zero() {
        return Err(ConfigError::Validation(format!(
            "{setting} must be greater than zero"
        )));
    }
    Ok(())
}

/// Substitutes `${VAR}` and `${VAR:-default}` references.
///
/// Profiles keep passwords and hosts out of the file this way. An unset
/// variable without a default becomes the empty string, which credential
/// validation then reports for required fields.
pub fn expand_env_vars(input: &str) -> String {
    static REFERENCE: OnceLock<Regex> = OnceLock::new();

    let reference = REFERENCE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var pattern is valid")
    });

    reference
        .replace_all(input, |caps: &Captures| {
            std::env::var(&caps[1])
                .unwrap_or_else(|_| caps.get(2).map_or("", |m| m.as_str()).to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_timeout(" 2m ").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_timeout("1h30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_timeout_rejects_bad_values() {
        assert!(parse_timeout("").is_err());
        assert!(parse_timeout("soon").is_err());
        assert!(parse_timeout("30").is_err());
        assert!(parse_timeout("0s").unwrap_err().contains("greater than zero"));
    }

    #[test]
    fn test_require_timeout_names_setting() {
        assert!(require_timeout("defaults.command_timeout", Duration::from_secs(1)).is_ok());
        let err = require_timeout("defaults.export_timeout", Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("defaults.export_timeout"));
    }

    #[test]
    fn test_expand_password_default() {
        let result = expand_env_vars("password: ${POLYSQL_UNSET_PASSWORD_93817:-fallback}");
        assert_eq!(result, "password: fallback");
        assert_eq!(expand_env_vars("${POLYSQL_UNSET_PASSWORD_93817}"), "");
    }

    #[test]
    fn test_expand_host_from_env() {
        // SAFETY: only this test touches this variable.
        unsafe {
            std::env::set_var("POLYSQL_TEST_DB_HOST", "db.internal");
        }
        assert_eq!(expand_env_vars("host: ${POLYSQL_TEST_DB_HOST}"), "host: db.internal");
        // SAFETY: cleanup of the variable set above.
        unsafe {
            std::env::remove_var("POLYSQL_TEST_DB_HOST");
        }
    }

    #[test]
    fn test_expand_leaves_plain_dollars() {
        assert_eq!(expand_env_vars("pa$$word $HOME"), "pa$$word $HOME");
    }
}
