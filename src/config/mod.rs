//! Configuration
//!
//! YAML connection profiles with `${VAR}` expansion, plus the session
//! defaults they share.

mod app;
mod validation;

pub use app::{AppConfig, DatabaseConfig, Defaults};
pub use validation::{ConfigError, expand_env_vars, parse_timeout};
