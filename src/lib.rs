//! polysql - Engine-Agnostic Database Sessions
//!
//! One session API over Oracle, PostgreSQL, SQL Server, MySQL and SQLite.
//! It can be used as a library, or run as the `polysql` command-line tool.
//!
//! # Architecture
//!
//! - **Session**: connection state machine, transactions and query primitives
//! - **Adapters**: per-engine binding, dialect, decoding and bulk transfer
//! - **Config**: YAML connection profiles and session defaults
//!
//! # Example
//!
//! ```rust,no_run
//! use polysql::{ParamBind, Session};
//!
//! # async fn run() -> Result<(), polysql::DbError> {
//! let mut session = Session::postgres("db.internal", 0, "app", "secret", "lob")?;
//! let count: i64 = session
//!     .exec_scalar(
//!         "SELECT COUNT(*) FROM orders WHERE status IN (:status)",
//!         &[ParamBind::array("status", ["open", "held"])],
//!     )
//!     .await?;
//! # let _ = count;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod session;

pub use adapter::{Adapter, BulkMode, EngineKind, NativeConnection};
pub use config::{AppConfig, ConfigError, DatabaseConfig, Defaults};
pub use session::{
    BulkInsertLock, ColumnInfo, Command, ConnectionState, Credentials, CsvOptions, Cursor,
    DataTable, DbError, Direction, FromDataRow, FromValue, ParamBind, ParamValue,
    ProcedureResult, Row, Session, SessionBuilder, SessionOptions, Value,
};
