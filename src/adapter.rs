//! Engine adapters.
//!
//! An [`Adapter`] is the stateless capability set of one engine: it binds
//! named parameters into a [`Command`] in the engine's native dialect, opens
//! [`NativeConnection`]s, and knows the engine's SQL quirks (probe queries,
//! derived tables, bulk insert strategy). Sessions hold their adapter as an
//! `Arc<dyn Adapter>`.
//!
//! # Components
//!
//! - [`sqlite::SqliteAdapter`], [`postgres::PostgresAdapter`],
//!   [`mysql::MySqlAdapter`]: `sqlx`-backed engines
//! - `mssql::SqlServerAdapter`: `tiberius`-backed (feature `sqlserver`)
//! - `oracle::OracleAdapter`: `oracle-rs`-backed (feature `oracle`)

pub(crate) mod insert;
#[cfg(feature = "sqlserver")]
pub mod mssql;
pub mod mysql;
#[cfg(feature = "oracle")]
pub mod oracle;
pub mod postgres;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use futures::stream::{BoxStream, TryStreamExt};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::session::{
    BlobFiles, ColumnInfo, Command, CommandKind, Credentials, DataTable, DbError, NativeStyle,
    ParamBind, ProcedureResult, Row, bind_named, write_value,
};

// =============================================================================
// Engine kinds
// =============================================================================

/// Supported database engines.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EngineKind {
    Oracle,
    Postgres,
    SqlServer,
    MySql,
    Sqlite,
}

impl EngineKind {
    /// Prefix callers use for named placeholders.
    pub fn placeholder_prefix(self) -> char {
        match self {
            EngineKind::MySql => '@',
            _ => ':',
        }
    }

    /// Port used when credentials leave it at 0.
    pub fn default_port(self) -> u16 {
        match self {
            EngineKind::Oracle => 1521,
            EngineKind::Postgres => 5432,
            EngineKind::SqlServer => 1433,
            EngineKind::MySql => 3306,
            EngineKind::Sqlite => 0,
        }
    }

    /// Whether the engine is a local file rather than a server.
    pub fn is_file_based(self) -> bool {
        matches!(self, EngineKind::Sqlite)
    }
}

/// Returns the adapter for `kind`.
///
/// # Errors
/// Returns `DbError::NotSupported` if the engine's feature is disabled.
pub fn adapter_for(kind: EngineKind) -> Result<Arc<dyn Adapter>, DbError> {
    match kind {
        EngineKind::Postgres => Ok(Arc::new(postgres::PostgresAdapter)),
        EngineKind::MySql => Ok(Arc::new(mysql::MySqlAdapter)),
        EngineKind::Sqlite => Ok(Arc::new(sqlite::SqliteAdapter)),
        #[cfg(feature = "sqlserver")]
        EngineKind::SqlServer => Ok(Arc::new(mssql::SqlServerAdapter)),
        #[cfg(feature = "oracle")]
        EngineKind::Oracle => Ok(Arc::new(oracle::OracleAdapter)),
        #[allow(unreachable_patterns)]
        other => Err(DbError::NotSupported(format!(
            "{other} support is not compiled in"
        ))),
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Streamed rows borrowed from a native connection.
pub type RowStream<'a> = BoxStream<'a, Result<Row, DbError>>;

/// How an engine performs bulk inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// Binary `COPY ... FROM STDIN`, outside any transaction.
    BinaryCopy,
    /// Chunked multi-row `INSERT` statements inside one transaction.
    MultiRowInsert,
}

/// An open connection to one engine.
///
/// Connections run in autocommit mode until [`begin`](Self::begin) is called.
#[async_trait::async_trait]
pub trait NativeConnection: Send {
    /// Begins a transaction at read-committed isolation.
    async fn begin(&mut self) -> Result<(), DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Executes a non-query command and returns the affected row count.
    async fn execute(&mut self, command: &Command) -> Result<u64, DbError>;

    /// Streams the rows of a query command.
    fn fetch<'a>(&'a mut self, command: &'a Command) -> RowStream<'a>;

    /// Column metadata of the command's result set.
    ///
    /// May execute the command; callers pass probe queries when execution
    /// must not read data.
    async fn describe(&mut self, command: &Command) -> Result<Vec<ColumnInfo>, DbError>;

    /// Runs a query command into a table, reporting columns even when empty.
    async fn query(&mut self, command: &Command) -> Result<DataTable, DbError> {
        let rows: Vec<Row> = self.fetch(command).try_collect().await?;
        match rows.first() {
            Some(first) => {
                let columns = first.columns().to_vec();
                Ok(DataTable::from_rows(columns, rows))
            }
            None => Ok(DataTable::new(self.describe(command).await?)),
        }
    }

    /// Writes the first column of every row to the file `files` names for it.
    ///
    /// The default writes each decoded value in
    /// [`BLOB_CHUNK_SIZE`](crate::session::BLOB_CHUNK_SIZE) pieces. Engines
    /// that hand out lob locators read the value piecewise instead.
    async fn write_blobs(&mut self, command: &Command, files: &mut BlobFiles) -> Result<(), DbError> {
        let mut rows = self.fetch(command);
        while let Some(row) = rows.try_next().await? {
            let path = files.next_path(row.len(), row.get(1))?;
            write_value(&path, row.get(0)).await?;
        }
        Ok(())
    }

    /// Calls the stored procedure bound in `command`.
    async fn call_procedure(&mut self, command: &Command) -> Result<ProcedureResult, DbError>;

    /// Streams `data` into `table` through the engine's bulk-load protocol.
    ///
    /// `target` holds the introspected columns of `table`.
    async fn copy_in(
        &mut self,
        table: &str,
        target: &[ColumnInfo],
        data: &DataTable,
    ) -> Result<u64, DbError> {
        let _ = (table, target, data);
        Err(DbError::NotSupported(
            "bulk copy is not available on this engine".to_string(),
        ))
    }

    /// Closes the connection gracefully.
    async fn close(self: Box<Self>) -> Result<(), DbError>;
}

/// The capability set of one engine.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync + fmt::Debug + 'static {
    fn kind(&self) -> EngineKind;

    fn native_style(&self) -> NativeStyle;

    fn placeholder_prefix(&self) -> char {
        self.kind().placeholder_prefix()
    }

    /// Connection string for display. Never contains the password.
    fn connection_string(&self, credentials: &Credentials) -> String;

    async fn connect(&self, credentials: &Credentials)
    -> Result<Box<dyn NativeConnection>, DbError>;

    /// Binds SQL text and its parameters into `command`.
    fn bind(&self, command: &mut Command, text: &str, params: &[ParamBind]) -> Result<(), DbError> {
        bind_named(
            command,
            self.placeholder_prefix(),
            text,
            CommandKind::Text,
            params,
        )?;
        command.render(self.placeholder_prefix(), self.native_style());
        Ok(())
    }

    /// Binds a stored-procedure call. The connection builds the native call.
    fn bind_procedure(
        &self,
        command: &mut Command,
        name: &str,
        params: &[ParamBind],
    ) -> Result<(), DbError> {
        bind_named(
            command,
            self.placeholder_prefix(),
            name,
            CommandKind::StoredProcedure,
            params,
        )?;
        command.set_native(name.to_string(), Vec::new());
        Ok(())
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// `query` as a derived table named `alias`.
    fn derived_table(&self, query: &str, alias: &str) -> String {
        format!("({query}) AS {alias}")
    }

    /// Schema-only probe over a table name or derived table.
    fn probe_query(&self, relation: &str) -> String {
        format!("SELECT * FROM {relation} LIMIT 1")
    }

    fn count_query(&self, query: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", self.derived_table(query, "_x"))
    }

    fn wrap_query(&self, query: &str, alias: &str) -> String {
        format!("SELECT * FROM {}", self.derived_table(query, alias))
    }

    fn bulk_mode(&self) -> BulkMode {
        BulkMode::MultiRowInsert
    }

    /// Largest number of bind parameters in one statement.
    fn max_bind_params(&self) -> usize;

    /// Largest number of rows in one multi-row insert.
    fn max_insert_rows(&self) -> usize {
        1000
    }

    /// Multi-row insert text. `rows` holds one placeholder list per row.
    fn insert_statement(&self, table: &str, columns: &[String], rows: &[Vec<String>]) -> String {
        let values: Vec<String> = rows
            .iter()
            .map(|row| format!("({})", row.join(", ")))
            .collect();
        format!(
            "INSERT INTO {table} ({}) VALUES {}",
            columns.join(", "),
            values.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_engine_kind_from_str() {
        assert_eq!(EngineKind::from_str("postgres").unwrap(), EngineKind::Postgres);
        assert_eq!(EngineKind::from_str("SQLSERVER").unwrap(), EngineKind::SqlServer);
        assert_eq!(EngineKind::from_str("MySql").unwrap(), EngineKind::MySql);
        assert!(EngineKind::from_str("db2").is_err());
        assert_eq!(EngineKind::Oracle.as_ref(), "oracle");
    }

    #[test]
    fn test_engine_defaults() {
        assert_eq!(EngineKind::MySql.placeholder_prefix(), '@');
        assert_eq!(EngineKind::Oracle.placeholder_prefix(), ':');
        assert_eq!(EngineKind::Postgres.default_port(), 5432);
        assert_eq!(EngineKind::SqlServer.default_port(), 1433);
        assert!(EngineKind::Sqlite.is_file_based());
    }

    #[test]
    fn test_adapter_for_builds_sqlx_engines() {
        for kind in [EngineKind::Postgres, EngineKind::MySql, EngineKind::Sqlite] {
            assert_eq!(adapter_for(kind).unwrap().kind(), kind);
        }
    }
}
