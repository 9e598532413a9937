//! The database session: connection/transaction state machine and the
//! generic execute primitives.
//!
//! Every primitive follows the same shape: bind the command, open the
//! connection unless a transaction already holds one, execute under the
//! command timeout, then [`Session::finish`] logs any failure and closes the
//! connection. Only [`Session::exec_reader`] hands its connection to the
//! caller.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, warn};

use crate::adapter::{self, Adapter, EngineKind, NativeConnection};

use super::builder::{Credentials, SessionBuilder, SessionOptions};
use super::command::Command;
use super::convert::FromValue;
use super::cursor::Cursor;
use super::error::DbError;
use super::lock::BulkInsertLock;
use super::materialize::{FromDataRow, materialize, scalar_or_default};
use super::params::{ParamBind, ProcedureResult};
use super::types::{DataTable, Value};

/// Lifecycle state of a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum ConnectionState {
    Closed,
    Open,
    OpenInTransaction,
}

/// Runs `fut`, failing with [`DbError::Timeout`] once `limit` elapses.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, DbError>>,
) -> Result<T, DbError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout(limit)),
    }
}

fn looks_like_query(relation: &str) -> bool {
    let head = relation.trim_start();
    head.starts_with('(')
        || head
            .get(..6)
            .is_some_and(|s| s.eq_ignore_ascii_case("select"))
        || head.get(..4).is_some_and(|s| s.eq_ignore_ascii_case("with"))
}

/// An engine-agnostic database session.
///
/// Holds at most one native connection and at most one transaction.
/// Primitives take `&mut self`; use [`Session::new_external_connection`] for
/// concurrent work.
pub struct Session {
    pub(super) adapter: Arc<dyn Adapter>,
    pub(super) credentials: Credentials,
    connection_string: String,
    pub(super) options: SessionOptions,
    pub(super) bulk_lock: BulkInsertLock,
    pub(super) command: Command,
    pub(super) connection: Option<Box<dyn NativeConnection>>,
    pub(super) in_transaction: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.adapter.kind())
            .field("connection_string", &self.connection_string)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    // =========================================================================
    // Construction
    // =========================================================================

    pub(super) fn from_parts(
        adapter: Arc<dyn Adapter>,
        credentials: Credentials,
        options: SessionOptions,
        bulk_lock: BulkInsertLock,
    ) -> Self {
        let connection_string = adapter.connection_string(&credentials);
        Self {
            adapter,
            credentials,
            connection_string,
            options,
            bulk_lock,
            command: Command::default(),
            connection: None,
            in_transaction: false,
        }
    }

    /// Starts a builder for a session over `adapter`.
    pub fn builder(adapter: Arc<dyn Adapter>, credentials: Credentials) -> SessionBuilder {
        SessionBuilder::new(adapter, credentials)
    }

    fn for_engine(
        kind: EngineKind,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, DbError> {
        let credentials = Credentials::new(host, port, username, password, database);
        SessionBuilder::new(adapter::adapter_for(kind)?, credentials).build()
    }

    /// PostgreSQL session. Port 0 selects 5432.
    pub fn postgres(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, DbError> {
        Self::for_engine(EngineKind::Postgres, host, port, username, password, database)
    }

    /// MySQL session. Port 0 selects 3306.
    pub fn mysql(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, DbError> {
        Self::for_engine(EngineKind::MySql, host, port, username, password, database)
    }

    /// SQLite session; `database` is the file path and the other fields are
    /// ignored.
    pub fn sqlite(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, DbError> {
        Self::for_engine(EngineKind::Sqlite, host, port, username, password, database)
    }

    /// SQL Server session. Port 0 selects 1433.
    #[cfg(feature = "sqlserver")]
    pub fn sql_server(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, DbError> {
        Self::for_engine(EngineKind::SqlServer, host, port, username, password, database)
    }

    /// Oracle session; `database` is the service name. Port 0 selects 1521.
    #[cfg(feature = "oracle")]
    pub fn oracle(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, DbError> {
        Self::for_engine(EngineKind::Oracle, host, port, username, password, database)
    }

    /// A new session on the same engine with different credentials.
    ///
    /// Options and the bulk-insert lock are shared with `self`.
    pub fn new_external_connection(&self, credentials: Credentials) -> Result<Session, DbError> {
        SessionBuilder::new(Arc::clone(&self.adapter), credentials)
            .options(self.options.clone())
            .bulk_lock(self.bulk_lock.clone())
            .build()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn kind(&self) -> EngineKind {
        self.adapter.kind()
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Connection string with the password masked.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn bulk_lock(&self) -> &BulkInsertLock {
        &self.bulk_lock
    }

    /// The most recently bound command.
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn state(&self) -> ConnectionState {
        match (&self.connection, self.in_transaction) {
            (None, _) => ConnectionState::Closed,
            (Some(_), false) => ConnectionState::Open,
            (Some(_), true) => ConnectionState::OpenInTransaction,
        }
    }

    /// Whether a native connection object currently exists.
    pub fn is_available(&self) -> bool {
        self.connection.is_some()
    }

    pub fn has_uncommitted_transaction(&self) -> bool {
        self.in_transaction
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Opens the connection.
    ///
    /// A no-op inside a transaction, which already owns the connection.
    ///
    /// # Errors
    /// Returns `DbError::State` if the connection is already open.
    pub async fn open_connection(&mut self) -> Result<(), DbError> {
        if self.in_transaction {
            return Ok(());
        }
        if self.connection.is_some() {
            return Err(DbError::State("connection is already open".to_string()));
        }
        let connection = self.adapter.connect(&self.credentials).await?;
        self.connection = Some(connection);
        debug!(engine = %self.kind(), "connection opened");
        Ok(())
    }

    /// Closes the connection. Idempotent; a no-op inside a transaction.
    pub async fn close_connection(&mut self) -> Result<(), DbError> {
        if self.in_transaction {
            return Ok(());
        }
        self.force_close().await
    }

    /// Connects and begins a read-committed transaction.
    ///
    /// # Errors
    /// Returns `DbError::State` if a connection or transaction is open.
    pub async fn begin_transaction(&mut self) -> Result<(), DbError> {
        if self.in_transaction {
            return Err(DbError::State("a transaction is already active".to_string()));
        }
        if self.connection.is_some() {
            return Err(DbError::State(
                "cannot begin a transaction on an already open connection".to_string(),
            ));
        }
        let mut connection = self.adapter.connect(&self.credentials).await?;
        let begun = connection.begin().await;
        if let Err(err) = begun {
            if let Err(close_err) = connection.close().await {
                warn!(engine = %self.kind(), error = %close_err, "failed to close connection");
            }
            return Err(err);
        }
        self.connection = Some(connection);
        self.in_transaction = true;
        debug!(engine = %self.kind(), "transaction started");
        Ok(())
    }

    /// Commits the transaction and closes the connection.
    ///
    /// The connection is closed even when the commit fails.
    ///
    /// # Errors
    /// Returns `DbError::State` if no transaction is active.
    pub async fn commit_and_close(&mut self) -> Result<(), DbError> {
        if !self.in_transaction {
            self.force_close().await?;
            return Err(DbError::State("no active transaction to commit".to_string()));
        }
        let committed = match self.connection.as_mut() {
            Some(connection) => connection.commit().await,
            None => Ok(()),
        };
        if committed.is_ok() {
            debug!(engine = %self.kind(), "transaction committed");
        }
        let closed = self.force_close().await;
        committed.and(closed)
    }

    /// Rolls back any transaction and closes the connection.
    ///
    /// Without a transaction this is a plain close.
    pub async fn rollback_and_close(&mut self) -> Result<(), DbError> {
        let rolled_back = match (self.in_transaction, self.connection.as_mut()) {
            (true, Some(connection)) => connection.rollback().await,
            _ => Ok(()),
        };
        if self.in_transaction && rolled_back.is_ok() {
            debug!(engine = %self.kind(), "transaction rolled back");
        }
        let closed = self.force_close().await;
        rolled_back.and(closed)
    }

    async fn force_close(&mut self) -> Result<(), DbError> {
        self.in_transaction = false;
        match self.connection.take() {
            Some(connection) => {
                connection.close().await?;
                debug!(engine = %self.kind(), "connection closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    // =========================================================================
    // Primitive plumbing
    // =========================================================================

    /// Binds SQL text into the reusable command.
    pub(super) fn bind(
        &mut self,
        query: &str,
        params: &[ParamBind],
        timeout: Duration,
    ) -> Result<(), DbError> {
        self.adapter.bind(&mut self.command, query, params)?;
        self.command.set_timeout(timeout);
        debug!(engine = %self.kind(), query = %self.command.audit_text(), "command bound");
        Ok(())
    }

    /// Opens a connection unless one is already held.
    pub(super) async fn ensure_open(&mut self) -> Result<(), DbError> {
        if self.connection.is_none() {
            self.open_connection().await?;
        }
        Ok(())
    }

    /// The open connection together with the bound command.
    pub(super) fn parts(
        &mut self,
    ) -> Result<(&mut (dyn NativeConnection + 'static), &Command), DbError> {
        let connection = self.connection.as_deref_mut().ok_or_else(DbError::not_open)?;
        Ok((connection, &self.command))
    }

    /// Completes a primitive.
    ///
    /// On success the connection is closed unless a transaction holds it. On
    /// failure the error is logged, any transaction is rolled back and the
    /// connection is closed.
    pub(super) async fn finish<T>(
        &mut self,
        operation: &'static str,
        result: Result<T, DbError>,
    ) -> Result<T, DbError> {
        match result {
            Ok(value) => {
                if let Err(err) = self.close_connection().await {
                    warn!(engine = %self.kind(), operation, error = %err, "failed to close connection");
                }
                Ok(value)
            }
            Err(err) => {
                error!(
                    engine = %self.kind(),
                    operation,
                    query = %self.command.audit_text(),
                    error = %err,
                    "database operation failed"
                );
                self.abandon(matches!(err, DbError::Timeout(_))).await;
                Err(err)
            }
        }
    }

    /// Rolls back and closes after a failure. A timed-out connection is
    /// dropped without a round trip.
    async fn abandon(&mut self, timed_out: bool) {
        if timed_out {
            self.in_transaction = false;
            self.connection = None;
            return;
        }
        if self.in_transaction
            && let Some(connection) = self.connection.as_mut()
            && let Err(err) = connection.rollback().await
        {
            warn!(engine = %self.kind(), error = %err, "rollback after failure did not complete");
        }
        if let Err(err) = self.force_close().await {
            warn!(engine = %self.kind(), error = %err, "failed to close connection");
        }
    }

    /// First cell of the bound command's result, draining the rest.
    async fn first_cell(&mut self) -> Result<Option<Value>, DbError> {
        let limit = self.command.timeout();
        let (connection, command) = self.parts()?;
        with_timeout(limit, async move {
            let mut rows = connection.fetch(command);
            let first = rows.try_next().await?;
            while rows.try_next().await?.is_some() {}
            Ok(first.and_then(|row| row.into_values().into_iter().next()))
        })
        .await
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    /// First column of the first row as `T`; `T::default()` on no row or
    /// NULL.
    pub async fn exec_scalar<T: FromValue + Default>(
        &mut self,
        query: &str,
        params: &[ParamBind],
    ) -> Result<T, DbError> {
        let result = self.run_scalar(query, params).await;
        self.finish("exec_scalar", result).await
    }

    async fn run_scalar<T: FromValue + Default>(
        &mut self,
        query: &str,
        params: &[ParamBind],
    ) -> Result<T, DbError> {
        self.bind(query, params, self.options.command_timeout)?;
        self.ensure_open().await?;
        scalar_or_default(self.first_cell().await?)
    }

    /// Runs a query into a [`DataTable`].
    pub async fn get_data_table(
        &mut self,
        query: &str,
        params: &[ParamBind],
    ) -> Result<DataTable, DbError> {
        let result = self.run_table(query, params).await;
        self.finish("get_data_table", result).await
    }

    async fn run_table(&mut self, query: &str, params: &[ParamBind]) -> Result<DataTable, DbError> {
        self.bind(query, params, self.options.command_timeout)?;
        self.ensure_open().await?;
        let limit = self.command.timeout();
        let (connection, command) = self.parts()?;
        with_timeout(limit, connection.query(command)).await
    }

    /// Runs a query and materializes each row as `T`.
    pub async fn get_list<T: FromDataRow>(
        &mut self,
        query: &str,
        params: &[ParamBind],
    ) -> Result<Vec<T>, DbError> {
        let result = match self.run_table(query, params).await {
            Ok(table) => materialize(&table),
            Err(err) => Err(err),
        };
        self.finish("get_list", result).await
    }

    /// Executes a non-query command and returns the affected row count.
    pub async fn exec_query_with_result(
        &mut self,
        query: &str,
        params: &[ParamBind],
    ) -> Result<u64, DbError> {
        let result = self.run_execute(query, params).await;
        self.finish("exec_query_with_result", result).await
    }

    async fn run_execute(&mut self, query: &str, params: &[ParamBind]) -> Result<u64, DbError> {
        self.bind(query, params, self.options.command_timeout)?;
        self.ensure_open().await?;
        let limit = self.command.timeout();
        let (connection, command) = self.parts()?;
        let affected = with_timeout(limit, connection.execute(command)).await?;
        debug!(engine = %self.kind(), affected, "command executed");
        Ok(affected)
    }

    /// Executes a non-query command and checks the affected row count.
    ///
    /// Succeeds when at least `minimum` rows were affected, or exactly
    /// `minimum` when `exact` is set.
    pub async fn exec_query(
        &mut self,
        query: &str,
        params: &[ParamBind],
        minimum: u64,
        exact: bool,
    ) -> Result<bool, DbError> {
        let result = self
            .run_execute(query, params)
            .await
            .map(|affected| if exact { affected == minimum } else { affected >= minimum });
        self.finish("exec_query", result).await
    }

    /// Calls a stored procedure.
    ///
    /// # Errors
    /// Returns `DbError::NotSupported` on SQLite.
    pub async fn exec_procedure(
        &mut self,
        name: &str,
        params: &[ParamBind],
    ) -> Result<ProcedureResult, DbError> {
        let result = self.run_procedure(name, params).await;
        self.finish("exec_procedure", result).await
    }

    async fn run_procedure(
        &mut self,
        name: &str,
        params: &[ParamBind],
    ) -> Result<ProcedureResult, DbError> {
        self.adapter.bind_procedure(&mut self.command, name, params)?;
        self.command.set_timeout(self.options.command_timeout);
        debug!(engine = %self.kind(), query = %self.command.audit_text(), "procedure bound");
        self.ensure_open().await?;
        let limit = self.command.timeout();
        let (connection, command) = self.parts()?;
        with_timeout(limit, connection.call_procedure(command)).await
    }

    /// Column metadata of a table, or of a query, without reading rows.
    pub async fn get_all_column_table(&mut self, relation: &str) -> Result<DataTable, DbError> {
        let result = self.run_describe(relation).await;
        self.finish("get_all_column_table", result).await
    }

    async fn run_describe(&mut self, relation: &str) -> Result<DataTable, DbError> {
        let relation = if looks_like_query(relation) {
            self.adapter.derived_table(relation, "_x")
        } else {
            relation.to_string()
        };
        let probe = self.adapter.probe_query(&relation);
        self.bind(&probe, &[], self.options.command_timeout)?;
        self.ensure_open().await?;
        let limit = self.command.timeout();
        let (connection, command) = self.parts()?;
        let columns = with_timeout(limit, connection.describe(command)).await?;
        Ok(DataTable::new(columns))
    }

    /// Opens a live cursor over a query.
    ///
    /// The cursor owns a fresh connection until it is exhausted, closed or
    /// dropped; the session itself stays Closed.
    ///
    /// # Errors
    /// Returns `DbError::State` while the session holds a connection.
    pub async fn exec_reader(
        &mut self,
        query: &str,
        params: &[ParamBind],
    ) -> Result<Cursor, DbError> {
        if self.connection.is_some() {
            return Err(DbError::State(
                "a reader needs its own connection; close the session first".to_string(),
            ));
        }
        let result = self.open_reader(query, params).await;
        if let Err(err) = &result {
            error!(
                engine = %self.kind(),
                operation = "exec_reader",
                query = %self.command.audit_text(),
                error = %err,
                "database operation failed"
            );
        }
        result
    }

    async fn open_reader(&mut self, query: &str, params: &[ParamBind]) -> Result<Cursor, DbError> {
        self.bind(query, params, self.options.command_timeout)?;
        let connection = with_timeout(
            self.options.command_timeout,
            self.adapter.connect(&self.credentials),
        )
        .await?;
        debug!(engine = %self.kind(), "reader opened");
        Ok(Cursor::new(self.kind(), connection, self.command.clone()))
    }
}
