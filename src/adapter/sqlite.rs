//! SQLite adapter over `sqlx`.
//!
//! The database is a local file named by `Credentials::database`, created
//! on first connect. `:memory:` opens a private in-memory database per
//! connection. SQLite has no stored procedures.

use std::str::FromStr;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Executor, Row as _, Sqlite, Statement, TypeInfo, ValueRef};
use tracing::debug;

use super::{Adapter, EngineKind, NativeConnection, RowStream};
use crate::session::{
    ColumnInfo, Command, Credentials, DbError, NativeStyle, ParamBind, ProcedureResult, Row, Value,
};

/// `SQLITE_MAX_VARIABLE_NUMBER` of current SQLite builds.
const MAX_BIND_PARAMS: usize = 32_766;

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

#[async_trait]
impl Adapter for SqliteAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    fn native_style(&self) -> NativeStyle {
        NativeStyle::QUESTION_NUMBERED
    }

    fn connection_string(&self, credentials: &Credentials) -> String {
        format!("sqlite:{}", credentials.database)
    }

    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn NativeConnection>, DbError> {
        let options = if credentials.database == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&credentials.database)
                .create_if_missing(true)
        };
        let conn = SqliteConnection::connect_with(&options).await?;
        debug!(database = %credentials.database, "sqlite connection opened");
        Ok(Box::new(SqliteNative { conn }))
    }

    fn bind_procedure(
        &self,
        _command: &mut Command,
        name: &str,
        _params: &[ParamBind],
    ) -> Result<(), DbError> {
        Err(DbError::NotSupported(format!(
            "SQLite has no stored procedures: {name}"
        )))
    }

    fn max_bind_params(&self) -> usize {
        MAX_BIND_PARAMS
    }
}

// =============================================================================
// Binding and decoding
// =============================================================================

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Bytes(b) => query.bind(b.clone()),
        Value::Date(d) => query.bind(*d),
        Value::Time(t) => query.bind(*t),
        Value::DateTime(dt) => query.bind(*dt),
        Value::DateTimeTz(dt) => query.bind(*dt),
        other => query.bind(other.to_string()),
    }
}

fn sqlite_query(command: &Command) -> SqliteQuery<'_> {
    command
        .native_args()
        .iter()
        .fold(sqlx::query(command.native_text()), bind_value)
}

fn column_infos<C: Column>(columns: &[C]) -> Arc<[ColumnInfo]> {
    columns
        .iter()
        .map(|c| ColumnInfo::new(c.name(), c.type_info().name()))
        .collect()
}

/// Decodes by the storage class of each value, not the declared type.
fn decode_row(row: &SqliteRow, columns: &Arc<[ColumnInfo]>) -> Result<Row, DbError> {
    let mut values = Vec::with_capacity(row.len());
    for index in 0..row.len() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::Int(row.try_get_unchecked::<i64, _>(index)?),
                "REAL" => Value::Float(row.try_get_unchecked::<f64, _>(index)?),
                "BLOB" => Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?),
                _ => Value::Text(row.try_get_unchecked::<String, _>(index)?),
            }
        };
        values.push(value);
    }
    Ok(Row::new(Arc::clone(columns), values))
}

// =============================================================================
// Connection
// =============================================================================

struct SqliteNative {
    conn: SqliteConnection,
}

impl SqliteNative {
    fn rows<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> impl Stream<Item = Result<Row, DbError>> + Send + 'a {
        try_stream! {
            let mut rows = sqlite_query(command).fetch(&mut self.conn);
            let mut columns: Option<Arc<[ColumnInfo]>> = None;
            while let Some(row) = rows.try_next().await? {
                let shared = columns.get_or_insert_with(|| column_infos(row.columns()));
                yield decode_row(&row, shared)?;
            }
        }
    }
}

#[async_trait]
impl NativeConnection for SqliteNative {
    async fn begin(&mut self) -> Result<(), DbError> {
        (&mut self.conn).execute(sqlx::raw_sql("BEGIN")).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        (&mut self.conn).execute(sqlx::raw_sql("COMMIT")).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        (&mut self.conn).execute(sqlx::raw_sql("ROLLBACK")).await?;
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> Result<u64, DbError> {
        let result = sqlite_query(command).execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    fn fetch<'a>(&'a mut self, command: &'a Command) -> RowStream<'a> {
        Box::pin(self.rows(command))
    }

    async fn describe(&mut self, command: &Command) -> Result<Vec<ColumnInfo>, DbError> {
        let statement = (&mut self.conn).prepare(command.native_text()).await?;
        Ok(statement
            .columns()
            .iter()
            .map(|c| ColumnInfo::new(c.name(), c.type_info().name()))
            .collect())
    }

    async fn call_procedure(&mut self, command: &Command) -> Result<ProcedureResult, DbError> {
        Err(DbError::NotSupported(format!(
            "SQLite has no stored procedures: {}",
            command.text()
        )))
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        self.conn.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Credentials {
        Credentials::file(":memory:")
    }

    fn bound(text: &str, params: &[ParamBind]) -> Command {
        let mut command = Command::default();
        SqliteAdapter.bind(&mut command, text, params).unwrap();
        command
    }

    #[test]
    fn test_native_text_is_numbered() {
        let command = bound(
            "SELECT :a, :b, :a",
            &[ParamBind::new("a", 1), ParamBind::new("b", "x")],
        );
        assert_eq!(command.native_text(), "SELECT ?1, ?2, ?1");
        assert_eq!(command.native_args(), &[Value::Int(1), Value::from("x")]);
    }

    #[test]
    fn test_procedures_not_supported() {
        let mut command = Command::default();
        let err = SqliteAdapter
            .bind_procedure(&mut command, "p", &[])
            .unwrap_err();
        assert!(matches!(err, DbError::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_round_trip_storage_classes() {
        let mut conn = SqliteAdapter.connect(&memory()).await.unwrap();
        let command = bound(
            "SELECT :i AS i, :f AS f, :t AS t, :b AS b, :n AS n",
            &[
                ParamBind::new("i", 42),
                ParamBind::new("f", 1.5),
                ParamBind::new("t", "hello"),
                ParamBind::new("b", vec![1u8, 2, 3]),
                ParamBind::null("n"),
            ],
        );
        let table = conn.query(&command).await.unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(
            table.rows()[0],
            vec![
                Value::Int(42),
                Value::Float(1.5),
                Value::from("hello"),
                Value::Bytes(vec![1, 2, 3]),
                Value::Null,
            ]
        );
        assert_eq!(table.columns()[2].name, "t");
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_describe_empty_result() {
        let mut conn = SqliteAdapter.connect(&memory()).await.unwrap();
        conn.execute(&bound("CREATE TABLE t (id INTEGER, name TEXT)", &[]))
            .await
            .unwrap();
        let table = conn.query(&bound("SELECT * FROM t", &[])).await.unwrap();
        assert!(table.is_empty());
        let names: Vec<&str> = table.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name"]);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let mut conn = SqliteAdapter.connect(&memory()).await.unwrap();
        conn.execute(&bound("CREATE TABLE t (id INTEGER)", &[]))
            .await
            .unwrap();
        conn.begin().await.unwrap();
        let inserted = conn
            .execute(&bound("INSERT INTO t VALUES (:id)", &[ParamBind::new("id", 1)]))
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        conn.rollback().await.unwrap();
        let table = conn.query(&bound("SELECT * FROM t", &[])).await.unwrap();
        assert_eq!(table.row_count(), 0);
    }
}
