//! MySQL adapter over `sqlx`.
//!
//! Callers write `@name` placeholders, which render as positional `?` with
//! one argument per occurrence. Procedure OUT parameters travel through
//! session variables.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{Stream, TryStreamExt};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, MySql, Row as _, Statement, TypeInfo, ValueRef};
use tracing::debug;

use super::{Adapter, EngineKind, NativeConnection, RowStream};
use crate::session::{
    ColumnInfo, Command, Credentials, DbError, Direction, NativeStyle, ParamBind, ProcedureResult,
    Row, Value,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlAdapter;

#[async_trait]
impl Adapter for MySqlAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::MySql
    }

    fn native_style(&self) -> NativeStyle {
        NativeStyle::QUESTION
    }

    fn connection_string(&self, c: &Credentials) -> String {
        format!(
            "mysql://{}@{}:{}/{}",
            c.username,
            c.host,
            c.port_or_default(self.kind()),
            c.database
        )
    }

    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn NativeConnection>, DbError> {
        let options = MySqlConnectOptions::new()
            .host(&credentials.host)
            .port(credentials.port_or_default(self.kind()))
            .username(&credentials.username)
            .password(&credentials.password)
            .database(&credentials.database);
        let conn = MySqlConnection::connect_with(&options).await?;
        debug!(host = %credentials.host, database = %credentials.database, "mysql connection opened");
        Ok(Box::new(MySqlNative { conn }))
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn max_bind_params(&self) -> usize {
        u16::MAX as usize
    }
}

// =============================================================================
// Binding and decoding
// =============================================================================

type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

fn bind_value<'q>(query: MySqlQuery<'q>, value: &Value) -> MySqlQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Bytes(b) => query.bind(b.clone()),
        Value::Date(d) => query.bind(*d),
        Value::Time(t) => query.bind(*t),
        Value::DateTime(dt) => query.bind(*dt),
        Value::DateTimeTz(dt) => query.bind(dt.with_timezone(&Utc)),
        other => query.bind(other.to_string()),
    }
}

fn mysql_query<'q>(text: &'q str, args: &[Value]) -> MySqlQuery<'q> {
    args.iter().fold(sqlx::query(text), bind_value)
}

fn column_infos<C: Column>(columns: &[C]) -> Arc<[ColumnInfo]> {
    columns
        .iter()
        .map(|c| ColumnInfo::new(c.name(), c.type_info().name()))
        .collect()
}

fn decode_value(row: &MySqlRow, index: usize) -> Result<Value, DbError> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get_unchecked(index)?),
        name if name.ends_with("UNSIGNED") => {
            let wide: u64 = row.try_get_unchecked(index)?;
            i64::try_from(wide)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Numeric(wide.to_string()))
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            Value::Int(row.try_get_unchecked(index)?)
        }
        "FLOAT" => Value::Float(row.try_get_unchecked::<f32, _>(index)?.into()),
        "DOUBLE" => Value::Float(row.try_get_unchecked(index)?),
        "DECIMAL" => Value::Numeric(row.try_get_unchecked(index)?),
        "DATE" => Value::Date(row.try_get::<NaiveDate, _>(index)?),
        "TIME" => Value::Time(row.try_get::<NaiveTime, _>(index)?),
        "DATETIME" => Value::DateTime(row.try_get::<NaiveDateTime, _>(index)?),
        "TIMESTAMP" => Value::DateTimeTz(row.try_get::<DateTime<Utc>, _>(index)?.fixed_offset()),
        "JSON" => Value::Json(row.try_get(index)?),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => Value::Bytes(row.try_get_unchecked(index)?),
        _ => match row.try_get_unchecked::<String, _>(index) {
            Ok(text) => Value::Text(text),
            Err(_) => Value::Bytes(row.try_get_unchecked(index)?),
        },
    };
    Ok(value)
}

fn decode_row(row: &MySqlRow, columns: &Arc<[ColumnInfo]>) -> Result<Row, DbError> {
    let values = (0..row.len())
        .map(|index| decode_value(row, index))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

/// Session variable holding an OUT parameter.
fn session_variable(name: &str) -> String {
    format!("@_{name}")
}

// =============================================================================
// Connection
// =============================================================================

struct MySqlNative {
    conn: MySqlConnection,
}

impl MySqlNative {
    fn rows<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> impl Stream<Item = Result<Row, DbError>> + Send + 'a {
        try_stream! {
            let mut rows = mysql_query(command.native_text(), command.native_args()).fetch(&mut self.conn);
            let mut columns: Option<Arc<[ColumnInfo]>> = None;
            while let Some(row) = rows.try_next().await? {
                let shared = columns.get_or_insert_with(|| column_infos(row.columns()));
                yield decode_row(&row, shared)?;
            }
        }
    }
}

#[async_trait]
impl NativeConnection for MySqlNative {
    async fn begin(&mut self) -> Result<(), DbError> {
        (&mut self.conn).execute(sqlx::raw_sql("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"))
            .await?;
        (&mut self.conn).execute(sqlx::raw_sql("START TRANSACTION"))
            .await?;
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
        let result = mysql_query(command.native_text(), command.native_args())
            .execute(&mut self.conn)
            .await?;
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

    /// `CALL name(?, @_out, ...)`, then reads the OUT variables back.
    async fn call_procedure(&mut self, command: &Command) -> Result<ProcedureResult, DbError> {
        let mut args = Vec::with_capacity(command.params().len());
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for param in command.params() {
            if param.direction.is_output() {
                let variable = session_variable(&param.name);
                let initial = match param.direction {
                    Direction::InOut => param.value.clone(),
                    _ => Value::Null,
                };
                let set = format!("SET {variable} = ?");
                mysql_query(&set, std::slice::from_ref(&initial))
                    .execute(&mut self.conn)
                    .await?;
                args.push(variable.clone());
                outputs.push((param.name.clone(), variable));
            } else {
                args.push("?".to_string());
                inputs.push(param.value.clone());
            }
        }

        let call = format!("CALL {}({})", command.text(), args.join(", "));
        mysql_query(&call, &inputs).execute(&mut self.conn).await?;

        let mut parameters: Vec<ParamBind> = command.params().iter().map(ParamBind::from).collect();
        if !outputs.is_empty() {
            let selected: Vec<String> = outputs
                .iter()
                .map(|(name, variable)| format!("{variable} AS {}", MySqlAdapter.quote_identifier(name)))
                .collect();
            let select = format!("SELECT {}", selected.join(", "));
            let row = sqlx::query(&select).fetch_one(&mut self.conn).await?;
            for (index, (name, _)) in outputs.iter().enumerate() {
                let value = decode_value(&row, index)?;
                if let Some(param) = parameters.iter_mut().find(|p| p.name == *name) {
                    param.set_value(value);
                }
            }
        }
        Ok(ProcedureResult {
            status: 0,
            parameters,
        })
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        self.conn.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(text: &str, params: &[ParamBind]) -> Command {
        let mut command = Command::default();
        MySqlAdapter.bind(&mut command, text, params).unwrap();
        command
    }

    #[test]
    fn test_at_placeholders_per_occurrence() {
        let command = bound(
            "SELECT * FROM t WHERE a = @a AND b = @b OR a > @a",
            &[ParamBind::new("@a", 1), ParamBind::new("b", 2)],
        );
        assert_eq!(command.native_text(), "SELECT * FROM t WHERE a = ? AND b = ? OR a > ?");
        assert_eq!(
            command.native_args(),
            &[Value::Int(1), Value::Int(2), Value::Int(1)]
        );
    }

    #[test]
    fn test_session_variables_are_untouched() {
        let command = bound("SELECT @@version, @a", &[ParamBind::new("a", 1)]);
        assert_eq!(command.native_text(), "SELECT @@version, ?");
    }

    #[test]
    fn test_backtick_quoting() {
        assert_eq!(MySqlAdapter.quote_identifier("odd`name"), "`odd``name`");
        assert_eq!(
            MySqlAdapter.count_query("SELECT 1"),
            "SELECT COUNT(*) FROM (SELECT 1) AS _x"
        );
    }

    #[test]
    fn test_session_variable_name() {
        assert_eq!(session_variable("total"), "@_total");
    }
}
