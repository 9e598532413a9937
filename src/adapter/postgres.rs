//! PostgreSQL adapter over `sqlx`.
//!
//! Named placeholders render as `$n`, numbered per distinct name. Bulk
//! inserts use binary `COPY`, and procedures are invoked as `CALL` text so
//! that OUT parameters come back as the single result row.

mod copy;
mod numeric;

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{Stream, TryStreamExt};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::{Oid, PgInterval, PgMoney};
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgConnection, PgRow, PgTypeInfo,
    PgValueFormat, PgValueRef,
};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, Postgres, Row as _, Statement, TypeInfo, ValueRef};
use tracing::debug;

use self::copy::{BinaryCopyEncoder, WireType};
use self::numeric::{decode_numeric, encode_numeric};
use super::insert::match_columns;
use super::{Adapter, BulkMode, EngineKind, NativeConnection, RowStream};
use crate::session::{
    ColumnInfo, Command, Credentials, DataTable, DbError, NativeStyle, ParamBind, ProcedureResult,
    Row, Value,
};

/// Bytes buffered before a COPY chunk is sent.
const COPY_CHUNK_SIZE: usize = 256 * 1024;

const OID_XML: u32 = 142;
const OID_NUMERIC: u32 = 1700;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

#[async_trait]
impl Adapter for PostgresAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    fn native_style(&self) -> NativeStyle {
        NativeStyle::DOLLAR
    }

    fn connection_string(&self, c: &Credentials) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
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
        let options = PgConnectOptions::new()
            .host(&credentials.host)
            .port(credentials.port_or_default(self.kind()))
            .username(&credentials.username)
            .password(&credentials.password)
            .database(&credentials.database);
        let conn = PgConnection::connect_with(&options).await?;
        debug!(host = %credentials.host, database = %credentials.database, "postgres connection opened");
        Ok(Box::new(PgNative { conn }))
    }

    /// Binds `CALL name(:a, :b, ...)` over the parameter names.
    fn bind_procedure(
        &self,
        command: &mut Command,
        name: &str,
        params: &[ParamBind],
    ) -> Result<(), DbError> {
        if name.trim().is_empty() {
            return Err(DbError::Bind("procedure name is empty".to_string()));
        }
        let prefix = self.placeholder_prefix();
        let args: Vec<String> = params
            .iter()
            .map(|p| format!("{prefix}{}", p.name.trim_start_matches(prefix)))
            .collect();
        let text = format!("CALL {name}({})", args.join(", "));
        self.bind(command, &text, params)
    }

    fn bulk_mode(&self) -> BulkMode {
        BulkMode::BinaryCopy
    }

    fn max_bind_params(&self) -> usize {
        u16::MAX as usize
    }
}

// =============================================================================
// Parameter types
// =============================================================================

/// NULL with no declared type; the server infers it from context.
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Pre-encoded bytes sent as the given builtin type.
struct RawParam<const OID: u32>(Vec<u8>);

impl<const OID: u32> sqlx::Type<Postgres> for RawParam<OID> {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(OID))
    }
}

impl<const OID: u32> sqlx::Encode<'_, Postgres> for RawParam<OID> {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        buf.extend_from_slice(&self.0);
        Ok(IsNull::No)
    }
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

fn bind_value<'q>(query: PgQuery<'q>, value: &Value) -> Result<PgQuery<'q>, DbError> {
    Ok(match value {
        Value::Null => query.bind(UntypedNull),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Numeric(s) => query.bind(RawParam::<OID_NUMERIC>(encode_numeric(s)?)),
        Value::Money(c) => query.bind(PgMoney(*c)),
        Value::Text(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
        Value::Uuid(u) => query.bind(*u),
        Value::Date(d) => query.bind(*d),
        Value::Time(t) => query.bind(*t),
        Value::DateTime(dt) => query.bind(*dt),
        Value::DateTimeTz(dt) => query.bind(*dt),
        Value::Interval {
            months,
            days,
            micros,
        } => query.bind(PgInterval {
            months: *months,
            days: *days,
            microseconds: *micros,
        }),
        Value::Json(j) => query.bind(j.clone()),
        Value::Xml(s) => query.bind(RawParam::<OID_XML>(s.clone().into_bytes())),
    })
}

fn pg_query(command: &Command) -> Result<PgQuery<'_>, DbError> {
    command
        .native_args()
        .iter()
        .try_fold(sqlx::query(command.native_text()), bind_value)
}

// =============================================================================
// Decoding
// =============================================================================

fn column_infos<C: Column>(columns: &[C]) -> Arc<[ColumnInfo]> {
    columns
        .iter()
        .map(|c| ColumnInfo::new(c.name(), c.type_info().name()))
        .collect()
}

fn raw_text(raw: &PgValueRef<'_>) -> Result<String, DbError> {
    raw.as_str()
        .map(str::to_string)
        .map_err(|e| DbError::conversion("text", e))
}

fn decode_value(row: &PgRow, index: usize) -> Result<Value, DbError> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "BOOL" => Value::Bool(row.try_get(index)?),
        "INT2" => Value::Int(row.try_get::<i16, _>(index)?.into()),
        "INT4" => Value::Int(row.try_get::<i32, _>(index)?.into()),
        "INT8" => Value::Int(row.try_get(index)?),
        "OID" => Value::Int(row.try_get::<Oid, _>(index)?.0.into()),
        "FLOAT4" => Value::Float(row.try_get::<f32, _>(index)?.into()),
        "FLOAT8" => Value::Float(row.try_get(index)?),
        "NUMERIC" => {
            let bytes = raw.as_bytes().map_err(|e| DbError::conversion("numeric", e))?;
            match raw.format() {
                PgValueFormat::Binary => Value::Numeric(decode_numeric(bytes)?),
                PgValueFormat::Text => Value::Numeric(raw_text(&raw)?),
            }
        }
        "MONEY" => Value::Money(row.try_get::<PgMoney, _>(index)?.0),
        "UUID" => Value::Uuid(row.try_get(index)?),
        "BYTEA" => Value::Bytes(row.try_get(index)?),
        "DATE" => Value::Date(row.try_get::<NaiveDate, _>(index)?),
        "TIME" => Value::Time(row.try_get::<NaiveTime, _>(index)?),
        "TIMESTAMP" => Value::DateTime(row.try_get::<NaiveDateTime, _>(index)?),
        "TIMESTAMPTZ" => Value::DateTimeTz(row.try_get::<DateTime<Utc>, _>(index)?.fixed_offset()),
        "INTERVAL" => {
            let iv: PgInterval = row.try_get(index)?;
            Value::Interval {
                months: iv.months,
                days: iv.days,
                micros: iv.microseconds,
            }
        }
        "JSON" | "JSONB" => Value::Json(row.try_get(index)?),
        "XML" => Value::Xml(raw_text(&raw)?),
        _ => match raw_text(&raw) {
            Ok(text) => Value::Text(text),
            Err(_) => Value::Bytes(
                raw.as_bytes()
                    .map_err(|e| DbError::conversion("bytes", e))?
                    .to_vec(),
            ),
        },
    };
    Ok(value)
}

fn decode_row(row: &PgRow, columns: &Arc<[ColumnInfo]>) -> Result<Row, DbError> {
    let values = (0..row.len())
        .map(|index| decode_value(row, index))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

// =============================================================================
// Connection
// =============================================================================

struct PgNative {
    conn: PgConnection,
}

impl PgNative {
    fn rows<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> impl Stream<Item = Result<Row, DbError>> + Send + 'a {
        try_stream! {
            let query = pg_query(command)?;
            let mut rows = query.fetch(&mut self.conn);
            let mut columns: Option<Arc<[ColumnInfo]>> = None;
            while let Some(row) = rows.try_next().await? {
                let shared = columns.get_or_insert_with(|| column_infos(row.columns()));
                yield decode_row(&row, shared)?;
            }
        }
    }
}

#[async_trait]
impl NativeConnection for PgNative {
    async fn begin(&mut self) -> Result<(), DbError> {
        (&mut self.conn).execute(sqlx::raw_sql("BEGIN ISOLATION LEVEL READ COMMITTED"))
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
        let result = pg_query(command)?.execute(&mut self.conn).await?;
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

    /// Runs the bound `CALL` and copies OUT columns into the parameters.
    async fn call_procedure(&mut self, command: &Command) -> Result<ProcedureResult, DbError> {
        let row = pg_query(command)?.fetch_optional(&mut self.conn).await?;
        let mut parameters: Vec<ParamBind> = command.params().iter().map(ParamBind::from).collect();
        if let Some(row) = row {
            let decoded = decode_row(&row, &column_infos(row.columns()))?;
            for param in parameters
                .iter_mut()
                .filter(|p| p.direction.is_some_and(|d| d.is_output()))
            {
                if let Some(value) = decoded.get_by_name(&param.name) {
                    param.set_value(value.clone());
                }
            }
        }
        Ok(ProcedureResult {
            status: 0,
            parameters,
        })
    }

    async fn copy_in(
        &mut self,
        table: &str,
        target: &[ColumnInfo],
        data: &DataTable,
    ) -> Result<u64, DbError> {
        let matched = match_columns(target, data)?;
        let types = matched
            .iter()
            .map(|c| {
                WireType::from_type_name(&c.type_name).ok_or_else(|| {
                    DbError::NotSupported(format!(
                        "column {} has type {} which binary copy cannot encode",
                        c.name, c.type_name
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let columns: Vec<String> = matched
            .iter()
            .map(|c| PostgresAdapter.quote_identifier(&c.name))
            .collect();
        let statement = format!(
            "COPY {table} ({}) FROM STDIN (FORMAT BINARY)",
            columns.join(", ")
        );

        let mut copy = self.conn.copy_in_raw(&statement).await?;
        let mut encoder = BinaryCopyEncoder::new(types);
        for row in data.rows() {
            if let Err(err) = encoder.write_row(row) {
                copy.abort(err.to_string()).await?;
                return Err(err);
            }
            if encoder.buffered() >= COPY_CHUNK_SIZE {
                copy.send(encoder.take()).await?;
            }
        }
        copy.send(encoder.finish()).await?;
        Ok(copy.finish().await?)
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        self.conn.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Direction;

    fn bound(text: &str, params: &[ParamBind]) -> Command {
        let mut command = Command::default();
        PostgresAdapter.bind(&mut command, text, params).unwrap();
        command
    }

    #[test]
    fn test_dollar_placeholders_per_name() {
        let command = bound(
            "SELECT * FROM t WHERE a = :a AND b = :b OR a > :a",
            &[ParamBind::new("a", 1), ParamBind::new("b", 2)],
        );
        assert_eq!(
            command.native_text(),
            "SELECT * FROM t WHERE a = $1 AND b = $2 OR a > $1"
        );
        assert_eq!(command.native_args().len(), 2);
    }

    #[test]
    fn test_casts_are_not_placeholders() {
        let command = bound("SELECT :v::text", &[ParamBind::new("v", 5)]);
        assert_eq!(command.native_text(), "SELECT $1::text");
    }

    #[test]
    fn test_procedure_becomes_call() {
        let mut command = Command::default();
        PostgresAdapter
            .bind_procedure(
                &mut command,
                "add_item",
                &[
                    ParamBind::new(":name", "pen"),
                    ParamBind::output("total", 0).with_direction(Direction::InOut),
                ],
            )
            .unwrap();
        assert_eq!(command.text(), "CALL add_item(:name, :total)");
        assert_eq!(command.native_text(), "CALL add_item($1, $2)");
        assert_eq!(command.audit_text(), "CALL add_item('pen', NULL)");
    }

    #[test]
    fn test_connection_string_hides_password() {
        let creds = Credentials::new("db.local", 0, "app", "s3cret", "sales");
        let text = PostgresAdapter.connection_string(&creds);
        assert_eq!(text, "postgres://app@db.local:5432/sales");
        assert!(!text.contains("s3cret"));
    }

    #[test]
    fn test_invalid_numeric_fails_binding() {
        let command = bound("SELECT :n", &[ParamBind::new("n", Value::Numeric("1e5".into()))]);
        assert!(pg_query(&command).is_err());
    }

    #[test]
    fn test_bulk_mode_is_copy() {
        assert_eq!(PostgresAdapter.bulk_mode(), BulkMode::BinaryCopy);
        assert_eq!(
            PostgresAdapter.probe_query("(SELECT 1) AS _x"),
            "SELECT * FROM (SELECT 1) AS _x LIMIT 1"
        );
    }
}
