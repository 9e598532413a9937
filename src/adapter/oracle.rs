//! Oracle adapter over `oracle-rs`, a pure-Rust TNS driver.
//!
//! Statement placeholders render as `:1..:n`, one per occurrence in text
//! order. Procedure blocks bind each parameter by its name. The driver never
//! autocommits, so statements outside a transaction are committed here.
//! Temporal values travel as text in the session's NLS formats, which are
//! pinned on connect.

use std::mem;
use std::path::Path;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use oracle_rs::{BindParam, Config, Connection, LobData, LobLocator, LobValue, OracleType};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Adapter, EngineKind, NativeConnection, RowStream};
use crate::session::{
    BLOB_CHUNK_SIZE, BlobFiles, ColumnInfo, Command, Credentials, DbError, Direction, NativeStyle,
    ParamBind, ProcedureResult, Row, Value, write_value,
};

/// Rows requested per round trip after the first.
const FETCH_SIZE: u32 = 500;

const DEFAULT_OUTPUT_SIZE: u32 = 4000;

const SESSION_SETUP: [&str; 4] = [
    "ALTER SESSION SET NLS_DATE_FORMAT = 'YYYY-MM-DD HH24:MI:SS'",
    "ALTER SESSION SET NLS_TIMESTAMP_FORMAT = 'YYYY-MM-DD HH24:MI:SS.FF6'",
    "ALTER SESSION SET NLS_TIMESTAMP_TZ_FORMAT = 'YYYY-MM-DD\"T\"HH24:MI:SS.FF6TZH:TZM'",
    "ALTER SESSION SET NLS_NUMERIC_CHARACTERS = '.,'",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct OracleAdapter;

#[async_trait]
impl Adapter for OracleAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Oracle
    }

    fn native_style(&self) -> NativeStyle {
        NativeStyle::COLON
    }

    fn connection_string(&self, c: &Credentials) -> String {
        format!(
            "oracle://{}@{}:{}/{}",
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
        let config = Config::new(
            &credentials.host,
            credentials.port_or_default(self.kind()),
            &credentials.database,
            &credentials.username,
            &credentials.password,
        );
        let conn = Connection::connect_with_config(config).await?;
        for statement in SESSION_SETUP {
            conn.execute(statement, &[]).await?;
        }
        debug!(host = %credentials.host, service = %credentials.database, "oracle connection opened");
        Ok(Box::new(OracleNative {
            conn,
            in_transaction: false,
        }))
    }

    /// Oracle rejects `AS` before a table alias, and `_x` needs quoting.
    fn derived_table(&self, query: &str, alias: &str) -> String {
        format!("({query}) \"{alias}\"")
    }

    fn probe_query(&self, relation: &str) -> String {
        format!("SELECT * FROM {relation} WHERE 1=0")
    }

    fn max_bind_params(&self) -> usize {
        u16::MAX as usize
    }

    fn max_insert_rows(&self) -> usize {
        500
    }

    /// `INSERT ALL INTO t (..) VALUES (..) ... SELECT 1 FROM DUAL`.
    fn insert_statement(&self, table: &str, columns: &[String], rows: &[Vec<String>]) -> String {
        let columns = columns.join(", ");
        let mut text = String::from("INSERT ALL");
        for row in rows {
            text.push_str(&format!(" INTO {table} ({columns}) VALUES ({})", row.join(", ")));
        }
        text.push_str(" SELECT 1 FROM DUAL");
        text
    }
}

// =============================================================================
// Values
// =============================================================================

fn ora_value(value: &Value) -> oracle_rs::Value {
    use oracle_rs::Value as Ora;
    match value {
        Value::Null => Ora::Null,
        Value::Bool(b) => Ora::Integer(i64::from(*b)),
        Value::Int(i) => Ora::Integer(*i),
        Value::Float(f) => Ora::Float(*f),
        Value::Bytes(b) => Ora::Bytes(b.clone()),
        Value::Date(d) => Ora::String(d.format("%Y-%m-%d 00:00:00").to_string()),
        Value::DateTime(dt) => Ora::String(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        Value::DateTimeTz(dt) => {
            Ora::String(dt.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string())
        }
        other => Ora::String(other.to_string()),
    }
}

fn ora_args(command: &Command) -> Vec<oracle_rs::Value> {
    command.native_args().iter().map(ora_value).collect()
}

fn column_infos(columns: &[oracle_rs::ColumnInfo]) -> Arc<[ColumnInfo]> {
    columns
        .iter()
        .map(|c| ColumnInfo::new(c.name.clone(), format!("{:?}", c.oracle_type)))
        .collect()
}

async fn decode_value(
    conn: &Connection,
    value: oracle_rs::Value,
    column: &ColumnInfo,
) -> Result<Value, DbError> {
    use oracle_rs::Value as Ora;
    Ok(match value {
        Ora::Null => Value::Null,
        Ora::String(s) if column.type_name == "Number" => Value::Numeric(s),
        Ora::String(s) => Value::Text(s),
        Ora::Integer(i) => Value::Int(i),
        Ora::Float(f) => Value::Float(f),
        Ora::Boolean(b) => Value::Bool(b),
        Ora::Bytes(b) => Value::Bytes(b.to_vec()),
        Ora::Json(j) => Value::Json(j),
        Ora::Lob(lob) => read_lob(conn, lob).await?,
        other => Value::Text(format!("{other:?}")),
    })
}

async fn read_lob(conn: &Connection, lob: LobValue) -> Result<Value, DbError> {
    Ok(match lob {
        LobValue::Null => Value::Null,
        LobValue::Empty => Value::Bytes(Vec::new()),
        LobValue::Locator(locator) if locator.is_clob() => {
            Value::Text(conn.read_clob(&locator).await?)
        }
        LobValue::Locator(locator) => Value::Bytes(conn.read_blob(&locator).await?.to_vec()),
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    })
}

/// Copies a lob to `path` one range read at a time.
async fn write_lob(conn: &Connection, locator: &LobLocator, path: &Path) -> Result<(), DbError> {
    let mut file = File::create(path).await?;
    let size = locator.size();
    let mut offset = 1u64;
    while offset <= size {
        let amount = (size - offset + 1).min(BLOB_CHUNK_SIZE as u64);
        match conn.read_lob_range(locator, offset, amount).await? {
            LobData::Bytes(bytes) => file.write_all(&bytes).await?,
            LobData::String(text) => file.write_all(text.as_bytes()).await?,
        }
        offset += amount;
    }
    file.flush().await?;
    Ok(())
}

async fn decode_row(
    conn: &Connection,
    row: oracle_rs::Row,
    columns: &Arc<[ColumnInfo]>,
) -> Result<Row, DbError> {
    let mut values = Vec::with_capacity(columns.len());
    for (value, column) in row.into_values().into_iter().zip(columns.iter()) {
        values.push(decode_value(conn, value, column).await?);
    }
    Ok(Row::new(Arc::clone(columns), values))
}

/// Anonymous PL/SQL block wrapping a procedure call.
struct ProcedureBlock {
    text: String,
    /// Bind names in the order they first appear in `text`.
    names: Vec<String>,
    /// Values for `names`, in the same order.
    binds: Vec<BindParam>,
    /// Parameters whose value comes back through an output bind, in bind
    /// order.
    outputs: Vec<String>,
}

/// Builds an anonymous block around the procedure call.
///
/// Every bind is named after its parameter. OUT and INOUT parameters go
/// through a local variable whose final value is assigned to an output
/// bind:
///
/// ```text
/// DECLARE
///   v_total VARCHAR2(4000) := :i_total;
/// BEGIN
///   add_item(name => :i_name, total => v_total);
///   :o_total := v_total;
/// END;
/// ```
///
/// The driver takes a value list that PL/SQL matches to distinct bind names
/// in order of first appearance, so values are collected in text order:
/// declarations, then call arguments, then output assignments.
fn procedure_block(command: &Command) -> ProcedureBlock {
    let mut declares = Vec::new();
    let mut declare_binds = Vec::new();
    let mut arguments = Vec::new();
    let mut argument_binds = Vec::new();
    let mut assignments = Vec::new();
    let mut output_binds = Vec::new();
    let mut outputs = Vec::new();

    for param in command.params() {
        let input = format!("i_{}", param.name);
        if param.direction.is_output() {
            let variable = format!("v_{}", param.name);
            let size = param.size.unwrap_or(DEFAULT_OUTPUT_SIZE);
            let initial = if param.direction == Direction::InOut {
                declare_binds.push((input.clone(), BindParam::input(ora_value(&param.value))));
                format!(" := :{input}")
            } else {
                String::new()
            };
            declares.push(format!("  {variable} VARCHAR2({size}){initial};"));
            arguments.push(format!("{} => {variable}", param.name));

            let output = format!("o_{}", param.name);
            assignments.push(format!("  :{output} := {variable};"));
            output_binds.push((output, BindParam::output(OracleType::Varchar, size)));
            outputs.push(param.name.clone());
        } else {
            arguments.push(format!("{} => :{input}", param.name));
            argument_binds.push((input, BindParam::input(ora_value(&param.value))));
        }
    }

    let mut text = String::new();
    if !declares.is_empty() {
        text.push_str("DECLARE\n");
        text.push_str(&declares.join("\n"));
        text.push('\n');
    }
    text.push_str("BEGIN\n");
    text.push_str(&format!("  {}({});\n", command.text(), arguments.join(", ")));
    for assignment in assignments {
        text.push_str(&assignment);
        text.push('\n');
    }
    text.push_str("END;");

    let (names, binds) = declare_binds
        .into_iter()
        .chain(argument_binds)
        .chain(output_binds)
        .unzip();
    ProcedureBlock {
        text,
        names,
        binds,
        outputs,
    }
}

// =============================================================================
// Connection
// =============================================================================

struct OracleNative {
    conn: Connection,
    in_transaction: bool,
}

impl OracleNative {
    async fn autocommit(&self) -> Result<(), DbError> {
        if !self.in_transaction {
            self.conn.commit().await?;
        }
        Ok(())
    }

    fn rows<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> impl Stream<Item = Result<Row, DbError>> + Send + 'a {
        let conn = &self.conn;
        try_stream! {
            let mut result = conn.query(command.native_text(), &ora_args(command)).await?;
            let native_columns = result.columns.clone();
            let columns = column_infos(&native_columns);
            loop {
                for row in mem::take(&mut result.rows) {
                    yield decode_row(conn, row, &columns).await?;
                }
                if !result.has_more_rows {
                    break;
                }
                result = conn.fetch_more(result.cursor_id, &native_columns, FETCH_SIZE).await?;
            }
        }
    }
}

#[async_trait]
impl NativeConnection for OracleNative {
    async fn begin(&mut self) -> Result<(), DbError> {
        self.conn
            .execute("SET TRANSACTION ISOLATION LEVEL READ COMMITTED", &[])
            .await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.conn.commit().await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.in_transaction = false;
        self.conn.rollback().await?;
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> Result<u64, DbError> {
        let result = self
            .conn
            .execute(command.native_text(), &ora_args(command))
            .await?;
        self.autocommit().await?;
        Ok(result.rows_affected)
    }

    fn fetch<'a>(&'a mut self, command: &'a Command) -> RowStream<'a> {
        Box::pin(self.rows(command))
    }

    async fn describe(&mut self, command: &Command) -> Result<Vec<ColumnInfo>, DbError> {
        let result = self
            .conn
            .query(command.native_text(), &ora_args(command))
            .await?;
        Ok(column_infos(&result.columns).to_vec())
    }

    async fn write_blobs(&mut self, command: &Command, files: &mut BlobFiles) -> Result<(), DbError> {
        let conn = &self.conn;
        let mut result = conn.query(command.native_text(), &ora_args(command)).await?;
        let native_columns = result.columns.clone();
        let columns = column_infos(&native_columns);
        loop {
            for row in mem::take(&mut result.rows) {
                let mut values = row.into_values().into_iter();
                let blob = values.next().unwrap_or(oracle_rs::Value::Null);
                let name = match (values.next(), columns.get(1)) {
                    (Some(value), Some(column)) => Some(decode_value(conn, value, column).await?),
                    _ => None,
                };
                let path = files.next_path(columns.len(), name.as_ref())?;
                match blob {
                    oracle_rs::Value::Lob(LobValue::Locator(locator)) => {
                        write_lob(conn, &locator, &path).await?;
                    }
                    other => {
                        let value = match columns.first() {
                            Some(column) => decode_value(conn, other, column).await?,
                            None => Value::Null,
                        };
                        write_value(&path, Some(&value)).await?;
                    }
                }
            }
            if !result.has_more_rows {
                break;
            }
            result = conn.fetch_more(result.cursor_id, &native_columns, FETCH_SIZE).await?;
        }
        Ok(())
    }

    async fn call_procedure(&mut self, command: &Command) -> Result<ProcedureResult, DbError> {
        let block = procedure_block(command);
        debug!(binds = ?block.names, "calling oracle procedure");
        let result = self.conn.execute_plsql(&block.text, &block.binds).await?;
        self.autocommit().await?;

        let mut parameters: Vec<ParamBind> = command.params().iter().map(ParamBind::from).collect();
        for (index, name) in block.outputs.iter().enumerate() {
            let value = match result.get_string(index) {
                Some(text) => Value::Text(text.to_string()),
                None => Value::Null,
            };
            if let Some(param) = parameters.iter_mut().find(|p| p.name == *name) {
                param.set_value(value);
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
