//! SQL Server adapter over `tiberius`.
//!
//! Named placeholders render as `@P1..@Pn`, one per distinct name.
//! Procedures run inside a generated batch that captures the return status
//! and OUTPUT variables in a final result set.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::{Stream, TryStreamExt};
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use super::{Adapter, EngineKind, NativeConnection, RowStream};
use crate::session::{
    ColumnInfo, Command, Credentials, DbError, Direction, NativeStyle, ParamBind, ProcedureResult,
    Row, Value, format_money,
};

/// SQL Server accepts 2100 parameters; leave room for the generated ones.
const MAX_BIND_PARAMS: usize = 2000;

/// Buffer size of an OUTPUT variable without a size hint.
const DEFAULT_OUTPUT_SIZE: u32 = 4000;

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerAdapter;

#[async_trait]
impl Adapter for SqlServerAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::SqlServer
    }

    fn native_style(&self) -> NativeStyle {
        NativeStyle::AT_P
    }

    fn connection_string(&self, c: &Credentials) -> String {
        format!(
            "sqlserver://{}@{}:{}/{}",
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
        let mut config = Config::new();
        config.host(&credentials.host);
        config.port(credentials.port_or_default(self.kind()));
        config.database(&credentials.database);
        config.authentication(AuthMethod::sql_server(
            &credentials.username,
            &credentials.password,
        ));
        config.trust_cert();

        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(config, tcp.compat_write()).await?;
        debug!(host = %credentials.host, database = %credentials.database, "sql server connection opened");
        Ok(Box::new(SqlServerNative { client }))
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn probe_query(&self, relation: &str) -> String {
        format!("SELECT TOP 0 * FROM {relation}")
    }

    fn max_bind_params(&self) -> usize {
        MAX_BIND_PARAMS
    }
}

// =============================================================================
// Binding and decoding
// =============================================================================

fn bind_value(query: &mut Query<'_>, value: &Value) {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Money(c) => query.bind(format_money(*c)),
        Value::Bytes(b) => query.bind(b.clone()),
        Value::Uuid(u) => query.bind(*u),
        Value::Date(d) => query.bind(*d),
        Value::Time(t) => query.bind(*t),
        Value::DateTime(dt) => query.bind(*dt),
        Value::DateTimeTz(dt) => query.bind(*dt),
        other => query.bind(other.to_string()),
    }
}

fn mssql_query<'a>(text: &'a str, args: &[Value]) -> Query<'a> {
    let mut query = Query::new(text);
    for value in args {
        bind_value(&mut query, value);
    }
    query
}

fn column_infos(columns: &[tiberius::Column]) -> Arc<[ColumnInfo]> {
    columns
        .iter()
        .map(|c| ColumnInfo::new(c.name(), format!("{:?}", c.column_type())))
        .collect()
}

fn decode_data(data: ColumnData<'static>) -> Result<Value, DbError> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| Value::Int(v.into())),
        ColumnData::I16(v) => v.map(|v| Value::Int(v.into())),
        ColumnData::I32(v) => v.map(|v| Value::Int(v.into())),
        ColumnData::I64(v) => v.map(Value::Int),
        ColumnData::F32(v) => v.map(|v| Value::Float(v.into())),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.map(|s| Value::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map(Value::Uuid),
        ColumnData::Binary(v) => v.map(|b| Value::Bytes(b.into_owned())),
        ColumnData::Numeric(v) => v.map(|n| Value::Numeric(n.to_string())),
        ColumnData::Xml(v) => v.map(|x| Value::Xml(x.into_owned().into_string())),
        data @ ColumnData::Date(_) => NaiveDate::from_sql(&data)?.map(Value::Date),
        data @ ColumnData::Time(_) => NaiveTime::from_sql(&data)?.map(Value::Time),
        data @ ColumnData::DateTimeOffset(_) => {
            DateTime::<FixedOffset>::from_sql(&data)?.map(Value::DateTimeTz)
        }
        data @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => NaiveDateTime::from_sql(&data)?.map(Value::DateTime),
        #[allow(unreachable_patterns)]
        _ => None,
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decode_row(row: tiberius::Row, columns: &Arc<[ColumnInfo]>) -> Result<Row, DbError> {
    let values = row
        .into_iter()
        .map(decode_data)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

/// Local variable carrying an OUTPUT parameter through the batch.
fn output_variable(name: &str) -> String {
    format!("@o_{name}")
}

/// Builds the procedure batch and its positional arguments.
///
/// ```text
/// DECLARE @rc INT;
/// DECLARE @o_total NVARCHAR(4000) = @P1;
/// EXEC @rc = add_item @name = @P2, @total = @o_total OUTPUT;
/// SELECT @rc AS [status], @o_total AS [total];
/// ```
fn procedure_batch(command: &Command) -> (String, Vec<Value>) {
    let mut declares = vec!["DECLARE @rc INT;".to_string()];
    let mut args = Vec::new();
    let mut assignments = Vec::new();
    let mut selected = vec!["@rc AS [status]".to_string()];

    for param in command.params() {
        if param.direction.is_output() {
            let variable = output_variable(&param.name);
            let size = param.size.unwrap_or(DEFAULT_OUTPUT_SIZE);
            let initial = match param.direction {
                Direction::InOut => {
                    args.push(param.value.clone());
                    format!(" = @P{}", args.len())
                }
                _ => String::new(),
            };
            declares.push(format!("DECLARE {variable} NVARCHAR({size}){initial};"));
            assignments.push(format!("@{} = {variable} OUTPUT", param.name));
            selected.push(format!(
                "{variable} AS {}",
                SqlServerAdapter.quote_identifier(&param.name)
            ));
        } else {
            args.push(param.value.clone());
            assignments.push(format!("@{} = @P{}", param.name, args.len()));
        }
    }

    let exec = if assignments.is_empty() {
        format!("EXEC @rc = {};", command.text())
    } else {
        format!("EXEC @rc = {} {};", command.text(), assignments.join(", "))
    };
    let batch = format!(
        "{}\n{exec}\nSELECT {};",
        declares.join("\n"),
        selected.join(", ")
    );
    (batch, args)
}

// =============================================================================
// Connection
// =============================================================================

struct SqlServerNative {
    client: Client<Compat<TcpStream>>,
}

impl SqlServerNative {
    async fn simple(&mut self, sql: &str) -> Result<(), DbError> {
        self.client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    fn rows<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> impl Stream<Item = Result<Row, DbError>> + Send + 'a {
        try_stream! {
            let query = mssql_query(command.native_text(), command.native_args());
            let mut rows = query.query(&mut self.client).await?.into_row_stream();
            let mut columns: Option<Arc<[ColumnInfo]>> = None;
            while let Some(row) = rows.try_next().await? {
                let shared = columns.get_or_insert_with(|| column_infos(row.columns()));
                yield decode_row(row, shared)?;
            }
        }
    }
}

#[async_trait]
impl NativeConnection for SqlServerNative {
    async fn begin(&mut self) -> Result<(), DbError> {
        self.simple("SET TRANSACTION ISOLATION LEVEL READ COMMITTED; BEGIN TRANSACTION")
            .await
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.simple("COMMIT TRANSACTION").await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.simple("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
    }

    async fn execute(&mut self, command: &Command) -> Result<u64, DbError> {
        let result = mssql_query(command.native_text(), command.native_args())
            .execute(&mut self.client)
            .await?;
        Ok(result.total())
    }

    fn fetch<'a>(&'a mut self, command: &'a Command) -> RowStream<'a> {
        Box::pin(self.rows(command))
    }

    async fn describe(&mut self, command: &Command) -> Result<Vec<ColumnInfo>, DbError> {
        let mut stream = mssql_query(command.native_text(), command.native_args())
            .query(&mut self.client)
            .await?;
        let columns = stream
            .columns()
            .await?
            .map(|columns| column_infos(columns).to_vec())
            .unwrap_or_default();
        stream.into_results().await?;
        Ok(columns)
    }

    async fn call_procedure(&mut self, command: &Command) -> Result<ProcedureResult, DbError> {
        let (batch, args) = procedure_batch(command);
        let results = mssql_query(&batch, &args)
            .query(&mut self.client)
            .await?
            .into_results()
            .await?;

        let mut parameters: Vec<ParamBind> = command.params().iter().map(ParamBind::from).collect();
        let mut status = 0;
        if let Some(row) = results.into_iter().last().and_then(|set| set.into_iter().next()) {
            let columns = column_infos(row.columns());
            let decoded = decode_row(row, &columns)?;
            status = decoded
                .get_by_name("status")
                .and_then(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .unwrap_or(0);
            for param in parameters
                .iter_mut()
                .filter(|p| p.direction.is_some_and(|d| d.is_output()))
            {
                if let Some(value) = decoded.get_by_name(&param.name) {
                    param.set_value(value.clone());
                }
            }
        }
        Ok(ProcedureResult { status, parameters })
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        self.client.close().await?;
        Ok(())
    }
}
