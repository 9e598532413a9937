//! Database Session Layer
//!
//! An engine-agnostic session over one native connection at a time:
//! - **Lifecycle**: `Closed → Open → Closed`, or a transaction bracket
//!   `Closed → OpenInTransaction → Closed`
//! - **Primitives**: scalar, table, typed list, non-query, procedure, schema
//!   probe, live cursor, bulk insert, CSV export and blob retrieval
//! - **Binding**: named placeholders with array expansion, rendered per engine
//!
//! # Components
//!
//! - [`Session`] / [`SessionBuilder`]: the state machine and its construction
//! - [`ParamBind`] / [`Command`]: caller parameters and the bound native command
//! - [`Value`] / [`DataTable`] / [`Row`]: engine-neutral results
//! - [`FromDataRow`] / [`FromValue`]: the row materializer and value converter
//! - [`Cursor`]: a live reader that owns its connection
//! - [`BulkInsertLock`]: serializes bulk inserts across sessions

mod blob;
mod builder;
mod bulk;
mod command;
mod convert;
mod cursor;
mod error;
mod export;
mod handle;
mod lock;
mod materialize;
mod params;
mod placeholder;
mod types;

pub use blob::{BLOB_CHUNK_SIZE, BlobFiles};
pub(crate) use blob::write_value;
pub use builder::{
    Credentials, DEFAULT_COMMAND_TIMEOUT, DEFAULT_EXPORT_TIMEOUT, SessionBuilder, SessionOptions,
};
pub use command::{BoundParam, Command, CommandKind};
pub use convert::FromValue;
pub use cursor::Cursor;
pub use error::DbError;
pub use export::CsvOptions;
pub use handle::{ConnectionState, Session};
pub use lock::BulkInsertLock;
pub use materialize::{Assign, FieldMap, FromDataRow, materialize};
pub use params::{Direction, ParamBind, ParamValue, ProcedureResult};
pub use placeholder::{NativeStyle, Numbering};
pub use types::{ColumnInfo, DataTable, Row, Value};

pub(crate) use command::bind_named;
pub(crate) use types::format_money;
