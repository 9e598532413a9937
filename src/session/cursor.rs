//! Live row cursors returned by `Session::exec_reader`.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_stream::try_stream;
use futures::{Stream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::adapter::{EngineKind, NativeConnection, RowStream};

use super::command::Command;
use super::error::DbError;
use super::types::Row;

/// A forward-only row cursor that owns its connection.
///
/// The connection is closed gracefully once the rows are exhausted, and
/// dropped with the cursor otherwise. Also usable as a [`Stream`] of rows.
pub struct Cursor {
    engine: EngineKind,
    rows: RowStream<'static>,
    fetched: u64,
}

impl Cursor {
    pub(crate) fn new(
        engine: EngineKind,
        connection: Box<dyn NativeConnection>,
        command: Command,
    ) -> Self {
        let rows = owned_rows(engine, connection, command);
        Self {
            engine,
            rows: Box::pin(rows),
            fetched: 0,
        }
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    /// Rows read so far.
    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    /// Reads the next row, or `None` once the result is exhausted.
    pub async fn next_row(&mut self) -> Result<Option<Row>, DbError> {
        let row = self.rows.try_next().await?;
        if row.is_some() {
            self.fetched += 1;
        }
        Ok(row)
    }

    /// Reads every remaining row.
    pub async fn collect_rows(mut self) -> Result<Vec<Row>, DbError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Releases the cursor and its connection.
    pub fn close(self) {
        debug!(engine = %self.engine, fetched = self.fetched, "reader closed");
    }
}

/// Rows of `command`, owning the connection that produces them.
fn owned_rows(
    engine: EngineKind,
    mut connection: Box<dyn NativeConnection>,
    command: Command,
) -> impl Stream<Item = Result<Row, DbError>> + Send + 'static {
    try_stream! {
        {
            let mut rows = connection.fetch(&command);
            while let Some(row) = rows.try_next().await? {
                yield row;
            }
        }
        connection.close().await?;
        debug!(engine = %engine, "reader exhausted and closed");
    }
}

impl Stream for Cursor {
    type Item = Result<Row, DbError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rows.poll_next_unpin(cx);
        if let Poll::Ready(Some(Ok(_))) = &polled {
            self.fetched += 1;
        }
        polled
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("engine", &self.engine)
            .field("fetched", &self.fetched)
            .finish_non_exhaustive()
    }
}
