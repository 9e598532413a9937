//! Bulk insert of a [`DataTable`] into a table.

use tracing::info;

use crate::adapter::BulkMode;
use crate::adapter::insert::insert_batches;

use super::error::DbError;
use super::handle::{Session, with_timeout};
use super::types::{ColumnInfo, DataTable};

impl Session {
    /// Inserts every row of `data` into `table` and returns the row count.
    ///
    /// PostgreSQL streams a binary `COPY` outside any transaction. Other
    /// engines insert in chunks inside one transaction, serialized by the
    /// session's [`BulkInsertLock`](super::BulkInsertLock). The table is left
    /// unchanged when its column count differs from `data`.
    ///
    /// # Errors
    /// Returns `DbError::Bind` on a column mismatch, and `DbError::State` if
    /// a non-PostgreSQL session already holds a connection.
    pub async fn bulk_insert_into(&mut self, table: &str, data: &DataTable) -> Result<u64, DbError> {
        if data.column_count() == 0 {
            return Err(DbError::Bind("data table has no columns".to_string()));
        }
        match self.adapter.bulk_mode() {
            BulkMode::BinaryCopy => {
                let result = self.copy_rows(table, data).await;
                self.finish("bulk_insert_into", result).await
            }
            BulkMode::MultiRowInsert => {
                if self.connection.is_some() {
                    return Err(DbError::State(
                        "bulk insert runs its own transaction; close the session first".to_string(),
                    ));
                }
                let lock = self.bulk_lock.clone();
                let _guard = lock.acquire().await;
                let result = self.insert_rows(table, data).await;
                self.finish("bulk_insert_into", result).await
            }
        }
    }

    /// Introspects `table` and checks its width against `data`.
    async fn target_columns(
        &mut self,
        table: &str,
        data: &DataTable,
    ) -> Result<Vec<ColumnInfo>, DbError> {
        let probe = self.adapter.probe_query(table);
        self.bind(&probe, &[], self.options.command_timeout)?;
        let limit = self.command.timeout();
        let (connection, command) = self.parts()?;
        let columns = with_timeout(limit, connection.describe(command)).await?;
        if columns.len() != data.column_count() {
            return Err(DbError::Bind(format!(
                "column mismatch: {table} has {} columns but the data has {}",
                columns.len(),
                data.column_count()
            )));
        }
        Ok(columns)
    }

    async fn copy_rows(&mut self, table: &str, data: &DataTable) -> Result<u64, DbError> {
        self.ensure_open().await?;
        let target = self.target_columns(table, data).await?;
        let limit = self.options.export_timeout;
        let (connection, _) = self.parts()?;
        let rows = with_timeout(limit, connection.copy_in(table, &target, data)).await?;
        info!(engine = %self.kind(), table, rows, "bulk copy completed");
        Ok(rows)
    }

    async fn insert_rows(&mut self, table: &str, data: &DataTable) -> Result<u64, DbError> {
        self.begin_transaction().await?;
        let target = self.target_columns(table, data).await?;

        let mut inserted = 0;
        for batch in insert_batches(self.adapter.as_ref(), table, &target, data)? {
            self.bind(&batch.text, &batch.params, self.options.command_timeout)?;
            let limit = self.command.timeout();
            let (connection, command) = self.parts()?;
            inserted += with_timeout(limit, connection.execute(command)).await?;
        }

        self.commit_and_close().await?;
        info!(engine = %self.kind(), table, rows = inserted, "bulk insert completed");
        Ok(inserted)
    }
}
