//! Multi-row INSERT synthesis for engines without a bulk-load protocol.

use crate::session::{ColumnInfo, DataTable, DbError, ParamBind};

use super::Adapter;

/// One chunk of a bulk insert: named SQL text and its parameters.
#[derive(Debug, Clone)]
pub(crate) struct InsertBatch {
    pub text: String,
    pub params: Vec<ParamBind>,
    pub rows: usize,
}

/// Number of rows per statement that keeps under the engine's limits.
pub(crate) fn rows_per_batch(adapter: &dyn Adapter, width: usize) -> usize {
    (adapter.max_bind_params() / width.max(1)).clamp(1, adapter.max_insert_rows())
}

/// Pairs each data column with its target column.
///
/// Columns match by name ignoring ASCII case. A data column without a
/// name match takes the target at the same position, provided no other
/// data column claimed it. Each target is used at most once.
pub(crate) fn match_columns<'t>(
    target: &'t [ColumnInfo],
    data: &DataTable,
) -> Result<Vec<&'t ColumnInfo>, DbError> {
    let mut claimed = vec![false; target.len()];
    let mut slots: Vec<Option<usize>> = Vec::with_capacity(data.column_count());

    for column in data.columns() {
        let slot = target
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(&column.name));
        if let Some(index) = slot {
            if claimed[index] {
                return Err(DbError::Bind(format!(
                    "column {} is supplied more than once",
                    target[index].name
                )));
            }
            claimed[index] = true;
        }
        slots.push(slot);
    }

    let mut matched = Vec::with_capacity(slots.len());
    for (i, slot) in slots.into_iter().enumerate() {
        let index = match slot {
            Some(index) => index,
            None => {
                let name = &data.columns()[i].name;
                match claimed.get(i).copied() {
                    Some(false) => {
                        claimed[i] = true;
                        i
                    }
                    Some(true) => {
                        return Err(DbError::Bind(format!(
                            "column {name} has no match: position {} is already taken by {}",
                            i + 1,
                            target[i].name
                        )));
                    }
                    None => {
                        return Err(DbError::Bind(format!(
                            "column {name} has no match in the target table"
                        )));
                    }
                }
            }
        };
        matched.push(&target[index]);
    }
    Ok(matched)
}

/// Splits `data` into named multi-row INSERT statements for `table`.
///
/// Column names are taken from the introspected `target` columns.
pub(crate) fn insert_batches(
    adapter: &dyn Adapter,
    table: &str,
    target: &[ColumnInfo],
    data: &DataTable,
) -> Result<Vec<InsertBatch>, DbError> {
    let prefix = adapter.placeholder_prefix();
    let columns: Vec<String> = match_columns(target, data)?
        .into_iter()
        .map(|c| adapter.quote_identifier(&c.name))
        .collect();

    let mut batches = Vec::new();
    for chunk in data.rows().chunks(rows_per_batch(adapter, columns.len())) {
        let mut params = Vec::with_capacity(chunk.len() * columns.len());
        let mut placeholders = Vec::with_capacity(chunk.len());
        for (r, row) in chunk.iter().enumerate() {
            let mut names = Vec::with_capacity(row.len());
            for (c, value) in row.iter().enumerate() {
                let name = format!("r{r}_c{c}");
                names.push(format!("{prefix}{name}"));
                params.push(ParamBind::new(name, value.clone()));
            }
            placeholders.push(names);
        }
        batches.push(InsertBatch {
            text: adapter.insert_statement(table, &columns, &placeholders),
            params,
            rows: chunk.len(),
        });
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::sqlite::SqliteAdapter;
    use crate::session::Value;

    fn target() -> Vec<ColumnInfo> {
        vec![ColumnInfo::new("ID", "INTEGER"), ColumnInfo::new("NAME", "TEXT")]
    }

    fn table(rows: usize) -> DataTable {
        let mut data = DataTable::with_columns(["id", "name"]);
        for i in 0..rows {
            data.push_row(vec![Value::Int(i as i64), Value::from(format!("n{i}"))])
                .unwrap();
        }
        data
    }

    #[test]
    fn test_single_batch_text() {
        let batches = insert_batches(&SqliteAdapter, "people", &target(), &table(2)).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].text,
            "INSERT INTO people (\"ID\", \"NAME\") VALUES (:r0_c0, :r0_c1), (:r1_c0, :r1_c1)"
        );
        assert_eq!(batches[0].params.len(), 4);
        assert_eq!(batches[0].rows, 2);
    }

    #[test]
    fn test_batches_respect_row_limit() {
        let batches = insert_batches(&SqliteAdapter, "people", &target(), &table(2500)).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().map(|b| b.rows).sum::<usize>(), 2500);
        assert!(batches.iter().all(|b| b.params.len() <= SqliteAdapter.max_bind_params()));
    }

    fn matched_names(target: &[ColumnInfo], data: &DataTable) -> Result<Vec<String>, DbError> {
        Ok(match_columns(target, data)?
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    #[test]
    fn test_match_columns_by_name_then_position() {
        let target = vec![
            ColumnInfo::new("name", "TEXT"),
            ColumnInfo::new("id", "INTEGER"),
        ];
        let data = DataTable::with_columns(["label", "ID"]);
        assert_eq!(matched_names(&target, &data).unwrap(), vec!["name", "id"]);

        let data = DataTable::with_columns(["ID", "NAME"]);
        assert_eq!(matched_names(&target, &data).unwrap(), vec!["id", "name"]);
    }

    #[test]
    fn test_match_columns_never_reuses_a_target() {
        // "label" falls back to position 0, which "ID" already claimed.
        let data = DataTable::with_columns(["label", "ID"]);
        let err = matched_names(&target(), &data).unwrap_err();
        assert!(matches!(err, DbError::Bind(ref m) if m.contains("already taken by ID")));

        let data = DataTable::with_columns(["id", "Id"]);
        let err = matched_names(&target(), &data).unwrap_err();
        assert!(matches!(err, DbError::Bind(ref m) if m.contains("more than once")));
    }

    #[test]
    fn test_match_columns_fallback_past_target_width() {
        let data = DataTable::with_columns(["id", "name", "extra"]);
        let err = matched_names(&target(), &data).unwrap_err();
        assert!(matches!(err, DbError::Bind(ref m) if m.contains("extra")));
    }

    #[test]
    fn test_rows_per_batch_never_zero() {
        assert_eq!(rows_per_batch(&SqliteAdapter, 1_000_000), 1);
    }
}
