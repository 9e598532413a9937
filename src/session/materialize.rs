//! Row materializer: tabular results into typed rows.
//!
//! Each result type declares an explicit column-to-field table through
//! [`FromDataRow::fields`]. The table is resolved against the result's columns
//! once per result set, ignoring ASCII case. Result columns with no field are
//! ignored, fields with no column keep their default, and NULL cells leave the
//! field at its default.

use super::convert::FromValue;
use super::error::DbError;
use super::types::{DataTable, Value, find_column};

/// Assigns one converted cell to a field of `T`.
pub type Assign<T> = fn(&mut T, &Value) -> Result<(), DbError>;

/// Maps a result column to a field setter.
pub struct FieldMap<T> {
    column: &'static str,
    assign: Assign<T>,
}

impl<T> FieldMap<T> {
    pub const fn new(column: &'static str, assign: Assign<T>) -> Self {
        Self { column, assign }
    }

    pub fn column(&self) -> &'static str {
        self.column
    }
}

/// A type that can be built from one result row.
pub trait FromDataRow: Default + Sized {
    fn fields() -> Vec<FieldMap<Self>>;
}

/// Builds the field table of a [`FromDataRow`] implementation.
///
/// ```ignore
/// impl FromDataRow for User {
///     fn fields() -> Vec<FieldMap<Self>> {
///         row_fields!(User { "id" => id, "user_name" => name })
///     }
/// }
/// ```
#[macro_export]
macro_rules! row_fields {
    ($ty:ty { $($column:literal => $field:ident),* $(,)? }) => {
        vec![$(
            $crate::session::FieldMap::<$ty>::new($column, |row: &mut $ty, value: &$crate::session::Value| {
                row.$field = $crate::session::FromValue::from_value(value)?;
                Ok(())
            })
        ),*]
    };
}

/// Converts every row of `table` into `T`.
pub fn materialize<T: FromDataRow>(table: &DataTable) -> Result<Vec<T>, DbError> {
    let plan: Vec<(usize, FieldMap<T>)> = T::fields()
        .into_iter()
        .filter_map(|f| find_column(table.columns(), f.column).map(|i| (i, f)))
        .collect();

    table
        .rows()
        .iter()
        .map(|row| {
            let mut item = T::default();
            for (index, field) in &plan {
                match row.get(*index) {
                    None | Some(Value::Null) => {}
                    Some(value) => (field.assign)(&mut item, value)?,
                }
            }
            Ok(item)
        })
        .collect()
}

/// Reads the first cell as `T`, falling back to `T::default()` on NULL.
pub(crate) fn scalar_or_default<T: FromValue + Default>(value: Option<Value>) -> Result<T, DbError> {
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => T::from_value(&v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ColumnInfo;

    #[derive(Debug, Default, PartialEq)]
    struct User {
        id: i64,
        name: String,
        score: Option<f64>,
    }

    impl FromDataRow for User {
        fn fields() -> Vec<FieldMap<Self>> {
            crate::row_fields!(User {
                "ID" => id,
                "user_name" => name,
                "score" => score,
            })
        }
    }

    fn table() -> DataTable {
        let mut table = DataTable::new(vec![
            ColumnInfo::new("id", "INT8"),
            ColumnInfo::new("USER_NAME", "TEXT"),
            ColumnInfo::new("ignored", "TEXT"),
        ]);
        table
            .push_row(vec![Value::Int(1), Value::from("ada"), Value::from("x")])
            .unwrap();
        table
            .push_row(vec![Value::Int(2), Value::Null, Value::Null])
            .unwrap();
        table
    }

    #[test]
    fn test_materialize_matches_columns_case_insensitively() {
        let users: Vec<User> = materialize(&table()).unwrap();
        assert_eq!(
            users,
            vec![
                User {
                    id: 1,
                    name: "ada".into(),
                    score: None
                },
                User {
                    id: 2,
                    name: String::new(),
                    score: None
                },
            ]
        );
    }

    #[test]
    fn test_materialize_reports_conversion_errors() {
        let mut table = DataTable::with_columns(["id"]);
        table.push_row(vec![Value::from("abc")]).unwrap();
        let err = materialize::<User>(&table).unwrap_err();
        assert!(matches!(err, DbError::Conversion { target: "i64", .. }));
    }

    #[test]
    fn test_scalar_or_default() {
        assert_eq!(scalar_or_default::<i64>(None).unwrap(), 0);
        assert_eq!(scalar_or_default::<i64>(Some(Value::Null)).unwrap(), 0);
        assert_eq!(scalar_or_default::<String>(Some(Value::Int(5))).unwrap(), "5");
    }
}
