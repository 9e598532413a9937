//! Session integration tests against a real SQLite file.
//!
//! Every test works in its own temporary directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use polysql::adapter::sqlite::SqliteAdapter;
use polysql::session::FieldMap;
use polysql::{
    ConnectionState, Credentials, CsvOptions, DataTable, DbError, FromDataRow, ParamBind, Session,
    Value,
};
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

fn session_in(dir: &Path) -> Session {
    Session::builder(
        Arc::new(SqliteAdapter),
        Credentials::file(dir.join("app.db").to_string_lossy()),
    )
    .export_folder(dir.join("exports"))
    .blob_folder(dir.join("blobs"))
    .build()
    .expect("valid sqlite session")
}

/// A session over a `people` table holding Ada and Grace.
async fn seeded() -> (TempDir, Session) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut session = session_in(dir.path());
    session
        .exec_query_with_result("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT)", &[])
        .await
        .expect("create table");
    session
        .exec_query_with_result(
            "INSERT INTO people (id, name) VALUES (1, 'Ada'), (2, 'Grace')",
            &[],
        )
        .await
        .expect("seed rows");
    (dir, session)
}

async fn people_count(session: &mut Session) -> i64 {
    session
        .exec_scalar("SELECT COUNT(*) FROM people", &[])
        .await
        .expect("count people")
}

#[derive(Debug, Default, PartialEq)]
struct Person {
    id: i64,
    name: String,
}

impl FromDataRow for Person {
    fn fields() -> Vec<FieldMap<Self>> {
        polysql::row_fields!(Person { "ID" => id, "Name" => name })
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_primitives_leave_session_closed() {
    let (_dir, mut session) = seeded().await;
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(people_count(&mut session).await, 2);
    assert_eq!(session.state(), ConnectionState::Closed);
    assert!(!session.is_available());
    assert!(session.connection_string().starts_with("sqlite:"));
}

#[tokio::test]
async fn test_open_and_close_connection() {
    let (_dir, mut session) = seeded().await;
    session.open_connection().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Open);
    assert!(matches!(
        session.open_connection().await,
        Err(DbError::State(_))
    ));

    session.close_connection().await.unwrap();
    session.close_connection().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_transaction_commit() {
    let (_dir, mut session) = seeded().await;
    session.begin_transaction().await.unwrap();
    assert_eq!(session.state(), ConnectionState::OpenInTransaction);
    assert!(session.has_uncommitted_transaction());

    let affected = session
        .exec_query_with_result(
            "INSERT INTO people (id, name) VALUES (:id, :name)",
            &[ParamBind::new("id", 3), ParamBind::new("name", "Linus")],
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);
    assert_eq!(session.state(), ConnectionState::OpenInTransaction);

    session.commit_and_close().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(people_count(&mut session).await, 3);
}

#[tokio::test]
async fn test_transaction_rollback() {
    let (_dir, mut session) = seeded().await;
    session.begin_transaction().await.unwrap();
    session
        .exec_query_with_result("DELETE FROM people", &[])
        .await
        .unwrap();
    session.rollback_and_close().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(people_count(&mut session).await, 2);
}

#[tokio::test]
async fn test_failure_rolls_back_transaction() {
    let (_dir, mut session) = seeded().await;
    session.begin_transaction().await.unwrap();
    session
        .exec_query_with_result("DELETE FROM people WHERE id = 1", &[])
        .await
        .unwrap();
    let err = session
        .exec_query_with_result("INSERT INTO missing_table VALUES (1)", &[])
        .await;
    assert!(err.is_err());
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(people_count(&mut session).await, 2);
}

#[tokio::test]
async fn test_transaction_state_errors() {
    let (_dir, mut session) = seeded().await;
    assert!(matches!(
        session.commit_and_close().await,
        Err(DbError::State(_))
    ));

    session.open_connection().await.unwrap();
    assert!(matches!(
        session.begin_transaction().await,
        Err(DbError::State(_))
    ));
    session.close_connection().await.unwrap();

    session.begin_transaction().await.unwrap();
    assert!(matches!(
        session.begin_transaction().await,
        Err(DbError::State(_))
    ));
    session.rollback_and_close().await.unwrap();
}

// =============================================================================
// Primitives
// =============================================================================

#[tokio::test]
async fn test_scalar_with_prefixed_name() {
    let (_dir, mut session) = seeded().await;
    let value: i64 = session
        .exec_scalar("SELECT :foo", &[ParamBind::new(":foo", 5)])
        .await
        .unwrap();
    assert_eq!(value, 5);
}

#[tokio::test]
async fn test_scalar_defaults_on_no_row() {
    let (_dir, mut session) = seeded().await;
    let name: String = session
        .exec_scalar("SELECT name FROM people WHERE id = :id", &[ParamBind::new("id", 99)])
        .await
        .unwrap();
    assert_eq!(name, "");
}

#[tokio::test]
async fn test_array_parameter_expands() {
    let (_dir, mut session) = seeded().await;
    let count: i64 = session
        .exec_scalar(
            "SELECT COUNT(*) FROM people WHERE id IN (:ids)",
            &[ParamBind::array("ids", [1, 2, 3])],
        )
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(
        session.command().audit_text(),
        "SELECT COUNT(*) FROM people WHERE id IN (1, 2, 3)"
    );
}

#[tokio::test]
async fn test_get_data_table() {
    let (_dir, mut session) = seeded().await;
    let table = session
        .get_data_table("SELECT id, name FROM people ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(table.row_count(), 2);
    assert_eq!(table.value(1, "NAME"), Some(&Value::from("Grace")));
}

#[tokio::test]
async fn test_get_list_maps_fields() {
    let (_dir, mut session) = seeded().await;
    let people: Vec<Person> = session
        .get_list("SELECT id, name, 'x' AS extra FROM people ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(
        people,
        vec![
            Person {
                id: 1,
                name: "Ada".to_string()
            },
            Person {
                id: 2,
                name: "Grace".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_exec_query_minimum_and_exact() {
    let (_dir, mut session) = seeded().await;
    assert!(
        session
            .exec_query("UPDATE people SET name = upper(name)", &[], 1, false)
            .await
            .unwrap()
    );
    assert!(
        !session
            .exec_query("UPDATE people SET name = lower(name)", &[], 1, true)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_procedure_not_supported() {
    let (_dir, mut session) = seeded().await;
    let result = session.exec_procedure("anything", &[]).await;
    assert!(matches!(result, Err(DbError::NotSupported(_))));
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_column_table_for_table_and_query() {
    let (_dir, mut session) = seeded().await;
    let table = session.get_all_column_table("people").await.unwrap();
    let names: Vec<&str> = table.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name"]);
    assert!(table.is_empty());

    let table = session
        .get_all_column_table("SELECT name AS label FROM people")
        .await
        .unwrap();
    assert_eq!(table.columns()[0].name, "label");
}

#[tokio::test]
async fn test_reader_streams_rows() {
    let (_dir, mut session) = seeded().await;
    let mut cursor = session
        .exec_reader("SELECT name FROM people ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(session.state(), ConnectionState::Closed);

    let first = cursor.next_row().await.unwrap().unwrap();
    assert_eq!(first.get_by_name("NAME"), Some(&Value::from("Ada")));
    let rest = cursor.collect_rows().await.unwrap();
    assert_eq!(rest.len(), 1);
}

#[tokio::test]
async fn test_reader_requires_closed_session() {
    let (_dir, mut session) = seeded().await;
    session.open_connection().await.unwrap();
    let result = session.exec_reader("SELECT 1", &[]).await;
    assert!(matches!(result, Err(DbError::State(_))));
    session.close_connection().await.unwrap();
}

// =============================================================================
// Bulk insert
// =============================================================================

#[tokio::test]
async fn test_bulk_insert_rows() {
    let (_dir, mut session) = seeded().await;
    let mut data = DataTable::with_columns(["ID", "NAME"]);
    for id in 10..1510 {
        data.push_row(vec![Value::Int(id), Value::from(format!("p{id}"))])
            .unwrap();
    }
    let inserted = session.bulk_insert_into("people", &data).await.unwrap();
    assert_eq!(inserted, 1500);
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(people_count(&mut session).await, 1502);
}

#[tokio::test]
async fn test_bulk_insert_column_mismatch() {
    let (_dir, mut session) = seeded().await;
    let mut data = DataTable::with_columns(["id", "name", "extra"]);
    data.push_row(vec![Value::Int(7), Value::from("x"), Value::Null])
        .unwrap();
    let result = session.bulk_insert_into("people", &data).await;
    assert!(matches!(result, Err(DbError::Bind(msg)) if msg.contains("column mismatch")));
    assert_eq!(people_count(&mut session).await, 2);
}

#[tokio::test]
async fn test_bulk_insert_matches_columns_by_name() {
    let (_dir, mut session) = seeded().await;
    let mut data = DataTable::with_columns(["NAME", "ID"]);
    data.push_row(vec![Value::from("Lin"), Value::Int(3)]).unwrap();
    assert_eq!(session.bulk_insert_into("people", &data).await.unwrap(), 1);

    let name: String = session
        .exec_scalar("SELECT name FROM people WHERE id = 3", &[])
        .await
        .unwrap();
    assert_eq!(name, "Lin");
}

#[tokio::test]
async fn test_bulk_insert_rejects_column_claimed_twice() {
    let (_dir, mut session) = seeded().await;
    let mut data = DataTable::with_columns(["label", "ID"]);
    data.push_row(vec![Value::from("Ada"), Value::Int(7)]).unwrap();
    let result = session.bulk_insert_into("people", &data).await;
    assert!(matches!(result, Err(DbError::Bind(msg)) if msg.contains("label")));
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(people_count(&mut session).await, 2);
}

#[tokio::test]
async fn test_bulk_insert_needs_closed_session() {
    let (_dir, mut session) = seeded().await;
    session.begin_transaction().await.unwrap();
    let data = DataTable::with_columns(["id", "name"]);
    let result = session.bulk_insert_into("people", &data).await;
    assert!(matches!(result, Err(DbError::State(_))));
    session.rollback_and_close().await.unwrap();
}

#[tokio::test]
async fn test_independent_sessions_share_bulk_lock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = Session::sqlite("", 0, "", "", &dir.path().join("a.db").to_string_lossy()).unwrap();
    let b = Session::sqlite("", 0, "", "", &dir.path().join("b.db").to_string_lossy()).unwrap();
    assert!(a.bulk_lock().is_shared_with(b.bulk_lock()));
    assert!(session_in(dir.path()).bulk_lock().is_shared_with(a.bulk_lock()));
}

#[tokio::test]
async fn test_concurrent_bulk_inserts_share_lock() {
    let (_dir, mut session) = seeded().await;
    let mut other = session
        .new_external_connection(session.credentials().clone())
        .unwrap();
    assert!(session.bulk_lock().is_shared_with(other.bulk_lock()));

    let mut first = DataTable::with_columns(["id", "name"]);
    let mut second = DataTable::with_columns(["id", "name"]);
    for id in 0..200 {
        first.push_row(vec![Value::Int(100 + id), Value::from("a")]).unwrap();
        second.push_row(vec![Value::Int(500 + id), Value::from("b")]).unwrap();
    }

    let (a, b) = tokio::join!(
        session.bulk_insert_into("people", &first),
        other.bulk_insert_into("people", &second)
    );
    assert_eq!(a.unwrap(), 200);
    assert_eq!(b.unwrap(), 200);
    assert_eq!(people_count(&mut session).await, 402);
}

// =============================================================================
// CSV export
// =============================================================================

#[tokio::test]
async fn test_csv_export() {
    let (dir, mut session) = seeded().await;
    let path = session
        .bulk_get_csv(
            "SELECT id, name FROM people ORDER BY id",
            &[],
            &CsvOptions::new("people.csv"),
        )
        .await
        .unwrap();
    assert!(path.is_absolute());
    assert!(path.starts_with(dir.path().canonicalize().unwrap()));
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text, "ID,NAME\n1,ADA\n2,GRACE\n");
}

#[tokio::test]
async fn test_csv_export_empty_result_keeps_header() {
    let (dir, mut session) = seeded().await;
    let mut options = CsvOptions::new("empty.csv");
    options.folder = Some(dir.path().join("custom"));
    options.delimiter = ';';
    let path = session
        .bulk_get_csv(
            "SELECT id, name FROM people WHERE id > :id",
            &[ParamBind::new("id", 100)],
            &options,
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap(), "ID;NAME\n");
}

#[tokio::test]
async fn test_csv_export_empty_result_without_header() {
    let (_dir, mut session) = seeded().await;
    let mut options = CsvOptions::new("nothing.csv");
    options.header = false;
    let path = session
        .bulk_get_csv("SELECT id, name FROM people WHERE id < 0", &[], &options)
        .await
        .unwrap();
    assert!(path.exists());
    assert_eq!(std::fs::read_to_string(path).unwrap(), "");
}

#[tokio::test]
async fn test_csv_export_replaces_existing_file() {
    let (dir, mut session) = seeded().await;
    let folder = dir.path().join("exports");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("out.csv"), "stale content that is longer\n").unwrap();

    let mut options = CsvOptions::new("out.csv");
    options.header = false;
    options.quote = true;
    let path = session
        .bulk_get_csv("SELECT name FROM people WHERE id = 1", &[], &options)
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap(), "\"ADA\"\n");
}

// =============================================================================
// Blob retrieval
// =============================================================================

async fn seeded_files() -> (TempDir, Session) {
    let (dir, mut session) = seeded().await;
    session
        .exec_query_with_result("CREATE TABLE files (data BLOB, name TEXT)", &[])
        .await
        .unwrap();
    for (name, data) in [("a.bin", vec![1u8, 2, 3]), ("b.bin", vec![9u8; 2500])] {
        session
            .exec_query_with_result(
                "INSERT INTO files (data, name) VALUES (:data, :name)",
                &[ParamBind::new("data", data), ParamBind::new("name", name)],
            )
            .await
            .unwrap();
    }
    (dir, session)
}

#[tokio::test]
async fn test_blobs_named_by_row() {
    let (dir, mut session) = seeded_files().await;
    let paths = session
        .retrieve_blob("SELECT data, name FROM files ORDER BY name", &[], None, None)
        .await
        .unwrap();
    let blobs = dir.path().join("blobs");
    assert_eq!(paths, vec![blobs.join("a.bin"), blobs.join("b.bin")]);
    assert_eq!(std::fs::read(&paths[0]).unwrap(), vec![1, 2, 3]);
    assert_eq!(std::fs::read(&paths[1]).unwrap().len(), 2500);
}

#[tokio::test]
async fn test_blobs_with_repeated_names_keep_every_file() {
    let (dir, mut session) = seeded_files().await;
    session
        .exec_query_with_result(
            "INSERT INTO files (data, name) VALUES (:data, 'a.bin')",
            &[ParamBind::new("data", vec![7u8; 4])],
        )
        .await
        .unwrap();
    let paths = session
        .retrieve_blob(
            "SELECT data, name FROM files ORDER BY name, length(data)",
            &[],
            None,
            None,
        )
        .await
        .unwrap();
    let blobs = dir.path().join("blobs");
    assert_eq!(
        paths,
        vec![blobs.join("a.bin"), blobs.join("a_2.bin"), blobs.join("b.bin")]
    );
    assert_eq!(std::fs::read(&paths[0]).unwrap(), vec![1, 2, 3]);
    assert_eq!(std::fs::read(&paths[1]).unwrap(), vec![7, 7, 7, 7]);
}

#[tokio::test]
async fn test_blobs_with_caller_file_name() {
    let (dir, mut session) = seeded_files().await;
    let folder = dir.path().join("out");
    let paths = session
        .retrieve_blob(
            "SELECT data FROM files ORDER BY name",
            &[],
            Some("doc.bin"),
            Some(&folder),
        )
        .await
        .unwrap();
    assert_eq!(paths, vec![folder.join("doc.bin"), folder.join("doc_2.bin")]);
}

#[tokio::test]
async fn test_blobs_not_found_creates_nothing() {
    let (dir, mut session) = seeded_files().await;
    let folder: PathBuf = dir.path().join("never");
    let result = session
        .retrieve_blob(
            "SELECT data, name FROM files WHERE name = :name",
            &[ParamBind::new("name", "missing")],
            None,
            Some(&folder),
        )
        .await;
    assert!(matches!(result, Err(DbError::NotFound(_))));
    assert!(!folder.exists());
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_blobs_column_mismatch() {
    let (_dir, mut session) = seeded_files().await;
    let result = session
        .retrieve_blob("SELECT data, name, 1 FROM files", &[], None, None)
        .await;
    assert!(matches!(result, Err(DbError::Bind(_))));
}

// =============================================================================
// External connections
// =============================================================================

#[tokio::test]
async fn test_external_connection_targets_other_database() {
    let (dir, session) = seeded().await;
    let other_path = dir.path().join("other.db");
    let mut other = session
        .new_external_connection(Credentials::file(other_path.to_string_lossy()))
        .unwrap();
    assert_eq!(other.options(), session.options());

    other
        .exec_query_with_result("CREATE TABLE audit (id INTEGER)", &[])
        .await
        .unwrap();
    assert!(other_path.exists());
    let tables: i64 = other
        .exec_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = :name",
            &[ParamBind::new("name", "people")],
        )
        .await
        .unwrap();
    assert_eq!(tables, 0);
}
