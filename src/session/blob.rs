//! Blob retrieval to files.

use std::borrow::Cow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::error::DbError;
use super::export::plain_file_name;
use super::handle::{Session, with_timeout};
use super::materialize::scalar_or_default;
use super::params::ParamBind;
use super::types::Value;

/// Bytes written per write call.
pub const BLOB_CHUNK_SIZE: usize = 1024;

/// Names the file each blob row is written to.
///
/// Two-column rows carry their own name; one-column rows use the caller's.
/// A name already handed out gets a `_<n>` suffix, so no file is written
/// twice.
#[derive(Debug)]
pub struct BlobFiles {
    folder: PathBuf,
    file_name: Option<String>,
    used: HashSet<String>,
    paths: Vec<PathBuf>,
}

impl BlobFiles {
    pub(crate) fn new(folder: PathBuf, file_name: Option<&str>) -> Self {
        Self {
            folder,
            file_name: file_name.map(str::to_string),
            used: HashSet::new(),
            paths: Vec::new(),
        }
    }

    /// Path for the next row, given its column count and its name column.
    pub fn next_path(&mut self, width: usize, name: Option<&Value>) -> Result<PathBuf, DbError> {
        let base = match (width, self.file_name.as_deref()) {
            (2, None) => {
                let name = name.map(ToString::to_string).unwrap_or_default();
                plain_file_name(&name)?.to_string()
            }
            (1, Some(name)) => plain_file_name(name)?.to_string(),
            (2, Some(_)) => {
                return Err(DbError::Bind(
                    "blob query returns a file name column; do not supply a file name"
                        .to_string(),
                ));
            }
            (1, None) => {
                return Err(DbError::Bind(
                    "blob query returns only the blob column; a file name is required"
                        .to_string(),
                ));
            }
            (n, _) => {
                return Err(DbError::Bind(format!(
                    "blob query must return 1 or 2 columns, got {n}"
                )));
            }
        };

        let mut file_name = base.clone();
        let mut n = 1;
        while self.used.contains(&file_name) {
            n += 1;
            file_name = numbered(&base, n);
        }
        let path = self.folder.join(&file_name);
        self.used.insert(file_name);
        self.paths.push(path.clone());
        Ok(path)
    }

    pub(crate) fn into_paths(self) -> Vec<PathBuf> {
        self.paths
    }
}

/// `report.pdf`, 2 → `report_2.pdf`.
fn numbered(name: &str, n: usize) -> String {
    let path = Path::new(name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => {
            format!("{}_{n}.{}", stem.to_string_lossy(), ext.to_string_lossy())
        }
        _ => format!("{name}_{n}"),
    }
}

fn blob_bytes(value: &Value) -> Cow<'_, [u8]> {
    match value {
        Value::Bytes(b) => Cow::Borrowed(b),
        Value::Text(s) | Value::Xml(s) => Cow::Borrowed(s.as_bytes()),
        Value::Null => Cow::Borrowed(&[]),
        other => Cow::Owned(other.to_string().into_bytes()),
    }
}

async fn write_chunked(path: &Path, data: &[u8]) -> Result<(), DbError> {
    let mut file = File::create(path).await?;
    for chunk in data.chunks(BLOB_CHUNK_SIZE) {
        file.write_all(chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Writes an already decoded column value to `path`.
pub(crate) async fn write_value(path: &Path, value: Option<&Value>) -> Result<(), DbError> {
    let data = value.map(blob_bytes).unwrap_or_default();
    write_chunked(path, &data).await
}

impl Session {
    /// Writes the blob column of every row to a file and returns the paths.
    ///
    /// The query returns either (blob, file name) or just the blob, in which
    /// case `file_name` is required. Files go to `folder`, or the session's
    /// blob folder.
    ///
    /// # Errors
    /// Returns `DbError::NotFound` before creating any file when the query
    /// yields no rows, and `DbError::Bind` on a column-count mismatch.
    pub async fn retrieve_blob(
        &mut self,
        query: &str,
        params: &[ParamBind],
        file_name: Option<&str>,
        folder: Option<&Path>,
    ) -> Result<Vec<PathBuf>, DbError> {
        let limit = self.options.export_timeout;
        let result = with_timeout(limit, self.save_blobs(query, params, file_name, folder)).await;
        self.finish("retrieve_blob", result).await
    }

    async fn save_blobs(
        &mut self,
        query: &str,
        params: &[ParamBind],
        file_name: Option<&str>,
        folder: Option<&Path>,
    ) -> Result<Vec<PathBuf>, DbError> {
        let count_query = self.adapter.count_query(query);
        self.bind(&count_query, params, self.options.export_timeout)?;
        self.ensure_open().await?;

        let (connection, command) = self.parts()?;
        let first = {
            let mut rows = connection.fetch(command);
            let first = rows.try_next().await?;
            while rows.try_next().await?.is_some() {}
            first
        };
        let count: i64 = scalar_or_default(first.and_then(|r| r.into_values().into_iter().next()))?;
        if count == 0 {
            return Err(DbError::NotFound(format!(
                "no rows for blob query: {query}"
            )));
        }

        let folder = folder
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.options.blob_folder.clone());
        tokio::fs::create_dir_all(&folder).await?;

        self.bind(query, params, self.options.export_timeout)?;
        let mut files = BlobFiles::new(folder, file_name);
        let (connection, command) = self.parts()?;
        connection.write_blobs(command, &mut files).await?;
        let paths = files.into_paths();

        info!(engine = %self.kind(), files = paths.len(), "blobs written");
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(file_name: Option<&str>) -> BlobFiles {
        BlobFiles::new(PathBuf::from("out"), file_name)
    }

    fn names(files: BlobFiles) -> Vec<String> {
        files
            .into_paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_file_name_from_row() {
        let mut named = files(None);
        let path = named.next_path(2, Some(&Value::from("dir/a.bin"))).unwrap();
        assert_eq!(path, PathBuf::from("out/a.bin"));

        let mut both = files(Some("x.bin"));
        assert!(both.next_path(2, Some(&Value::from("a.bin"))).is_err());
    }

    #[test]
    fn test_caller_file_name_is_numbered() {
        let mut numbered = files(Some("doc.pdf"));
        for _ in 0..3 {
            numbered.next_path(1, None).unwrap();
        }
        assert_eq!(names(numbered), vec!["doc.pdf", "doc_2.pdf", "doc_3.pdf"]);

        let mut bare = files(Some("doc"));
        bare.next_path(1, None).unwrap();
        bare.next_path(1, None).unwrap();
        assert_eq!(names(bare), vec!["doc", "doc_2"]);

        assert!(files(None).next_path(1, None).is_err());
    }

    #[test]
    fn test_repeated_row_names_are_numbered() {
        let mut named = files(None);
        for name in ["a.bin", "b.bin", "a.bin", "a_2.bin", "a.bin"] {
            named.next_path(2, Some(&Value::from(name))).unwrap();
        }
        assert_eq!(
            names(named),
            vec!["a.bin", "b.bin", "a_2.bin", "a_2_2.bin", "a_3.bin"]
        );
    }

    #[test]
    fn test_column_count_mismatch() {
        let err = files(None).next_path(3, None).unwrap_err();
        assert!(matches!(err, DbError::Bind(msg) if msg.contains("got 3")));
    }

    #[test]
    fn test_blob_bytes() {
        assert_eq!(blob_bytes(&Value::from("é")).as_ref(), "é".as_bytes());
        assert!(blob_bytes(&Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_write_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        write_chunked(&path, &data).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_write_null_value_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        write_value(&path, Some(&Value::Null)).await.unwrap();
        assert!(tokio::fs::read(&path).await.unwrap().is_empty());
    }
}
