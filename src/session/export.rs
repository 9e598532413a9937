//! Streaming CSV export.
//!
//! Rows are written to the destination file as they arrive from the engine;
//! the result is never materialized in memory.

use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, UTF_8};
use futures::TryStreamExt;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use super::error::DbError;
use super::handle::{Session, with_timeout};
use super::params::ParamBind;

/// Alias of the derived table wrapping an exported query.
const EXPORT_ALIAS: &str = "csv_export";

/// Options for [`Session::bulk_get_csv`].
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// File name inside the export folder.
    pub file_name: String,
    /// Overrides the session's export folder.
    pub folder: Option<PathBuf>,
    pub delimiter: char,
    pub header: bool,
    /// Wrap every field in double quotes.
    pub quote: bool,
    pub encoding: &'static Encoding,
    /// Run the query as given instead of wrapping it in a derived table.
    pub raw: bool,
}

impl CsvOptions {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            folder: None,
            delimiter: ',',
            header: true,
            quote: false,
            encoding: UTF_8,
            raw: false,
        }
    }

    /// Selects the output encoding by WHATWG label (`"utf-8"`, `"windows-1252"`, ...).
    ///
    /// # Errors
    /// Returns `DbError::Configuration` for an unknown label.
    pub fn with_encoding_label(mut self, label: &str) -> Result<Self, DbError> {
        self.encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| DbError::Configuration(format!("unknown encoding: {label}")))?;
        Ok(self)
    }
}

/// Formats one record: fields uppercased, optionally quoted, newline ended.
pub(crate) fn format_record<I>(fields: I, delimiter: char, quote: bool) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut line = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            line.push(delimiter);
        }
        let field = field.to_uppercase();
        if quote {
            line.push('"');
            line.push_str(&field.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(&field);
        }
    }
    line.push('\n');
    line
}

/// Strips any directory part from a caller-supplied file name.
pub(crate) fn plain_file_name(name: &str) -> Result<&str, DbError> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| DbError::Bind(format!("invalid file name: {name:?}")))
}

struct CsvWriter {
    file: BufWriter<File>,
    delimiter: char,
    quote: bool,
    encoding: &'static Encoding,
}

impl CsvWriter {
    /// Replaces any existing file at `path`.
    async fn create(path: &Path, options: &CsvOptions) -> Result<Self, DbError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed previous export"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Self {
            file: BufWriter::new(File::create(path).await?),
            delimiter: options.delimiter,
            quote: options.quote,
            encoding: options.encoding,
        })
    }

    async fn write_record<I>(&mut self, fields: I) -> Result<(), DbError>
    where
        I: IntoIterator<Item = String>,
    {
        let line = format_record(fields, self.delimiter, self.quote);
        let (bytes, _, _) = self.encoding.encode(&line);
        self.file.write_all(&bytes).await?;
        Ok(())
    }

    async fn finish(mut self) -> Result<(), DbError> {
        self.file.flush().await?;
        Ok(())
    }
}

impl Session {
    /// Streams a query's rows into a delimited file and returns its absolute
    /// path.
    ///
    /// Header and row text are uppercased. An empty result still produces a
    /// file, holding only the header when one is requested.
    pub async fn bulk_get_csv(
        &mut self,
        query: &str,
        params: &[ParamBind],
        options: &CsvOptions,
    ) -> Result<PathBuf, DbError> {
        let limit = self.options.export_timeout;
        let result = with_timeout(limit, self.write_csv(query, params, options)).await;
        self.finish("bulk_get_csv", result).await
    }

    async fn write_csv(
        &mut self,
        query: &str,
        params: &[ParamBind],
        options: &CsvOptions,
    ) -> Result<PathBuf, DbError> {
        let text = if options.raw {
            query.to_string()
        } else {
            self.adapter.wrap_query(query, EXPORT_ALIAS)
        };
        self.bind(&text, params, self.options.export_timeout)?;

        let folder = options
            .folder
            .clone()
            .unwrap_or_else(|| self.options.export_folder.clone());
        let path = folder.join(plain_file_name(&options.file_name)?);
        tokio::fs::create_dir_all(&folder).await?;

        self.ensure_open().await?;
        let mut writer = CsvWriter::create(&path, options).await?;
        let (connection, command) = self.parts()?;

        let mut written: u64 = 0;
        {
            let mut rows = connection.fetch(command);
            while let Some(row) = rows.try_next().await? {
                if written == 0 && options.header {
                    writer
                        .write_record(row.columns().iter().map(|c| c.name.clone()))
                        .await?;
                }
                writer
                    .write_record(row.values().iter().map(ToString::to_string))
                    .await?;
                written += 1;
            }
        }
        if written == 0 && options.header {
            let columns = connection.describe(command).await?;
            writer
                .write_record(columns.into_iter().map(|c| c.name))
                .await?;
        }
        writer.finish().await?;

        let path = tokio::fs::canonicalize(&path).await?;
        info!(engine = %self.kind(), path = %path.display(), rows = written, "csv export completed");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_record_uppercases() {
        let line = format_record(["id".to_string(), "Ada".to_string()], ';', false);
        assert_eq!(line, "ID;ADA\n");
    }

    #[test]
    fn test_format_record_quotes_and_doubles() {
        let line = format_record(["say \"hi\"".to_string(), String::new()], ',', true);
        assert_eq!(line, "\"SAY \"\"HI\"\"\",\"\"\n");
    }

    #[test]
    fn test_encoding_label() {
        let options = CsvOptions::new("a.csv").with_encoding_label("latin1").unwrap();
        assert_eq!(options.encoding.name(), "windows-1252");
        assert!(CsvOptions::new("a.csv").with_encoding_label("klingon").is_err());
    }

    #[test]
    fn test_plain_file_name() {
        assert_eq!(plain_file_name("../../etc/out.csv").unwrap(), "out.csv");
        assert!(plain_file_name("").is_err());
        assert!(plain_file_name("dir/..").is_err());
    }
}
