//! polysql Binary Entry Point
//!
//! Runs one session primitive against a configured connection profile.
//! Core functionality is provided by the `polysql` library crate.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use polysql::config::parse_timeout;
use polysql::{AppConfig, CsvOptions, ParamBind, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// polysql - engine-agnostic database sessions
#[derive(Parser, Debug)]
#[command(name = "polysql", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "POLYSQL_CONFIG"
    )]
    config: PathBuf,

    /// Connection profile name
    #[arg(long, env = "POLYSQL_CONNECTION")]
    connection: String,

    /// Overrides the configured command timeout (e.g. 45s, 2m)
    #[arg(long, value_parser = parse_timeout, env = "POLYSQL_TIMEOUT")]
    timeout: Option<Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the first column of the first row
    Scalar {
        sql: String,

        /// Named parameter as name=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<ParamBind>,
    },

    /// Stream a query into a CSV file
    ExportCsv {
        sql: String,

        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<ParamBind>,

        /// File name inside the export folder
        #[arg(long)]
        file: String,

        /// Overrides the configured export folder
        #[arg(long)]
        folder: Option<PathBuf>,

        #[arg(long, default_value_t = ',')]
        delimiter: char,

        /// Omit the header line
        #[arg(long)]
        no_header: bool,

        /// Quote every field
        #[arg(long)]
        quote: bool,

        #[arg(long, default_value = "utf-8")]
        encoding: String,

        /// Run the query as given, without the derived-table wrapper
        #[arg(long)]
        raw: bool,
    },

    /// Write blob columns to files
    Blobs {
        sql: String,

        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<ParamBind>,

        /// File name when the query returns only the blob column
        #[arg(long)]
        file_name: Option<String>,

        #[arg(long)]
        folder: Option<PathBuf>,
    },

    /// Print the columns of a table or query
    Columns { relation: String },
}

/// Parses `name=value`; the value becomes an integer, float, NULL or text.
fn parse_param(arg: &str) -> Result<ParamBind, String> {
    let (name, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{arg}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing parameter name in '{arg}'"));
    }
    let value = if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::Text(raw.to_string())
    };
    Ok(ParamBind::new(name, value))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,polysql=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let mut config = AppConfig::load(&cli.config)?;
    if let Some(timeout) = cli.timeout {
        config.defaults.command_timeout = timeout;
    }
    let mut session = config.open_session(&cli.connection)?;
    tracing::info!(
        "Connection '{}': {}",
        cli.connection,
        session.connection_string()
    );

    match cli.command {
        Command::Scalar { sql, params } => {
            let value: String = session.exec_scalar(&sql, &params).await?;
            println!("{value}");
        }
        Command::ExportCsv {
            sql,
            params,
            file,
            folder,
            delimiter,
            no_header,
            quote,
            encoding,
            raw,
        } => {
            let mut options = CsvOptions::new(file).with_encoding_label(&encoding)?;
            options.folder = folder;
            options.delimiter = delimiter;
            options.header = !no_header;
            options.quote = quote;
            options.raw = raw;
            let path = session.bulk_get_csv(&sql, &params, &options).await?;
            println!("{}", path.display());
        }
        Command::Blobs {
            sql,
            params,
            file_name,
            folder,
        } => {
            let paths = session
                .retrieve_blob(&sql, &params, file_name.as_deref(), folder.as_deref())
                .await?;
            for path in paths {
                println!("{}", path.display());
            }
        }
        Command::Columns { relation } => {
            let table = session.get_all_column_table(&relation).await?;
            for column in table.columns() {
                println!("{}\t{}", column.name, column.type_name);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param_kinds() {
        assert_eq!(parse_param("id=5").unwrap().scalar(), &Value::Int(5));
        assert_eq!(parse_param("ratio=0.5").unwrap().scalar(), &Value::Float(0.5));
        assert_eq!(parse_param("x=NULL").unwrap().scalar(), &Value::Null);
        assert_eq!(
            parse_param("name=a=b").unwrap().scalar(),
            &Value::Text("a=b".to_string())
        );
    }

    #[test]
    fn test_parse_param_rejects_missing_name() {
        assert!(parse_param("=5").is_err());
        assert!(parse_param("novalue").is_err());
    }

    #[test]
    fn test_cli_parses_export() {
        let cli = Cli::try_parse_from([
            "polysql",
            "--config",
            "c.yaml",
            "--connection",
            "main",
            "export-csv",
            "SELECT 1",
            "--file",
            "out.csv",
            "--no-header",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::ExportCsv { no_header: true, .. }
        ));
        assert_eq!(cli.timeout, None);
    }

    #[test]
    fn test_cli_timeout_override() {
        let args = ["polysql", "--connection", "main", "--timeout", "45s", "columns", "t"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.timeout, Some(Duration::from_secs(45)));

        let args = ["polysql", "--connection", "main", "--timeout", "0s", "columns", "t"];
        assert!(Cli::try_parse_from(args).is_err());
    }
}
