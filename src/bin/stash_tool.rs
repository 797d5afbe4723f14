use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use stashdb::{Backend, DurabilityMode, FileBackend, StoreConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stash-tool")]
#[command(about = "Inspect and maintain a stashdb data directory")]
struct Cli {
    /// Data directory; falls back to STASHDB_DATA_DIR
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// sync, async or none; falls back to STASHDB_DURABILITY
    #[arg(long, global = true)]
    durability: Option<DurabilityMode>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List tables with their row counts and columns
    Tables,
    /// Print every row of a table as JSON
    Dump {
        #[arg(long)]
        table: String,
        #[arg(long)]
        pretty: bool,
    },
    /// Remove every row of a table
    Drop {
        #[arg(long)]
        table: String,
    },
    /// Fold the journal into a fresh snapshot
    Checkpoint,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut backend = open_backend(&cli)?;

    let outcome = match &cli.command {
        Command::Tables => list_tables(&backend),
        Command::Dump { table, pretty } => dump_table(&backend, table, *pretty),
        Command::Drop { table } => drop_table(&mut backend, table),
        Command::Checkpoint => backend.checkpoint().context("Checkpoint failed"),
    };

    backend.close().context("Failed to close the data directory")?;
    outcome
}

fn open_backend(cli: &Cli) -> Result<FileBackend> {
    let mut config = StoreConfig::from_env().context("Invalid STASHDB_* environment")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(mode) = cli.durability {
        config.durability = mode;
    }

    let data_dir = config
        .data_dir
        .clone()
        .ok_or_else(|| anyhow!("No data directory given. Use --data-dir or STASHDB_DATA_DIR"))?;
    if !data_dir.exists() {
        return Err(anyhow!("Data directory '{}' does not exist", data_dir.display()));
    }

    let mut backend = config.file_backend()?;
    backend
        .open()
        .with_context(|| format!("Failed to open '{}'", data_dir.display()))?;
    Ok(backend)
}

fn list_tables(backend: &FileBackend) -> Result<()> {
    let mut names = backend.table_names();
    names.sort();
    if names.is_empty() {
        println!("No tables");
        return Ok(());
    }

    for name in names {
        let rows = backend.row_count(&name)?;
        let columns = backend
            .columns(&name)?
            .iter()
            .map(|column| format!("{}:{}", column.name, column.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        println!("{} ({} rows) [{}]", name, rows, columns);
    }
    Ok(())
}

fn dump_table(backend: &FileBackend, table: &str, pretty: bool) -> Result<()> {
    let rows = backend
        .scan(table)
        .with_context(|| format!("Failed to read table '{}'", table))?;

    let json_rows = rows
        .into_iter()
        .map(|(id, record)| {
            let mut object = serde_json::Map::new();
            object.insert("id".to_string(), serde_json::Value::from(id));
            for (column, value) in record {
                object.insert(column, value.to_json());
            }
            serde_json::Value::Object(object)
        })
        .collect::<Vec<_>>();

    let array = serde_json::Value::Array(json_rows);
    let output = if pretty {
        serde_json::to_string_pretty(&array)?
    } else {
        serde_json::to_string(&array)?
    };
    println!("{}", output);
    Ok(())
}

fn drop_table(backend: &mut FileBackend, table: &str) -> Result<()> {
    let rows = backend.row_count(table)?;
    backend
        .drop_rows(table)
        .with_context(|| format!("Failed to drop rows of '{}'", table))?;
    backend.flush()?;
    println!("Dropped {} rows from '{}'", rows, table);
    Ok(())
}
