// Backfill CLI entry point.
//
// Runs one import over a single table: a delimited export file is resolved
// against a schema file's key descriptor and every row is dispatched as a
// synthetic insert mutation. The process exit code is the run status:
// 0 = OK, 1 = PARTIAL, 2 = FATAL.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cascade_cdc::backfill::{BackfillImporter, CsvRowSource, StaticMetadata};
use cascade_cdc::bus::InMemoryBus;
use cascade_cdc::model::{ColumnSpec, TableRef};
use cascade_cdc::sender::{BusSender, SendRetryPolicy};

#[derive(Parser, Debug)]
#[command(name = "cascade-cdc", about = "CDC backfill runner")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one table's export into the event stream.
    Backfill(BackfillArgs),
}

#[derive(clap::Args, Debug)]
struct BackfillArgs {
    #[arg(long, env = "CASCADE_KEYSPACE")]
    keyspace: String,
    #[arg(long, env = "CASCADE_TABLE")]
    table: String,
    /// JSON file with the table's declared columns.
    #[arg(long)]
    schema: PathBuf,
    /// Delimited export file (`name:type` header).
    #[arg(long)]
    input: PathBuf,
    /// Node identifier stamped on every emitted mutation.
    #[arg(long, env = "CASCADE_NODE_ID", default_value_t = 0)]
    node_id: u64,
    /// Abort the run at the first failed row.
    #[arg(long, default_value_t = false)]
    fail_fast: bool,
    /// Ignore export-provided writetimes and stamp fresh synthetic ones.
    #[arg(long, default_value_t = false)]
    writetime_synthetic: bool,
    /// Publish retries before a row is marked failed.
    #[arg(long, env = "CASCADE_SEND_RETRIES", default_value_t = 3)]
    send_retries: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Backfill(args) => run_backfill(args).await,
    }
}

async fn run_backfill(args: BackfillArgs) -> anyhow::Result<()> {
    let table = TableRef::new(args.keyspace, args.table);

    let schema = std::fs::read_to_string(&args.schema)
        .with_context(|| format!("read schema {}", args.schema.display()))?;
    let columns: Vec<ColumnSpec> =
        serde_json::from_str(&schema).context("parse schema columns")?;

    let bus = Arc::new(InMemoryBus::new());
    let sender = Arc::new(BusSender::new(
        bus,
        SendRetryPolicy {
            max_retries: args.send_retries,
            ..SendRetryPolicy::default()
        },
    ));
    let importer = BackfillImporter::new(
        table.clone(),
        Arc::new(CsvRowSource::new(args.input)),
        Arc::new(StaticMetadata::new(table, columns)),
        sender,
        args.node_id,
    )
    .with_fail_fast(args.fail_fast)
    .with_synthetic_writetimes(args.writetime_synthetic);

    let report = importer.run().await;
    std::process::exit(report.status.exit_code());
}
