use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ops_feed_api::{FetchLimits, OperationsApi, DEFAULT_FETCH_LIMIT};
use ops_feed_core::{Dataset, FeedQuery, RawFeedParams};
use ops_feed_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "opsfeed")]
#[command(about = "Admin operations feed CLI")]
struct Cli {
    #[arg(long, default_value = "./ops_feed.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Data {
        #[command(subcommand)]
        command: DataCommand,
    },
    /// Print one reconciled page of the operations feed.
    Feed(FeedArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum DataCommand {
    /// Load a dataset JSON document; records whose id already exists are skipped.
    Import(DataImportArgs),
}

#[derive(Debug, Args)]
struct DataImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct FeedArgs {
    #[arg(long, allow_hyphen_values = true)]
    page: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    page_size: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    q: Option<String>,
    #[arg(long, default_value_t = false)]
    warn: bool,
    #[arg(long, allow_hyphen_values = true)]
    flow: Option<String>,
    #[arg(long)]
    integrated: Option<String>,
    #[arg(long, default_value_t = DEFAULT_FETCH_LIMIT, value_parser = parse_limit)]
    order_limit: usize,
    #[arg(long, default_value_t = DEFAULT_FETCH_LIMIT, value_parser = parse_limit)]
    rental_limit: usize,
    #[arg(long, default_value_t = DEFAULT_FETCH_LIMIT, value_parser = parse_limit)]
    application_limit: usize,
}

impl FeedArgs {
    fn raw_params(&self) -> RawFeedParams {
        RawFeedParams {
            page: self.page.clone(),
            page_size: self.page_size.clone(),
            kind: self.kind.clone(),
            q: self.q.clone(),
            warn: self.warn.then(|| "1".to_string()),
            flow: self.flow.clone(),
            integrated: self.integrated.clone(),
        }
    }

    fn limits(&self) -> FetchLimits {
        FetchLimits {
            orders: self.order_limit,
            rentals: self.rental_limit,
            applications: self.application_limit,
        }
    }
}

fn parse_limit(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("limit must be at least 1".to_string()),
        Ok(value) => Ok(value),
        Err(err) => Err(err.to_string()),
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    // stdout carries the JSON contract; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Data { command } => run_data(command, &cli.db),
        Command::Feed(args) => run_feed(&args, cli.db),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_data(command: DataCommand, db: &Path) -> Result<()> {
    match command {
        DataCommand::Import(args) => {
            let body = fs::read_to_string(&args.input)
                .with_context(|| format!("failed to read dataset {}", args.input.display()))?;
            let dataset: Dataset = serde_json::from_str(&body)
                .with_context(|| format!("failed to parse dataset {}", args.input.display()))?;

            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            let summary = store.import_dataset(&dataset)?;
            tracing::info!(input = %args.input.display(), "dataset imported");
            emit_json(serde_json::json!({
                "in_file": args.input,
                "summary": summary
            }))
        }
    }
}

fn run_feed(args: &FeedArgs, db: PathBuf) -> Result<()> {
    let query = FeedQuery::from_params(&args.raw_params());
    let api = OperationsApi::new(db).with_limits(args.limits());
    let page = api.operations_feed(&query)?;
    emit_json(serde_json::to_value(&page).context("failed to serialize feed page")?)
}
