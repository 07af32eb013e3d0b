//! Tabseed - bulk-load JSON record files into DynamoDB tables

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabseed_common::logging::{init_logging, LogConfig, LogLevel};
use tabseed_common::ReconciliationPolicy;
use tabseed_loader::config::{Manifest, DEFAULT_MANIFEST};
use tabseed_loader::progress::{BarProgress, LogProgress, ProgressObserver};
use tabseed_loader::provision::Provisioner;
use tabseed_loader::reconcile::Reconciler;
use tabseed_loader::source::JsonFileSource;
use tabseed_loader::store::dynamo::DynamoSettings;
use tabseed_loader::store::{DynamoStore, MemoryStore, TableStore};
use tabseed_loader::{BatchWriter, Coordinator};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tabseed")]
#[command(author, version, about = "Bulk-load JSON record files into DynamoDB tables")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision the manifest's tables and load their input files
    Load(LoadArgs),

    /// Check the manifest and show the resolved table plan
    Validate {
        /// Manifest file
        #[arg(short, long, default_value = DEFAULT_MANIFEST)]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Manifest file
    #[arg(short, long, default_value = DEFAULT_MANIFEST)]
    config: PathBuf,

    /// Existing data policy: append or replace (overrides the manifest)
    #[arg(short, long)]
    policy: Option<ReconciliationPolicy>,

    /// Directory holding the input files (overrides the manifest)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// DynamoDB endpoint, e.g. http://localhost:8000 for DynamoDB Local
    #[arg(long, env = "DYNAMODB_ENDPOINT")]
    endpoint_url: Option<String>,

    /// AWS region (defaults to the AWS configuration, then us-east-1)
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Load into an in-memory store instead of DynamoDB
    #[arg(long)]
    dry_run: bool,

    /// Log progress lines instead of drawing progress bars
    #[arg(long)]
    no_progress: bool,

    /// Exit with an error when any table fails
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let (cli, dotenv) = parse_args(None, std::env::args_os());

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("tabseed")
        .build()
        .with_env_overrides()?;
    let _guard = init_logging(&log_config)?;

    if let Some(path) = dotenv {
        debug!(path = %path.display(), "Loaded environment file");
    }

    match cli.command {
        Command::Load(args) => load(args).await,
        Command::Validate { config } => validate(&config),
    }
}

/// Load the environment file, then parse the command line.
///
/// Table names and AWS settings may live in `.env`, and clap reads `env`
/// fallbacks while parsing, so the file must be loaded first. Without an
/// explicit `env_file` the usual `.env` lookup applies.
fn parse_args<I, T>(env_file: Option<&Path>, args: I) -> (Cli, Option<PathBuf>)
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let loaded = match env_file {
        Some(path) => dotenvy::from_path(path).ok().map(|()| path.to_path_buf()),
        None => dotenvy::dotenv().ok(),
    };
    (Cli::parse_from(args), loaded)
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    Manifest::load(path)
        .and_then(Manifest::with_env_overrides)
        .with_context(|| format!("Failed to load manifest '{}'", path.display()))
}

async fn load(args: LoadArgs) -> Result<()> {
    let mut manifest = read_manifest(&args.config)?;
    if let Some(dir) = args.data_dir {
        manifest.data_dir = dir;
    }
    if let Some(policy) = args.policy {
        manifest.policy = policy;
    }
    manifest.validate()?;

    let plans = manifest.resolve_tables()?;
    if plans.is_empty() {
        warn!("No table names could be resolved, nothing to load");
        return Ok(());
    }

    let store: Arc<dyn TableStore> = if args.dry_run {
        info!("Dry run: loading into an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let dynamo = DynamoStore::connect(&DynamoSettings {
            region: args.region,
            endpoint_url: args.endpoint_url,
        })
        .await;
        dynamo
            .ping()
            .await
            .context("Cannot reach DynamoDB. Check credentials, region and endpoint")?;
        info!("Connected to DynamoDB");
        Arc::new(dynamo)
    };

    let observer: Arc<dyn ProgressObserver> =
        if args.no_progress || !std::io::stderr().is_terminal() {
            Arc::new(LogProgress)
        } else {
            Arc::new(BarProgress::new())
        };

    let coordinator = Coordinator::new(
        Provisioner::new(Arc::clone(&store), manifest.provision.to_settings()),
        Reconciler::new(Arc::clone(&store), manifest.write.retry_policy())
            .with_batch_size(manifest.write.batch_size),
        BatchWriter::new(Arc::clone(&store), manifest.write.to_settings()).with_observer(observer),
        Arc::new(JsonFileSource::new(&manifest.data_dir)),
        manifest.policy,
    );

    let summary = coordinator.run(&plans).await;
    summary.log();

    if args.strict && !summary.all_passed() {
        anyhow::bail!(
            "{} of {} table(s) failed",
            summary.failed_count(),
            summary.tables.len()
        );
    }
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let manifest = read_manifest(path)?;
    manifest.validate()?;
    let plans = manifest.resolve_tables()?;

    println!("Manifest: {}", path.display());
    println!("Data directory: {}", manifest.data_dir.display());
    println!("Policy: {}", manifest.policy);
    println!(
        "Write: batch_size={} max_workers={} max_retries={}",
        manifest.write.batch_size, manifest.write.max_workers, manifest.write.max_retries
    );
    println!();
    for plan in &plans {
        match &plan.file {
            Some(file) => println!("  {} <- {}", plan.descriptor, file),
            None => println!("  {} (create only)", plan.descriptor),
        }
    }

    let skipped = manifest.tables.len() - plans.len();
    if skipped > 0 {
        println!();
        println!("{skipped} table(s) skipped: name not set in the environment");
    }
    Ok(())
}
