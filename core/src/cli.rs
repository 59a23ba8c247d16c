use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use db::Db;
use models::RemoteConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;
use utilities::RealFileSystem;

use crate::api::{CheckOutcome, HttpIngestApi, IngestApi};
use crate::config;
use crate::engine::Agent;
use crate::status;

#[derive(Debug, Parser)]
#[command(
    name = "sift",
    version,
    about = "Sift edge agent: watches local folders and uploads documents to the ingestion endpoint"
)]
pub struct Cli {
    /// Config file (default: searched beside the executable, in the system
    /// config directory, then the home directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Keep state next to the executable instead of the system data directory
    #[arg(long, global = true)]
    pub local: bool,

    /// Verbose debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent in the foreground
    Run,
    /// Manage remote endpoints and watch folders
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },
    /// Clear the upload history database
    ResetHistory {
        /// Specific file path to clear from history
        #[arg(long, short)]
        path: Option<PathBuf>,
    },
    /// Show a snapshot of the file log
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum RemoteCommand {
    /// Add a new folder to watch
    Add(AddArgs),
    /// List configured remotes
    #[command(alias = "list")]
    Ls,
    /// Remove a configured remote
    #[command(alias = "rm")]
    Remove { name: String },
}

#[derive(Debug, Args)]
pub struct AddArgs {
    /// Unique name for this watcher
    #[arg(long)]
    pub name: String,
    /// Local folder path to watch
    #[arg(long)]
    pub path: PathBuf,
    /// API endpoint URL
    #[arg(long)]
    pub endpoint: String,
    /// API key (secret)
    #[arg(long)]
    pub key: String,
    /// Skip connection verification
    #[arg(long)]
    pub force: bool,
    /// Number of consecutive checks that must pass
    #[arg(long, default_value_t = 3)]
    pub stability_threshold: u32,
    /// Time to wait between checks
    #[arg(long, default_value = "5s")]
    pub check_interval: String,
    /// Maximum time to wait for stability
    #[arg(long, default_value = "30m")]
    pub stability_timeout: String,
    /// Maximum number of simultaneous uploads
    #[arg(long, default_value_t = 5)]
    pub concurrency_limit: u32,
    /// Interval for the backup scan
    #[arg(long, default_value = "1m")]
    pub polling_interval: String,
    /// Wait for silence before verification starts
    #[arg(long, default_value = "5s")]
    pub settling_delay: String,
    /// Disable real-time filesystem events (rely purely on polling)
    #[arg(long)]
    pub no_fsnotify: bool,
}

/// Global flags that every subcommand consults.
#[derive(Debug, Clone)]
struct Globals {
    config: Option<PathBuf>,
    local: bool,
    debug: bool,
}

pub async fn execute(cli: Cli) -> Result<()> {
    let globals = Globals {
        config: cli.config,
        local: cli.local,
        debug: cli.debug,
    };
    match cli.command {
        Command::Run => run_agent(&globals).await,
        Command::Remote { command } => match command {
            RemoteCommand::Add(args) => remote_add(&globals, args).await,
            RemoteCommand::Ls => remote_ls(&globals),
            RemoteCommand::Remove { name } => remote_remove(&globals, &name),
        },
        Command::ResetHistory { path } => reset_history(&globals, path),
        Command::Status { json } => show_status(&globals, json),
    }
}

async fn run_agent(globals: &Globals) -> Result<()> {
    let (cfg, _config_path) = config::load(globals.config.as_deref())?;
    let log_path = config::resolve_log_path(&cfg, globals.local);
    let fs = RealFileSystem::new();
    utilities::init_logging(&log_path, &fs, if globals.debug { "debug" } else { "info" })?;

    let db_path = config::resolve_db_path(&cfg, globals.local)?;
    // Without durable state the agent cannot guarantee exactly-once
    // delivery, so a failed open aborts the process.
    let db = Db::open(&db_path)
        .with_context(|| format!("file log initialisation failed at {}", db_path.display()))?;

    println!("Sift agent starting...");
    info!("Sift agent starting (state: {})", db_path.display());

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                token.cancel();
            }
        });
    }

    Agent::new(cfg.remotes, db).run(token).await;

    println!("Sift agent shutting down...");
    Ok(())
}

async fn remote_add(globals: &Globals, args: AddArgs) -> Result<()> {
    let endpoint = args.endpoint.trim_end_matches('/').to_string();
    let abs_path = std::path::absolute(&args.path)
        .with_context(|| format!("invalid path {}", args.path.display()))?;

    let remote = RemoteConfig {
        name: args.name,
        path: abs_path,
        endpoint,
        key: args.key,
        stability_threshold: args.stability_threshold,
        check_interval: args.check_interval,
        stability_timeout: args.stability_timeout,
        concurrency_limit: args.concurrency_limit,
        polling_interval: args.polling_interval,
        settling_delay: args.settling_delay,
        disable_fsnotify: args.no_fsnotify,
    };

    if !args.force {
        println!("Verifying connection to {}...", remote.endpoint);
        let api = HttpIngestApi::new();
        match api.check(&remote).await {
            Ok(CheckOutcome::Valid) => println!("Connection verified."),
            Ok(CheckOutcome::InvalidKey(status)) => {
                println!("Authentication failed: invalid API key (status {status}).");
                return Ok(());
            }
            Ok(CheckOutcome::Unexpected(status)) => {
                println!("Unexpected response: status {status}.");
                return Ok(());
            }
            Err(e) => {
                println!("Connection failed: {e:#}");
                println!("Use --force to add anyway.");
                return Ok(());
            }
        }
    }

    let (cfg, config_path) = config::load(globals.config.as_deref())?;
    if cfg.remotes.iter().any(|r| r.name == remote.name) {
        println!("Error: remote '{}' already exists.", remote.name);
        return Ok(());
    }

    let mut remotes = cfg.remotes;
    remotes.push(remote.clone());
    let target = config_path.unwrap_or_else(config::default_config_path);
    config::save_remotes(&target, &remotes)?;

    println!(
        "Remote '{}' added successfully. Watching: {}",
        remote.name,
        remote.path.display()
    );
    println!(
        "Policy: {} checks @ {} | max wait: {} | workers: {} | polling: {} | settling: {}",
        remote.stability_threshold,
        remote.check_interval,
        remote.stability_timeout,
        remote.concurrency_limit,
        remote.polling_interval,
        remote.settling_delay
    );
    if remote.disable_fsnotify {
        println!("Mode: polling only (real-time events disabled)");
    } else {
        println!("Mode: real-time events + polling backup");
    }
    println!("Restart the running agent to apply these changes.");
    Ok(())
}

fn remote_ls(globals: &Globals) -> Result<()> {
    let (cfg, _) = config::load(globals.config.as_deref())?;
    if cfg.remotes.is_empty() {
        println!("No remotes configured.");
        return Ok(());
    }
    println!("{:<15} {:<40} ENDPOINT", "NAME", "PATH");
    println!("{}", "-".repeat(80));
    for r in &cfg.remotes {
        println!("{:<15} {:<40} {}", r.name, r.path.display(), r.endpoint);
    }
    Ok(())
}

fn remote_remove(globals: &Globals, name: &str) -> Result<()> {
    let (cfg, config_path) = config::load(globals.config.as_deref())?;
    let before = cfg.remotes.len();
    let remotes: Vec<RemoteConfig> = cfg
        .remotes
        .into_iter()
        .filter(|r| r.name != name)
        .collect();

    if remotes.len() == before {
        println!("Error: remote '{name}' not found.");
        return Ok(());
    }

    let target = config_path.context("no config file found")?;
    config::save_remotes(&target, &remotes)?;
    println!("Remote '{name}' removed successfully.");
    println!("Restart the running agent to apply these changes.");
    Ok(())
}

fn reset_history(globals: &Globals, path: Option<PathBuf>) -> Result<()> {
    let (cfg, _) = config::load(globals.config.as_deref())?;
    let db_path = config::resolve_db_path(&cfg, globals.local)?;
    let db = Db::open(&db_path)
        .with_context(|| format!("file log initialisation failed at {}", db_path.display()))?;

    match &path {
        Some(p) => println!("Clearing history for: {}", p.display()),
        None => println!(
            "WARNING: clearing the entire upload history. Files will be re-uploaded if seen again."
        ),
    }
    let removed = db.reset_history(path.as_deref())?;
    println!("History reset: {removed} record(s) removed.");
    Ok(())
}

fn show_status(globals: &Globals, json: bool) -> Result<()> {
    let (cfg, _) = config::load(globals.config.as_deref())?;
    let db_path = config::resolve_db_path(&cfg, globals.local)?;
    let db = Db::open(&db_path)
        .with_context(|| format!("file log initialisation failed at {}", db_path.display()))?;
    let snapshot = status::collect(&db)?;
    status::print(&snapshot, json)
}
