//! CLI command definitions, routing, and tracing setup.

use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use ctirelay_core::{CycleOutcome, Poller, PollerConfig, Sink};
use ctirelay_graph::IngestContext;
use ctirelay_queue::{FileQueueStore, QueueStore};
use ctirelay_shared::{AppConfig, ClientId, init_config, load_config, load_config_from, parse_records};
use tokio::sync::watch;
use tracing::info;

/// Crates whose events the default filter lets through.
const LOG_TARGETS: [&str; 5] = [
    "ctirelay_cli",
    "ctirelay_core",
    "ctirelay_graph",
    "ctirelay_queue",
    "ctirelay_shared",
];

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ctirelay — queue threat-intel records and relay them as STIX bundles.
#[derive(Parser)]
#[command(
    name = "ctirelay",
    version,
    about = "Queue threat-intel records per client and relay them as STIX 2.1 bundles.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.ctirelay/ctirelay.toml).
    #[arg(long, global = true, env = "CTIRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Append records to a client's queue.
    Push {
        /// Client token naming the queue.
        #[arg(long, env = "CTIRELAY_CLIENT")]
        client: String,

        /// JSON file holding an array of records (reads stdin when omitted).
        file: Option<PathBuf>,
    },

    /// Run a single polling cycle and print its report.
    Once,

    /// Run the polling loop until interrupted.
    Run,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Push { client, file } => cmd_push(config_path, &client, file.as_deref()),
        Command::Once => cmd_once(config_path).await,
        Command::Run => cmd_run(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

/// Load config from `--config` or the default location.
fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Everything a cycle needs, resolved from config. Misconfiguration fails here.
fn build_poller(config: &AppConfig) -> Result<Poller<FileQueueStore, Sink>> {
    config.validate()?;
    let ctx = IngestContext::from_config(config)?;
    let poller_config = PollerConfig::from_config(config)?;
    let queue = FileQueueStore::open(config.data_dir()?)?;
    let sink = Sink::from_config(config)?;
    Ok(Poller::new(queue, sink, ctx, poller_config))
}

fn read_body(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display())),
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .wrap_err("failed to read stdin")?;
            Ok(body)
        }
    }
}

fn cmd_push(config_path: Option<&Path>, client: &str, file: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let client = ClientId::new(client)?;
    let records = parse_records(&read_body(file)?)?;

    let queue = FileQueueStore::open(config.data_dir()?)?;
    let pending = queue.push(&client, &records)?;

    info!(%client, pushed = records.len(), pending, "records queued");
    println!("Queued {} record(s) for {client} ({pending} pending)", records.len());
    Ok(())
}

async fn cmd_once(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let poller = build_poller(&config)?;

    let report = poller.run_cycle().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    match report.outcome {
        CycleOutcome::Aborted { reason } => Err(eyre!("cycle aborted: {reason}")),
        _ => Ok(()),
    }
}

async fn cmd_run(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let poller = build_poller(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    poller.run(shutdown_rx).await;
    Ok(())
}

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = init_config(config_path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
