use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info, warn};
use tokio_util::sync::CancellationToken;

use deskpool::config::DeskpoolConfig;
use deskpool::session::SessionManager;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config = DeskpoolConfig::load(cli.common.config.as_deref())
        .context("loading configuration")?;

    match cli.command {
        Command::Serve => async_serve(config),
        Command::Sweep => async_sweep(config),
        Command::Config { command } => handle_config(&config, command),
    }
}

#[tokio::main]
async fn async_serve(config: DeskpoolConfig) -> Result<()> {
    handle_serve(config).await
}

#[tokio::main]
async fn async_sweep(config: DeskpoolConfig) -> Result<()> {
    handle_sweep(config).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Deskpool - session resource and routing manager for virtual desktop pools.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the session manager: prepare the base filesystem, reconcile
    /// leftovers from a previous run, then supervise sessions until
    /// interrupted
    Serve,
    /// Reclaim orphan resources from a crashed run and exit
    Sweep,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default config file path
    Path,
}

fn init_logging(opts: &CommonOpts) {
    let level = if opts.quiet {
        LevelFilter::Error
    } else {
        match opts.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

async fn handle_serve(config: DeskpoolConfig) -> Result<()> {
    let manager = Arc::new(SessionManager::new(config));

    manager
        .overlay()
        .ensure_base()
        .context("preparing base filesystem")?;

    let reclaimed = manager.reconcile().await.context("startup reconciliation")?;
    if reclaimed > 0 {
        info!("reclaimed {} orphan session(s) from a previous run", reclaimed);
    }

    info!(
        "deskpool serving, capacity {} session(s), proxy at {}:{}",
        manager.capacity(),
        manager.config().proxy.host,
        manager.config().proxy.port
    );

    let cancel = CancellationToken::new();
    let maintenance = {
        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run_maintenance(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    cancel.cancel();
    if let Err(err) = maintenance.await {
        warn!("maintenance task ended abnormally: {}", err);
    }
    manager.shutdown().await;
    info!("all sessions destroyed, exiting");
    Ok(())
}

async fn handle_sweep(config: DeskpoolConfig) -> Result<()> {
    let manager = SessionManager::new(config);
    let reclaimed = manager.reconcile().await.context("reconciliation sweep")?;
    println!("reclaimed {} orphan session(s)", reclaimed);
    Ok(())
}

fn handle_config(config: &DeskpoolConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let toml = toml::to_string_pretty(config).context("serializing configuration")?;
            print!("{}", toml);
        }
        ConfigCommand::Path => match DeskpoolConfig::default_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("(no config directory on this platform)"),
        },
    }
    Ok(())
}
