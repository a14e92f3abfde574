//! rbackupd - serve rbackup clients from a storage root

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use rbackup::cli::{DaemonCommand, DaemonOpts};
use rbackup::client::StopSignal;
use rbackup::config::{self, Loaded, ServerConfig};
use rbackup::logger;
use rbackup::server::{BackupServer, CredentialStore, UserStore};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let mut config = match config::load_or_create::<ServerConfig>(&opts.config)
        .with_context(|| format!("loading {}", opts.config.display()))?
    {
        Loaded::Existing(config) => config,
        Loaded::Created(path) => {
            println!("No configuration file found!");
            println!("A default file has been created at {}", path.display());
            println!("Review it, then relaunch the daemon.");
            std::process::exit(1);
        }
    };
    opts.apply(&mut config);
    logger::init(opts.verbose, config.log_file.as_deref()).context("initializing logging")?;

    if let Some(DaemonCommand::AddUser { user, pass }) = &opts.command {
        let users = UserStore::open(&config.users_db)
            .with_context(|| format!("opening {}", config.users_db.display()))?;
        users
            .add_user(user, pass)
            .with_context(|| format!("adding user {user}"))?;
        println!("User {user} added");
        return Ok(());
    }

    // Validate root directory if it already exists
    if config.root.exists() && !config.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", config.root.display());
    }
    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("creating root {}", config.root.display()))?;
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    if config.bind.starts_with("0.0.0.0") {
        tracing::warn!(
            bind = %config.bind,
            "listening on all interfaces; traffic is not encrypted"
        );
    }

    let mut server = BackupServer::open(&config).context("server start failed")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server.local_addr(),
        root = %config.root.display(),
        workers = config.workers,
        "rbackupd running"
    );

    let stop = Arc::new(StopSignal::default());
    let on_signal = stop.clone();
    ctrlc::set_handler(move || on_signal.request()).context("installing Ctrl-C handler")?;
    stop.wait();

    tracing::info!("shutting down");
    server.stop();
    Ok(())
}
