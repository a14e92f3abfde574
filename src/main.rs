//! rbackup - keep a local directory mirrored on an rbackup server

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use rbackup::cli::{ClientCommand, ClientOpts};
use rbackup::client::{ConnectionPool, PoolConfig, SyncClient, Transfer};
use rbackup::config::{self, ClientConfig, Loaded};
use rbackup::logger;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();

    let mut config = match config::load_or_create::<ClientConfig>(&opts.config)
        .with_context(|| format!("loading {}", opts.config.display()))?
    {
        Loaded::Existing(config) => config,
        Loaded::Created(path) => {
            println!("No configuration file found!");
            println!("A default file has been created at {}", path.display());
            println!("Insert the necessary information, then relaunch the application.");
            std::process::exit(1);
        }
    };
    opts.apply(&mut config);
    logger::init(opts.verbose, config.log_file.as_deref()).context("initializing logging")?;
    config.validate().context("invalid configuration")?;

    match opts.command {
        Some(ClientCommand::List) => list(&config),
        None => run(config),
    }
}

fn run(config: ClientConfig) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server,
        root = %config.root.display(),
        "starting rbackup client"
    );

    let mut client = SyncClient::start(config).context("client start failed")?;

    let stop = client.stop_signal();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, stopping...");
        stop.request();
    })
    .context("installing Ctrl-C handler")?;

    client.wait();
    client.stop();
    Ok(())
}

fn list(config: &ClientConfig) -> Result<()> {
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(config))?);
    let transfer = Transfer::new(pool.clone(), config.root.clone());
    transfer
        .authenticate(&config.user, &config.password)
        .context("authentication failed")?;
    let files = transfer.probe().context("probe failed")?;

    for (path, meta) in &files {
        let mtime = chrono::DateTime::from_timestamp(meta.last_write_time, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| meta.last_write_time.to_string());
        println!("{:>12}  {:08x}  {}  {}", meta.size, meta.checksum, mtime, path);
    }
    println!("{} file(s)", files.len());
    pool.shutdown();
    Ok(())
}
