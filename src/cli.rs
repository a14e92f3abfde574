//! Command-line options for both binaries. Flags override the config file.

use crate::config::{ClientConfig, ServerConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Mirror a local directory to an rbackup server
#[derive(Clone, Debug, Parser)]
#[command(name = "rbackup", version, about)]
pub struct ClientOpts {
    /// Configuration file (created with defaults if missing)
    #[arg(long, default_value = "rbackup.toml")]
    pub config: PathBuf,

    /// Server address (host:port)
    #[arg(long)]
    pub server: Option<String>,

    /// Directory to back up
    #[arg(long)]
    pub root: Option<PathBuf>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// Pull the server's copy into the root before watching
    #[arg(long)]
    pub restore: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<ClientCommand>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Print the server's view of the backed-up files and exit
    List,
}

impl ClientOpts {
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if self.restore {
            config.restore = true;
        }
        if self.log_file.is_some() {
            config.log_file = self.log_file.clone();
        }
    }
}

/// rbackup storage daemon
#[derive(Clone, Debug, Parser)]
#[command(name = "rbackupd", version, about)]
pub struct DaemonOpts {
    /// Configuration file (created with defaults if missing)
    #[arg(long, default_value = "rbackupd.toml")]
    pub config: PathBuf,

    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Storage root
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Worker threads
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<DaemonCommand>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum DaemonCommand {
    /// Register a user and exit
    AddUser { user: String, pass: String },
}

impl DaemonOpts {
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.log_file.is_some() {
            config.log_file = self.log_file.clone();
        }
    }
}
