//! Client and server configuration.
//!
//! Both are stored as TOML. A missing file is replaced by a default one and the
//! caller is told to fill it in before relaunching.

use crate::error::{RbError, Result};
use crate::protocol::timeouts;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address (host:port).
    #[serde(default = "default_server")]
    pub server: String,

    /// Directory mirrored to the server.
    #[serde(default = "default_client_root")]
    pub root: PathBuf,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Number of sender threads.
    #[serde(default = "default_senders")]
    pub senders: usize,

    /// Pending operations before `add` blocks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Attempts per operation before it is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Shut the client down when an operation exhausts its attempts.
    #[serde(default)]
    pub stop_on_exhausted: bool,

    /// Pull the server's copy into `root` before watching.
    #[serde(default)]
    pub restore: bool,

    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_pool_idle_ms")]
    pub pool_idle_ms: u64,

    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (host:port).
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Storage root; each user gets a private subdirectory.
    #[serde(default = "default_server_root")]
    pub root: PathBuf,

    /// Worker threads serving connections.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Accepted connections waiting for a worker.
    #[serde(default = "default_backlog")]
    pub backlog: usize,

    /// Maximum concurrently guarded (user, path) pairs.
    #[serde(default = "default_guard_capacity")]
    pub guard_capacity: usize,

    #[serde(default = "default_session_idle_ms")]
    pub session_idle_ms: u64,

    /// Credential database (JSON).
    #[serde(default = "default_users_db")]
    pub users_db: PathBuf,

    /// File metadata database (JSON).
    #[serde(default = "default_files_db")]
    pub files_db: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

fn default_server() -> String {
    "127.0.0.1:8031".into()
}

fn default_client_root() -> PathBuf {
    PathBuf::from("./backup")
}

fn default_senders() -> usize {
    num_cpus::get().clamp(2, 8)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_pool_size() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_watch_interval_ms() -> u64 {
    5_000
}

fn default_rpc_timeout_ms() -> u64 {
    timeouts::RPC_MS
}

fn default_connect_timeout_ms() -> u64 {
    timeouts::CONNECT_MS
}

fn default_pool_idle_ms() -> u64 {
    timeouts::POOL_IDLE_MS
}

fn default_reap_interval_ms() -> u64 {
    timeouts::REAP_INTERVAL_MS
}

fn default_bind() -> String {
    "0.0.0.0:8031".into()
}

fn default_server_root() -> PathBuf {
    PathBuf::from("./rbackup-data")
}

fn default_workers() -> usize {
    num_cpus::get().max(2)
}

fn default_backlog() -> usize {
    64
}

fn default_guard_capacity() -> usize {
    4096
}

fn default_session_idle_ms() -> u64 {
    timeouts::SESSION_IDLE_MS
}

fn default_users_db() -> PathBuf {
    PathBuf::from("users.json")
}

fn default_files_db() -> PathBuf {
    PathBuf::from("files.json")
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            root: default_client_root(),
            user: String::new(),
            password: String::new(),
            senders: default_senders(),
            queue_capacity: default_queue_capacity(),
            pool_size: default_pool_size(),
            max_attempts: default_max_attempts(),
            stop_on_exhausted: false,
            restore: false,
            watch_interval_ms: default_watch_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_idle_ms: default_pool_idle_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            log_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            root: default_server_root(),
            workers: default_workers(),
            backlog: default_backlog(),
            guard_capacity: default_guard_capacity(),
            session_idle_ms: default_session_idle_ms(),
            users_db: default_users_db(),
            files_db: default_files_db(),
            log_file: None,
        }
    }
}

impl ClientConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pool_idle(&self) -> Duration {
        Duration::from_millis(self.pool_idle_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    /// Rejects settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(RbError::Config("user is not set".into()));
        }
        if self.senders == 0 || self.pool_size == 0 || self.queue_capacity == 0 {
            return Err(RbError::Config(
                "senders, pool_size and queue_capacity must be positive".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(RbError::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_millis(self.session_idle_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.backlog == 0 || self.guard_capacity == 0 {
            return Err(RbError::Config(
                "workers, backlog and guard_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of [`load_or_create`].
#[derive(Debug)]
pub enum Loaded<T> {
    Existing(T),
    /// No file was found; a default one was written here.
    Created(PathBuf),
}

/// Loads a TOML config, writing a default one if `path` does not exist.
pub fn load_or_create<T>(path: &Path) -> Result<Loaded<T>>
where
    T: Serialize + DeserializeOwned + Default,
{
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)
            .map_err(|e| RbError::Config(format!("{}: {e}", path.display())))?;
        return Ok(Loaded::Existing(config));
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = toml::to_string_pretty(&T::default())
        .map_err(|e| RbError::Config(e.to_string()))?;
    std::fs::write(path, content)?;

    // Holds a password on the client side.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::debug!(path = %path.display(), "default configuration written");
    Ok(Loaded::Created(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_fields_take_defaults() {
        let config: ClientConfig = toml::from_str("user = \"alice\"\nsenders = 2\n").unwrap();
        assert_eq!(config.user, "alice");
        assert_eq!(config.senders, 2);
        assert_eq!(config.max_attempts, 3);
        assert!(!config.stop_on_exhausted);
        assert_eq!(config.rpc_timeout_ms, timeouts::RPC_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_is_created_then_loaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("rbackupd.toml");

        match load_or_create::<ServerConfig>(&path).unwrap() {
            Loaded::Created(p) => assert_eq!(p, path),
            Loaded::Existing(_) => panic!("expected a fresh file"),
        }
        assert!(path.exists());

        match load_or_create::<ServerConfig>(&path).unwrap() {
            Loaded::Existing(config) => {
                assert_eq!(config.bind, default_bind());
                assert_eq!(config.guard_capacity, default_guard_capacity());
            }
            Loaded::Created(_) => panic!("file should have been reused"),
        }
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rbackup.toml");
        std::fs::write(&path, "senders = \"many\"").unwrap();
        assert!(matches!(
            load_or_create::<ClientConfig>(&path),
            Err(RbError::Config(_))
        ));
    }

    #[test]
    fn validation_rejects_zero_attempts() {
        let config = ClientConfig {
            user: "bob".into(),
            max_attempts: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(RbError::Config(_))));
    }
}
