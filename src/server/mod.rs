//! Backup server: dispatch, write guard and storage

pub mod auth;
pub mod dispatch;
pub mod fsm;
pub mod guard;
pub mod handler;
pub mod store;

pub use auth::{CredentialStore, UserStore, MAX_TOKENS_PER_USER};
pub use dispatch::{DispatchConfig, Handler, Server};
pub use fsm::FileSystemManager;
pub use guard::{GuardError, GuardPermit, WriteGuard};
pub use handler::RequestHandler;
pub use store::{FileRecord, FileStore, MemoryStore, MetadataStore};

use crate::config::ServerConfig;
use crate::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;

/// A running server wired to its stores.
pub struct BackupServer {
    server: Server,
    handler: Arc<RequestHandler>,
}

impl BackupServer {
    pub fn start(
        config: &ServerConfig,
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;

        let handler = Arc::new(RequestHandler::new(
            credentials,
            store,
            config.root.clone(),
            config.guard_capacity,
        ));
        let dispatch = DispatchConfig {
            workers: config.workers,
            backlog: config.backlog,
            session_idle: config.session_idle(),
        };
        let server = Server::start(&config.bind, dispatch, handler.clone())?;
        Ok(Self { server, handler })
    }

    /// Open the JSON stores named in `config` and start.
    pub fn open(config: &ServerConfig) -> Result<Self> {
        let users = Arc::new(UserStore::open(&config.users_db)?);
        let files = Arc::new(FileStore::open(&config.files_db)?);
        Self::start(config, users, files)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    pub fn stop(&mut self) {
        self.handler.shutdown();
        self.server.stop();
    }
}
