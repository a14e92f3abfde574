//! rbackup library
//!
//! Mirrors a watched directory to a remote server over a framed TCP protocol.
//! Files travel in 1 MiB segments that the server accepts strictly in order
//! and commits only after a whole-file CRC-32 check.

pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod messages;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod watcher;

pub use error::{Disposition, RbError, Result};
