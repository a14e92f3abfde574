//! Backup client: operation queue, connection pool and sender threads

pub mod connection;
pub mod deadline;
pub mod flow;
pub mod pool;
pub mod queue;
pub mod transfer;

pub use flow::{StopSignal, SyncClient};
pub use pool::{ConnectionPool, PoolConfig};
pub use queue::{FileCommand, FileOperation, OperationQueue};
pub use transfer::{Transfer, UploadOutcome};
