//! Client lifecycle: initial sync, watcher thread and sender pool.

use super::pool::{ConnectionPool, PoolConfig};
use super::queue::{FileCommand, FileOperation, OperationQueue};
use super::transfer::{Transfer, UploadOutcome};
use crate::config::ClientConfig;
use crate::error::{Disposition, RbError, Result};
use crate::protocol_core::resolve_under_root;
use crate::watcher::{self, FileEvent, FileStatus, Snapshot};
use parking_lot::{Condvar, Mutex};
use std::io::ErrorKind;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// One-shot stop request that threads can wait on.
#[derive(Default)]
pub struct StopSignal {
    requested: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn request(&self) {
        *self.requested.lock() = true;
        self.cv.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.lock()
    }

    pub fn wait(&self) {
        let mut requested = self.requested.lock();
        while !*requested {
            self.cv.wait(&mut requested);
        }
    }

    /// Sleep up to `timeout`; true if a stop was requested meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut requested = self.requested.lock();
        if !*requested {
            self.cv.wait_for(&mut requested, timeout);
        }
        *requested
    }
}

#[derive(Clone)]
struct SenderCtx {
    queue: Arc<OperationQueue>,
    transfer: Arc<Transfer>,
    stop: Arc<StopSignal>,
    max_attempts: u32,
    stop_on_exhausted: bool,
}

pub struct SyncClient {
    queue: Arc<OperationQueue>,
    pool: Arc<ConnectionPool>,
    transfer: Arc<Transfer>,
    stop: Arc<StopSignal>,
    watcher: Option<JoinHandle<()>>,
    senders: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Authenticate, bring the server in line with the local tree and start
    /// watching. Authentication and restore failures are fatal.
    pub fn start(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;

        let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config))?);
        let transfer = Arc::new(Transfer::new(pool.clone(), config.root.clone()));
        transfer.authenticate(&config.user, &config.password)?;

        if config.restore {
            tracing::info!(root = %config.root.display(), "restoring from server");
            let server = transfer.probe()?;
            transfer.restore(&server)?;
        }

        let queue = Arc::new(OperationQueue::new(config.queue_capacity));
        let stop = Arc::new(StopSignal::default());
        let ctx = SenderCtx {
            queue: queue.clone(),
            transfer: transfer.clone(),
            stop: stop.clone(),
            max_attempts: config.max_attempts,
            stop_on_exhausted: config.stop_on_exhausted,
        };

        let mut senders = Vec::with_capacity(config.senders);
        for id in 0..config.senders {
            let ctx = ctx.clone();
            senders.push(
                thread::Builder::new()
                    .name(format!("rb-sender-{id}"))
                    .spawn(move || sender_loop(id, &ctx))?,
            );
        }

        let mut client = Self {
            queue,
            pool,
            transfer,
            stop,
            watcher: None,
            senders,
        };

        // senders are already draining, so seeding cannot deadlock on capacity
        let local = match client.initial_sync(&config) {
            Ok(local) => local,
            Err(e) => {
                client.stop();
                return Err(e);
            }
        };

        let root = config.root.clone();
        let interval = config.watch_interval();
        let queue = client.queue.clone();
        let stop = client.stop.clone();
        client.watcher = Some(
            thread::Builder::new()
                .name("rb-watcher".into())
                .spawn(move || watch_loop(&root, interval, local, &queue, &stop))?,
        );
        tracing::info!(senders = config.senders, "client started");
        Ok(client)
    }

    fn initial_sync(&self, config: &ClientConfig) -> Result<Snapshot> {
        let local = watcher::scan(&config.root, &Snapshot::new())?;
        let server = self.transfer.probe()?;
        let events = watcher::reconcile(&local, &server);
        tracing::info!(
            local = local.len(),
            server = server.len(),
            pending = events.len(),
            "initial sync"
        );
        for event in events {
            enqueue(&self.queue, event)?;
        }
        Ok(local)
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    /// Block until a stop is requested.
    pub fn wait(&self) {
        self.stop.wait();
    }

    /// Stop the watcher and the senders, then close the pool.
    pub fn stop(&mut self) {
        self.stop.request();
        self.queue.stop();
        if let Some(handle) = self.watcher.take() {
            let _ = handle.join();
        }
        for handle in self.senders.drain(..) {
            let _ = handle.join();
        }
        self.pool.shutdown();
        tracing::info!("client stopped");
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if !self.senders.is_empty() || self.watcher.is_some() {
            self.stop();
        }
    }
}

fn enqueue(queue: &OperationQueue, event: FileEvent) -> Result<()> {
    let command = match event.status {
        FileStatus::Removed => FileCommand::Remove,
        FileStatus::Created | FileStatus::Modified => FileCommand::Upload,
    };
    tracing::info!(path = %event.path, status = ?event.status, "change detected");
    queue.add(&event.path, event.metadata, command)?;
    Ok(())
}

fn watch_loop(
    root: &std::path::Path,
    interval: Duration,
    mut previous: Snapshot,
    queue: &OperationQueue,
    stop: &StopSignal,
) {
    while !stop.wait_timeout(interval) {
        let current = match watcher::scan(root, &previous) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "scan failed");
                continue;
            }
        };
        for event in watcher::diff(&previous, &current) {
            if let Err(RbError::Stopped) = enqueue(queue, event) {
                return;
            }
        }
        previous = current;
    }
}

fn sender_loop(id: usize, ctx: &SenderCtx) {
    while let Some(op) = ctx.queue.get() {
        let result = match op.command {
            FileCommand::Upload => ctx.transfer.upload(&op),
            FileCommand::Remove => ctx
                .transfer
                .remove(&op.path)
                .map(|()| UploadOutcome::Uploaded),
        };

        match result {
            Ok(UploadOutcome::Changed) => requeue_current(id, ctx, &op),
            Ok(outcome) => {
                match (op.command, outcome) {
                    (FileCommand::Remove, _) => {
                        tracing::info!(sender = id, path = %op.path, "removed")
                    }
                    (_, UploadOutcome::Uploaded) => tracing::info!(
                        sender = id,
                        path = %op.path,
                        size = op.metadata.size,
                        "uploaded"
                    ),
                    (_, UploadOutcome::Aborted) => {
                        tracing::info!(sender = id, path = %op.path, "superseded")
                    }
                    (_, _) => tracing::debug!(sender = id, path = %op.path, "skipped"),
                }
                ctx.queue.remove(op.id);
            }
            Err(e) => {
                let exhausted = op.attempts() >= ctx.max_attempts;
                if e.disposition() == Disposition::Fatal || exhausted {
                    tracing::error!(
                        sender = id,
                        path = %op.path,
                        attempts = op.attempts(),
                        error = %e,
                        "giving up on operation"
                    );
                    ctx.queue.remove(op.id);
                    if ctx.stop_on_exhausted {
                        ctx.stop.request();
                        ctx.queue.stop();
                    }
                } else {
                    tracing::warn!(
                        sender = id,
                        path = %op.path,
                        attempt = op.attempts(),
                        error = %e,
                        "operation failed, will retry"
                    );
                    if !ctx.stop.wait_timeout(RETRY_BACKOFF * op.attempts()) {
                        ctx.queue.free(op.id);
                    }
                }
            }
        }
    }
}

/// Swap `op` for the file's current state after an upload found it changed.
fn requeue_current(id: usize, ctx: &SenderCtx, op: &FileOperation) {
    let path = op.path.as_str();
    let full = resolve_under_root(ctx.transfer.root(), path);
    match watcher::file_metadata(&full) {
        Ok(meta) => {
            tracing::debug!(sender = id, path, size = meta.size, "file changed, queueing again");
            ctx.queue.requeue(op.id, meta);
        }
        Err(e) => {
            match e {
                RbError::Io(ref io) if io.kind() == ErrorKind::NotFound => {
                    tracing::debug!(sender = id, path, "file vanished")
                }
                e => tracing::warn!(sender = id, path, error = %e, "cannot stat changed file"),
            }
            ctx.queue.remove(op.id);
        }
    }
}
