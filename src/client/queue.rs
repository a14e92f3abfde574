//! Per-path operation scheduler shared by the watcher and the senders.
//!
//! At most one operation per path is processing at a time, and at most one
//! more waits behind it. A new event for a waiting path replaces the waiting
//! entry; a new event for a processing path flags the running operation for
//! abort and queues the new state behind it.

use crate::error::{RbError, Result};
use crate::messages::FileMetadata;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCommand {
    Upload,
    Remove,
}

#[derive(Debug)]
pub struct FileOperation {
    pub id: u64,
    pub path: String,
    pub metadata: FileMetadata,
    pub command: FileCommand,
    processing: AtomicBool,
    abort: AtomicBool,
    attempts: AtomicU32,
}

impl FileOperation {
    fn new(id: u64, path: String, metadata: FileMetadata, command: FileCommand) -> Self {
        Self {
            id,
            path,
            metadata,
            command,
            processing: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Set when a newer event superseded this operation.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Number of times this operation has been handed out by `get`.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }
}

struct QueueState {
    entries: VecDeque<Arc<FileOperation>>,
    // paths with a processing entry
    busy: HashSet<String>,
    next_id: u64,
    stopped: bool,
}

impl QueueState {
    fn claim(&mut self) -> Option<Arc<FileOperation>> {
        let op = self
            .entries
            .iter()
            .find(|op| !op.is_processing() && !self.busy.contains(&op.path))?
            .clone();
        op.processing.store(true, Ordering::Release);
        op.attempts.fetch_add(1, Ordering::AcqRel);
        self.busy.insert(op.path.clone());
        Some(op)
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|op| op.id == id)
    }
}

pub struct OperationQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl OperationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                busy: HashSet::new(),
                next_id: 0,
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue an operation for `path` and return its id.
    ///
    /// Blocks while the queue is full, unless the entry replaces a waiting
    /// one. Fails with `Stopped` once the queue has been stopped.
    pub fn add(&self, path: &str, metadata: FileMetadata, command: FileCommand) -> Result<u64> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Err(RbError::Stopped);
            }

            // the running operation learns it is stale even if we block below
            for op in state.entries.iter().filter(|op| op.path == path) {
                if op.is_processing() {
                    op.abort.store(true, Ordering::Release);
                }
            }

            let waiting = state
                .entries
                .iter()
                .position(|op| op.path == path && !op.is_processing());
            if waiting.is_some() || state.entries.len() < self.capacity {
                if let Some(idx) = waiting {
                    state.entries.remove(idx);
                }

                let id = state.next_id;
                state.next_id += 1;
                state.entries.push_back(Arc::new(FileOperation::new(
                    id,
                    path.to_string(),
                    metadata,
                    command,
                )));
                tracing::trace!(path, id, ?command, replaced = waiting.is_some(), "queued");
                self.not_empty.notify_one();
                return Ok(id);
            }

            self.not_full.wait(&mut state);
        }
    }

    /// Take the oldest operation whose path is not already processing.
    ///
    /// Blocks until one is available. Returns `None` once stopped.
    pub fn get(&self) -> Option<Arc<FileOperation>> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(op) = state.claim() {
                return Some(op);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Non-blocking `get`.
    pub fn try_get(&self) -> Option<Arc<FileOperation>> {
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        state.claim()
    }

    /// Hand a failed operation back for another attempt.
    ///
    /// A superseded operation is dropped instead, since a newer entry for the
    /// same path is already waiting.
    pub fn free(&self, id: u64) {
        let mut state = self.state.lock();
        let Some(idx) = state.position(id) else {
            return;
        };
        let op = state.entries[idx].clone();
        if op.is_processing() {
            state.busy.remove(&op.path);
        }
        if op.is_aborted() {
            state.entries.remove(idx);
            self.not_full.notify_all();
        } else {
            op.processing.store(false, Ordering::Release);
        }
        self.not_empty.notify_all();
    }

    /// Drop an operation for good (completed, or out of attempts).
    pub fn remove(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(idx) = state.position(id) else {
            return false;
        };
        if let Some(op) = state.entries.remove(idx) {
            if op.is_processing() {
                state.busy.remove(&op.path);
            }
        }
        self.not_full.notify_all();
        self.not_empty.notify_all();
        true
    }

    /// Replace a processing operation with a fresh upload of its path.
    ///
    /// The new entry takes the old one's place in the capacity count, so this
    /// never blocks. If a newer entry for the path is already waiting, it is
    /// kept and nothing is added. Returns the id of the added entry.
    pub fn requeue(&self, id: u64, metadata: FileMetadata) -> Option<u64> {
        let mut state = self.state.lock();
        let idx = state.position(id)?;
        let op = state.entries.remove(idx)?;
        if op.is_processing() {
            state.busy.remove(&op.path);
        }

        let waiting = state.entries.iter().any(|other| other.path == op.path);
        let added = if waiting || state.stopped {
            self.not_full.notify_all();
            None
        } else {
            let new_id = state.next_id;
            state.next_id += 1;
            state.entries.push_back(Arc::new(FileOperation::new(
                new_id,
                op.path.clone(),
                metadata,
                FileCommand::Upload,
            )));
            tracing::trace!(path = %op.path, id = new_id, "requeued");
            Some(new_id)
        };
        self.not_empty.notify_all();
        added
    }

    /// Wake every waiter; later `get` calls return `None` and `add` fails.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operations currently queued for `path`, oldest first.
    pub fn entries_for(&self, path: &str) -> Vec<Arc<FileOperation>> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|op| op.path == path)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn m(size: u64) -> FileMetadata {
        FileMetadata {
            checksum: 0,
            size,
            last_write_time: 0,
            mtime_nanos: 0,
        }
    }

    #[test]
    fn replacing_a_waiting_entry_keeps_one() {
        let q = OperationQueue::new(8);
        q.add("a", m(1), FileCommand::Upload).unwrap();
        q.add("a", m(0), FileCommand::Remove).unwrap();

        assert_eq!(q.len(), 1);
        let op = q.try_get().unwrap();
        assert_eq!(op.command, FileCommand::Remove);
        assert!(q.try_get().is_none());
    }

    #[test]
    fn event_on_processing_path_sets_abort_and_waits_behind() {
        let q = OperationQueue::new(8);
        q.add("a", m(1), FileCommand::Upload).unwrap();
        let running = q.try_get().unwrap();
        assert!(running.is_processing());

        q.add("a", m(2), FileCommand::Upload).unwrap();
        q.add("a", m(3), FileCommand::Upload).unwrap();
        assert!(running.is_aborted());

        let entries = q.entries_for("a");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().filter(|op| op.is_processing()).count(), 1);
        assert_eq!(entries[1].metadata.size, 3);

        // the newer entry is not handed out while the old one runs
        assert!(q.try_get().is_none());
        q.remove(running.id);
        let next = q.try_get().unwrap();
        assert_eq!(next.metadata.size, 3);
        assert!(!next.is_aborted());
    }

    #[test]
    fn requeue_reuses_the_slot_of_a_full_queue() {
        let q = OperationQueue::new(2);
        q.add("a", m(1), FileCommand::Upload).unwrap();
        q.add("b", m(1), FileCommand::Upload).unwrap();
        let running = q.try_get().unwrap();
        assert_eq!(running.path, "a");

        let id = q.requeue(running.id, m(7)).unwrap();
        assert_eq!(q.len(), 2);
        let entries = q.entries_for("a");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].metadata.size, 7);
        assert!(!entries[0].is_processing());
    }

    #[test]
    fn requeue_keeps_a_newer_waiting_entry() {
        let q = OperationQueue::new(8);
        q.add("a", m(1), FileCommand::Upload).unwrap();
        let running = q.try_get().unwrap();
        q.add("a", m(0), FileCommand::Remove).unwrap();

        assert_eq!(q.requeue(running.id, m(9)), None);
        let next = q.try_get().unwrap();
        assert_eq!(next.command, FileCommand::Remove);
        assert!(q.try_get().is_none());
    }

    #[test]
    fn distinct_paths_are_served_in_parallel() {
        let q = OperationQueue::new(8);
        q.add("a", m(1), FileCommand::Upload).unwrap();
        q.add("b", m(1), FileCommand::Upload).unwrap();
        let first = q.try_get().unwrap();
        let second = q.try_get().unwrap();
        assert_ne!(first.path, second.path);
    }

    #[test]
    fn free_releases_for_retry_and_counts_attempts() {
        let q = OperationQueue::new(8);
        let id = q.add("a", m(1), FileCommand::Upload).unwrap();
        let op = q.try_get().unwrap();
        assert_eq!(op.attempts(), 1);
        q.free(id);
        assert!(!op.is_processing());

        let again = q.try_get().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts(), 2);
        assert!(q.remove(id));
        assert!(q.is_empty());
        assert!(!q.remove(id));
    }

    #[test]
    fn freeing_a_superseded_operation_drops_it() {
        let q = OperationQueue::new(8);
        let old = q.add("a", m(1), FileCommand::Upload).unwrap();
        q.try_get().unwrap();
        q.add("a", m(2), FileCommand::Upload).unwrap();
        q.free(old);

        let entries = q.entries_for("a");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metadata.size, 2);
    }

    #[test]
    fn add_blocks_at_capacity_until_space_frees() {
        let q = Arc::new(OperationQueue::new(1));
        let first = q.add("a", m(1), FileCommand::Upload).unwrap();

        let (tx, rx) = mpsc::channel();
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                let r = q.add("b", m(1), FileCommand::Upload);
                tx.send(()).unwrap();
                r
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // replacing does not need room
        q.add("a", m(2), FileCommand::Upload).unwrap();
        assert_eq!(q.len(), 1);
        assert!(q.entries_for("a").iter().all(|op| op.id != first));

        let op = q.try_get().unwrap();
        q.remove(op.id);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(producer.join().unwrap().is_ok());
        assert_eq!(q.entries_for("b").len(), 1);
    }

    #[test]
    fn stop_wakes_blocked_getters() {
        let q = Arc::new(OperationQueue::new(4));
        let waiter = {
            let q = q.clone();
            thread::spawn(move || q.get())
        };
        thread::sleep(Duration::from_millis(50));
        q.stop();
        assert!(waiter.join().unwrap().is_none());
        assert!(matches!(
            q.add("a", m(1), FileCommand::Upload),
            Err(RbError::Stopped)
        ));
    }
}
