//! Per-exchange deadlines enforced by one background thread.
//!
//! A connection arms a deadline before writing a request and disarms it once
//! the response is read. If the deadline passes first, the watchdog shuts the
//! socket down, which makes the blocked read or write fail; the connection
//! then reports a timeout instead of an I/O error.

use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Armed {
    at: Instant,
    stream: TcpStream,
    fired: Arc<AtomicBool>,
}

#[derive(Default)]
struct WatchState {
    armed: HashMap<u64, Armed>,
    next_id: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<WatchState>,
    changed: Condvar,
}

pub struct Watchdog {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Armed deadline; disarmed on drop.
pub struct Deadline {
    shared: Arc<Shared>,
    id: u64,
    fired: Arc<AtomicBool>,
}

impl Deadline {
    /// True if the watchdog closed the socket for this exchange.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.shared.state.lock().armed.remove(&self.id);
    }
}

impl Watchdog {
    pub fn start() -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(WatchState::default()),
            changed: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("rb-watchdog".into())
            .spawn(move || run(&worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Close `stream` if the returned guard is still alive after `timeout`.
    pub fn arm(&self, stream: &TcpStream, timeout: Duration) -> Result<Deadline> {
        let stream = stream.try_clone()?;
        let fired = Arc::new(AtomicBool::new(false));
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.armed.insert(
            id,
            Armed {
                at: Instant::now() + timeout,
                stream,
                fired: fired.clone(),
            },
        );
        self.shared.changed.notify_one();
        Ok(Deadline {
            shared: self.shared.clone(),
            id,
            fired,
        })
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            self.shared.changed.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    while !state.stopped {
        let now = Instant::now();
        let expired: Vec<u64> = state
            .armed
            .iter()
            .filter(|(_, a)| a.at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(armed) = state.armed.remove(&id) {
                armed.fired.store(true, Ordering::Release);
                let _ = armed.stream.shutdown(Shutdown::Both);
                tracing::debug!("deadline expired, socket closed");
            }
        }

        match state.armed.values().map(|a| a.at).min() {
            Some(next) => {
                shared.changed.wait_until(&mut state, next);
            }
            None => shared.changed.wait(&mut state),
        }
    }
}
