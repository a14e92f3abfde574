//! Bounded pool of persistent connections.
//!
//! The pool owns an arena of slots. A caller leases a slot index together
//! with the connection taken out of it, and only the pool puts connections
//! back or vacates slots. Connections idle for too long are retired by a
//! reaper thread with a final NOP.

use super::connection::Connection;
use super::deadline::Watchdog;
use crate::config::ClientConfig;
use crate::error::{RbError, Result};
use crate::messages::{Request, Response};
use crate::protocol::MsgType;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub addr: String,
    pub size: usize,
    pub rpc_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl From<&ClientConfig> for PoolConfig {
    fn from(c: &ClientConfig) -> Self {
        Self {
            addr: c.server.clone(),
            size: c.pool_size,
            rpc_timeout: c.rpc_timeout(),
            connect_timeout: c.connect_timeout(),
            idle_timeout: c.pool_idle(),
            reap_interval: c.reap_interval(),
        }
    }
}

enum Slot {
    Vacant,
    Leased,
    Idle { conn: Connection, last_used: Instant },
}

struct PoolState {
    slots: Vec<Slot>,
    stopped: bool,
}

struct Shared {
    cfg: PoolConfig,
    state: Mutex<PoolState>,
    freed: Condvar,
    reaper_wake: Condvar,
    token: RwLock<String>,
    watchdog: Watchdog,
}

struct Lease {
    index: usize,
    conn: Option<Connection>,
}

pub struct ConnectionPool {
    shared: Arc<Shared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(cfg: PoolConfig) -> Result<Self> {
        let size = cfg.size.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                slots: (0..size).map(|_| Slot::Vacant).collect(),
                stopped: false,
            }),
            freed: Condvar::new(),
            reaper_wake: Condvar::new(),
            token: RwLock::new(String::new()),
            watchdog: Watchdog::start()?,
            cfg,
        });
        let worker = shared.clone();
        let reaper = thread::Builder::new()
            .name("rb-pool-reaper".into())
            .spawn(move || reap_loop(&worker))?;
        Ok(Self {
            shared,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn set_token(&self, token: String) {
        *self.shared.token.write() = token;
    }

    pub fn has_token(&self) -> bool {
        !self.shared.token.read().is_empty()
    }

    /// Run one exchange on a pooled connection.
    ///
    /// The current session token is stamped on every request except AUTH.
    /// A failed exchange evicts its connection; retrying is up to the caller.
    pub fn run(&self, mut request: Request) -> Result<Response> {
        self.shared.stamp(&mut request);
        self.shared.run(request)
    }

    /// Idle plus leased connections.
    pub fn open_connections(&self) -> usize {
        self.shared
            .state
            .lock()
            .slots
            .iter()
            .filter(|s| !matches!(s, Slot::Vacant))
            .count()
    }

    /// Stop the reaper and the watchdog and drop idle connections.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.stopped {
                state.stopped = true;
                for slot in state.slots.iter_mut() {
                    if matches!(slot, Slot::Idle { .. }) {
                        *slot = Slot::Vacant;
                    }
                }
            }
            self.shared.freed.notify_all();
            self.shared.reaper_wake.notify_all();
        }
        if let Some(handle) = self.reaper.lock().take() {
            let _ = handle.join();
        }
        self.shared.watchdog.shutdown();
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn stamp(&self, request: &mut Request) {
        if request.kind != MsgType::Auth {
            request.token = self.token.read().clone();
        }
    }

    fn run(&self, request: Request) -> Result<Response> {
        let Lease { index, conn } = self.acquire()?;
        let mut conn = match conn {
            Some(conn) => conn,
            None => match Connection::connect(&self.cfg.addr, self.cfg.connect_timeout) {
                Ok(conn) => conn,
                Err(e) => {
                    self.release(index, None);
                    return Err(e);
                }
            },
        };

        let result = conn.run(&request, &self.watchdog, self.cfg.rpc_timeout);
        let keep = result.is_ok() && !conn.is_closed();
        if let Err(e) = &result {
            tracing::debug!(slot = index, kind = %request.kind, error = %e, "evicting connection");
        }
        self.release(index, keep.then_some(conn));
        result
    }

    /// Take an idle connection, or reserve a vacant slot to open one in.
    /// Blocks while every slot is leased.
    fn acquire(&self) -> Result<Lease> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Err(RbError::Stopped);
            }

            if let Some(index) = state
                .slots
                .iter()
                .position(|s| matches!(s, Slot::Idle { .. }))
            {
                let slot = std::mem::replace(&mut state.slots[index], Slot::Leased);
                if let Slot::Idle { conn, .. } = slot {
                    return Ok(Lease {
                        index,
                        conn: Some(conn),
                    });
                }
            }

            if let Some(index) = state.slots.iter().position(|s| matches!(s, Slot::Vacant)) {
                state.slots[index] = Slot::Leased;
                return Ok(Lease { index, conn: None });
            }

            self.freed.wait(&mut state);
        }
    }

    fn release(&self, index: usize, conn: Option<Connection>) {
        let mut state = self.state.lock();
        state.slots[index] = match conn {
            Some(conn) if !state.stopped => Slot::Idle {
                conn,
                last_used: Instant::now(),
            },
            _ => Slot::Vacant,
        };
        self.freed.notify_one();
    }
}

fn reap_loop(shared: &Shared) {
    loop {
        let expired: Vec<(usize, Connection)> = {
            let mut state = shared.state.lock();
            if state.stopped {
                return;
            }
            shared
                .reaper_wake
                .wait_for(&mut state, shared.cfg.reap_interval);
            if state.stopped {
                return;
            }

            let idle_timeout = shared.cfg.idle_timeout;
            let mut expired = Vec::new();
            for (index, slot) in state.slots.iter_mut().enumerate() {
                let stale = matches!(
                    slot,
                    Slot::Idle { last_used, .. } if last_used.elapsed() >= idle_timeout
                );
                if stale {
                    if let Slot::Idle { conn, .. } = std::mem::replace(slot, Slot::Leased) {
                        expired.push((index, conn));
                    }
                }
            }
            expired
        };

        for (index, mut conn) in expired {
            let mut nop = Request::nop().into_final();
            shared.stamp(&mut nop);
            if let Err(e) = conn.run(&nop, &shared.watchdog, shared.cfg.rpc_timeout) {
                tracing::debug!(slot = index, error = %e, "closing NOP failed");
            }
            tracing::debug!(slot = index, peer = %conn.peer(), "reaped idle connection");
            shared.release(index, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Response;
    use crate::protocol_core::read_frame;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Loopback server answering every request with success; counts accepts.
    fn echo_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || serve(stream));
            }
        });
        (addr, accepted)
    }

    fn serve(mut s: TcpStream) {
        while let Ok(frame) = read_frame(&mut s) {
            let req = Request::decode(&frame).unwrap();
            let mut resp = Response::ok(req.kind);
            if req.kind == MsgType::Auth {
                resp.token = Some("t0k3n".into());
            }
            resp.is_final = req.is_final;
            if resp.write_to(&mut s).is_err() || req.is_final {
                break;
            }
        }
    }

    fn cfg(addr: String, size: usize) -> PoolConfig {
        PoolConfig {
            addr,
            size,
            rpc_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn sequential_requests_reuse_one_connection() {
        let (addr, accepted) = echo_server();
        let pool = ConnectionPool::new(cfg(addr, 4)).unwrap();
        for _ in 0..5 {
            pool.run(Request::probe()).unwrap();
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open_connections(), 1);
        pool.shutdown();
    }

    #[test]
    fn concurrency_is_bounded_by_pool_size() {
        let (addr, accepted) = echo_server();
        let pool = Arc::new(ConnectionPool::new(cfg(addr, 2)).unwrap());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        pool.run(Request::nop()).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(accepted.load(Ordering::SeqCst) <= 2);
        assert!(pool.open_connections() <= 2);
    }

    #[test]
    fn final_request_vacates_its_slot() {
        let (addr, _) = echo_server();
        let pool = ConnectionPool::new(cfg(addr, 2)).unwrap();
        pool.run(Request::probe()).unwrap();
        assert_eq!(pool.open_connections(), 1);
        pool.run(Request::nop().into_final()).unwrap();
        assert_eq!(pool.open_connections(), 0);
    }

    #[test]
    fn connect_failure_frees_the_slot() {
        // bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        let pool = ConnectionPool::new(cfg(addr, 1)).unwrap();
        assert!(pool.run(Request::nop()).is_err());
        assert_eq!(pool.open_connections(), 0);
        assert!(pool.run(Request::nop()).is_err());
    }

    #[test]
    fn reaper_retires_idle_connections() {
        let (addr, _) = echo_server();
        let mut c = cfg(addr, 2);
        c.idle_timeout = Duration::from_millis(20);
        c.reap_interval = Duration::from_millis(20);
        let pool = ConnectionPool::new(c).unwrap();
        pool.run(Request::probe()).unwrap();

        let start = Instant::now();
        while pool.open_connections() > 0 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.open_connections(), 0);
        // the pool still works after reaping
        pool.run(Request::probe()).unwrap();
    }

    #[test]
    fn stopped_pool_refuses_work() {
        let (addr, _) = echo_server();
        let pool = ConnectionPool::new(cfg(addr, 1)).unwrap();
        pool.shutdown();
        assert!(matches!(pool.run(Request::nop()), Err(RbError::Stopped)));
    }
}
