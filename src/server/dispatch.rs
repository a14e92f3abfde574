//! Accept loop feeding a fixed pool of session workers.
//!
//! One acceptor thread pushes accepted sockets onto a bounded queue; each
//! worker takes a socket and serves its requests one at a time until the
//! peer sends a final request, goes idle, or the socket fails.

use crate::error::{RbError, Result};
use crate::messages::{Request, Response};
use crate::protocol::MsgType;
use crate::protocol_core::{read_frame, tune_socket};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Turns one decoded request into its response. Errors travel inside it.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request, worker: usize) -> Response;
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Accepted sockets waiting for a worker before accept stalls.
    pub backlog: usize,
    pub session_idle: Duration,
}

struct WorkQueue {
    pending: VecDeque<TcpStream>,
    stopped: bool,
}

struct Shared {
    handler: Arc<dyn Handler>,
    cfg: DispatchConfig,
    queue: Mutex<WorkQueue>,
    not_empty: Condvar,
    not_full: Condvar,
    running: AtomicBool,
    sessions: Mutex<HashMap<u64, TcpStream>>,
    next_session: AtomicU64,
}

pub struct Server {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn start(bind: &str, cfg: DispatchConfig, handler: Arc<dyn Handler>) -> Result<Self> {
        let listener = TcpListener::bind(bind)?;
        let local_addr = listener.local_addr()?;
        let workers = cfg.workers.max(1);

        let shared = Arc::new(Shared {
            handler,
            cfg,
            queue: Mutex::new(WorkQueue {
                pending: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            running: AtomicBool::new(true),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let shared = shared.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("rb-worker-{id}"))
                    .spawn(move || worker_loop(id, &shared))?,
            );
        }

        let acceptor = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("rb-acceptor".into())
                .spawn(move || accept_loop(listener, &shared))?
        };

        tracing::info!(addr = %local_addr, workers, "listening");
        Ok(Self {
            shared,
            local_addr,
            acceptor: Some(acceptor),
            workers: handles,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Active sessions, for diagnostics.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Stop accepting, close every session and join all threads.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        {
            let mut queue = self.shared.queue.lock();
            queue.stopped = true;
            queue.pending.clear();
            self.shared.not_empty.notify_all();
            self.shared.not_full.notify_all();
        }

        // accept() only returns on a new connection
        let _ = TcpStream::connect_timeout(&wake_addr(self.local_addr), Duration::from_secs(1));
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        for stream in self.shared.sessions.lock().values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        tracing::info!(addr = %self.local_addr, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

fn accept_loop(listener: TcpListener, shared: &Shared) {
    for conn in listener.incoming() {
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
                thread::sleep(Duration::from_millis(50));
                continue;
            }
        };
        tune_socket(&stream);
        if let Ok(peer) = stream.peer_addr() {
            tracing::debug!(%peer, "connection accepted");
        }

        let mut queue = shared.queue.lock();
        while queue.pending.len() >= shared.cfg.backlog.max(1) && !queue.stopped {
            shared.not_full.wait(&mut queue);
        }
        if queue.stopped {
            break;
        }
        queue.pending.push_back(stream);
        shared.not_empty.notify_one();
    }
}

fn worker_loop(id: usize, shared: &Shared) {
    loop {
        let stream = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.stopped {
                    return;
                }
                if let Some(stream) = queue.pending.pop_front() {
                    shared.not_full.notify_one();
                    break stream;
                }
                shared.not_empty.wait(&mut queue);
            }
        };

        let session = shared.next_session.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(clone) => {
                shared.sessions.lock().insert(session, clone);
            }
            Err(e) => {
                tracing::warn!(worker = id, error = %e, "cannot track session");
            }
        }
        // stop() may have swept the registry before we registered
        if shared.running.load(Ordering::Acquire) {
            serve_session(id, stream, shared);
        }
        shared.sessions.lock().remove(&session);
    }
}

fn serve_session(worker: usize, mut stream: TcpStream, shared: &Shared) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let _ = stream.set_read_timeout(Some(shared.cfg.session_idle));
    let _ = stream.set_write_timeout(Some(shared.cfg.session_idle));

    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(RbError::ConnectionClosed(_)) => {
                tracing::debug!(worker, %peer, "peer closed session");
                break;
            }
            Err(e) => {
                tracing::debug!(worker, %peer, error = %e, "session ended");
                break;
            }
        };

        let is_final = frame.is_final();
        let mut response = match Request::decode(&frame) {
            Ok(request) => shared.handler.handle(request, worker),
            Err(e) => {
                tracing::warn!(worker, %peer, error = %e, "undecodable request");
                let kind = MsgType::from_u8(frame.kind).unwrap_or(MsgType::Nop);
                Response::failure(kind, &e)
            }
        };
        response.is_final = is_final;

        if let Err(e) = response.write_to(&mut stream) {
            tracing::debug!(worker, %peer, error = %e, "response write failed");
            break;
        }
        if is_final {
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}
