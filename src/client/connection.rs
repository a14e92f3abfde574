//! One persistent client connection.

use super::deadline::Watchdog;
use crate::error::{RbError, Result};
use crate::messages::{Request, Response};
use crate::protocol_core::tune_socket;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
}

impl Connection {
    /// Resolve `addr` and connect to the first address that answers.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let mut last_err = None;
        for sock in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock, timeout) {
                Ok(stream) => {
                    tune_socket(&stream);
                    tracing::debug!(peer = %sock, "connected");
                    return Ok(Self {
                        stream,
                        peer: sock,
                        closed: false,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                RbError::Timeout(format!("connect to {addr}"))
            }
            Some(e) => RbError::Io(e),
            None => RbError::Config(format!("{addr} did not resolve to any address")),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send one request and read its response within `timeout`.
    ///
    /// The connection is unusable afterwards if the exchange failed at the
    /// transport level or the request was final.
    pub fn run(
        &mut self,
        request: &Request,
        watchdog: &Watchdog,
        timeout: Duration,
    ) -> Result<Response> {
        if self.closed {
            return Err(RbError::ConnectionClosed(format!("connection to {}", self.peer)));
        }

        let deadline = watchdog.arm(&self.stream, timeout)?;
        let result = request
            .write_to(&mut self.stream)
            .and_then(|()| Response::read_from(&mut self.stream));
        let fired = deadline.fired();
        drop(deadline);

        let result = match result {
            Err(e) if fired => {
                tracing::debug!(
                    peer = %self.peer,
                    kind = %request.kind,
                    error = %e,
                    "exchange timed out"
                );
                Err(RbError::Timeout(format!("{} to {}", request.kind, self.peer)))
            }
            other => other,
        };

        if result.as_ref().map_or_else(RbError::is_transport, |_| false) || fired {
            self.closed = true;
        }
        if request.is_final && !self.closed {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.closed = true;
        }
        result
    }
}
