//! Connection spawner.
//!
//! Opens the configured number of connections one at a time on its own
//! thread, so blocking connects never stall the event loop. Every result is
//! handed to the event loop over a channel, followed by a wakeup.

use crate::error::ConnectError;
use mio::Waker;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Message from the spawner to the event loop.
#[derive(Debug)]
pub enum Handoff {
    /// A connected, non-blocking socket ready to be registered.
    Connected {
        attempt: usize,
        stream: mio::net::TcpStream,
        local_addr: Option<SocketAddr>,
    },
    /// A connection attempt that failed. Never retried.
    Failed { attempt: usize, error: ConnectError },
    /// No more connections will arrive.
    Finished,
}

/// Opens connections to the server under test.
pub struct Spawner {
    host: String,
    port: u16,
    count: usize,
    tx: Sender<Handoff>,
    waker: Arc<Waker>,
    shutdown: &'static AtomicBool,
}

impl Spawner {
    pub fn new(
        host: String,
        port: u16,
        count: usize,
        tx: Sender<Handoff>,
        waker: Arc<Waker>,
        shutdown: &'static AtomicBool,
    ) -> Self {
        Self {
            host,
            port,
            count,
            tx,
            waker,
            shutdown,
        }
    }

    /// Run the spawner on a dedicated thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("spawner".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        info!(
            host = %self.host,
            port = self.port,
            connections = self.count,
            "Opening connections"
        );

        for attempt in 0..self.count {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!(attempt, "Shutdown requested, no more connections");
                break;
            }

            let handoff = match connect(&self.host, self.port) {
                Ok(stream) => {
                    let local_addr = stream.local_addr().ok();
                    debug!(attempt, local = ?local_addr, "Connected");
                    Handoff::Connected {
                        attempt,
                        stream: mio::net::TcpStream::from_std(stream),
                        local_addr,
                    }
                }
                Err(error) => {
                    warn!(attempt, error = %error, "Connection dropped, failed to connect to server");
                    Handoff::Failed { attempt, error }
                }
            };

            if !self.hand_off(handoff) {
                return;
            }
        }

        self.hand_off(Handoff::Finished);
    }

    /// Send a message and wake the event loop. Returns false once the
    /// receiving side is gone.
    fn hand_off(&self, handoff: Handoff) -> bool {
        if self.tx.send(handoff).is_err() {
            debug!("Event loop gone, spawner stopping");
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
        true
    }
}

/// Resolve `host:port` and connect to the first address that accepts.
///
/// The connect itself blocks with no timeout; the returned socket is
/// switched to non-blocking mode for the event loop.
pub fn connect(host: &str, port: u16) -> Result<std::net::TcpStream, ConnectError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ConnectError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?;

    let mut last_error = None;
    for addr in addrs {
        match connect_addr(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) => ConnectError::Connect(e),
        None => ConnectError::NoAddress {
            host: host.to_string(),
            port,
        },
    })
}

fn connect_addr(addr: SocketAddr) -> io::Result<std::net::TcpStream> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_nodelay(true)?;
    socket.connect(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}
