//! mio event loop driving every echo session.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! connection's state machine performs non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! This thread is the only owner of the registry and of the run totals. New
//! connections arrive from the spawner over a channel; the spawner wakes the
//! poll after each message so handoffs are picked up promptly.

use crate::config::Config;
use crate::error::{ConnectError, FailReason};
use crate::report::ReportSink;
use crate::runtime::connection::{ConnState, Connection, Progress};
use crate::runtime::registry::ConnectionRegistry;
use crate::runtime::spawner::Handoff;
use crate::stats::{GlobalStats, Outcome};
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Receive buffer shared by all connections on this thread.
const READ_BUF_SIZE: usize = 16 * 1024;

const EVENTS_CAPACITY: usize = 1024;

/// Interest while a request is due. Readable too, so a peer close is
/// reported before the next request starts.
const SEND_INTEREST: Interest = Interest::WRITABLE.add(Interest::READABLE);

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stats: GlobalStats,
    /// The run was cut short by a shutdown request.
    pub interrupted: bool,
}

/// Readiness observed for one connection in a poll round.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    id: usize,
    readable: bool,
    writable: bool,
    read_closed: bool,
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    registry: ConnectionRegistry<TcpStream>,
    rx: Receiver<Handoff>,
    stats: GlobalStats,
    payload: Bytes,
    iterations: u64,
    read_timeout: Option<Duration>,
    poll_interval: Duration,
    shutdown: &'static AtomicBool,
    spawner_done: bool,
    read_buf: Vec<u8>,
    ready: Vec<Readiness>,
}

impl Multiplexer {
    /// Create the event loop and the waker the spawner uses to signal it.
    pub fn new(
        config: &Config,
        rx: Receiver<Handoff>,
        shutdown: &'static AtomicBool,
    ) -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let multiplexer = Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registry: ConnectionRegistry::with_capacity(config.connections),
            rx,
            stats: GlobalStats::new(),
            payload: config.payload.clone(),
            iterations: config.iterations,
            read_timeout: config.socket_timeout,
            poll_interval: config.poll_interval,
            shutdown,
            spawner_done: false,
            read_buf: vec![0u8; READ_BUF_SIZE],
            ready: Vec::with_capacity(EVENTS_CAPACITY),
        };

        Ok((multiplexer, waker))
    }

    /// Run until every connection is finalized and the spawner is finished,
    /// or until shutdown is requested.
    ///
    /// `started` marks the beginning of the run for the elapsed-time total.
    pub fn run(mut self, started: Instant, sink: &mut dyn ReportSink) -> io::Result<RunOutcome> {
        let interrupted = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break true;
            }

            self.drain_handoffs(sink);
            if self.spawner_done && self.registry.is_empty() {
                break false;
            }

            let timeout = self.poll_timeout(Instant::now());
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            self.dispatch_events(sink);
            self.expire_deadlines(sink);
        };

        if interrupted {
            info!(
                open = self.registry.len(),
                "Shutdown requested, flushing open connections"
            );
            // Pick up sockets the spawner already connected
            self.drain_handoffs(sink);
        }

        for id in self.registry.ids() {
            self.finalize(id, sink);
        }

        self.stats.elapsed = started.elapsed();
        sink.summary(&self.stats);

        Ok(RunOutcome {
            stats: self.stats,
            interrupted,
        })
    }

    /// Poll wait: the poll interval, shortened to the nearest read deadline.
    fn poll_timeout(&self, now: Instant) -> Duration {
        match self.registry.next_deadline() {
            Some(deadline) => self
                .poll_interval
                .min(deadline.saturating_duration_since(now)),
            None => self.poll_interval,
        }
    }

    fn drain_handoffs(&mut self, sink: &mut dyn ReportSink) {
        loop {
            match self.rx.try_recv() {
                Ok(Handoff::Connected {
                    attempt,
                    stream,
                    local_addr,
                }) => {
                    self.stats.record_attempt();
                    self.register(attempt, stream, local_addr, sink);
                }
                Ok(Handoff::Failed { attempt, error }) => {
                    self.stats.record_attempt();
                    self.stats.record_connect_failure();
                    sink.connect_failed(attempt, &error);
                }
                Ok(Handoff::Finished) => {
                    debug!("Spawner finished");
                    self.spawner_done = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.spawner_done = true;
                    break;
                }
            }
        }
    }

    fn register(
        &mut self,
        attempt: usize,
        mut stream: TcpStream,
        local_addr: Option<SocketAddr>,
        sink: &mut dyn ReportSink,
    ) {
        let id = self.registry.next_id();
        let registered = self
            .poll
            .registry()
            .register(&mut stream, Token(id), SEND_INTEREST);
        if let Err(e) = registered {
            warn!(attempt, error = %e, "Failed to register connection");
            self.stats.record_connect_failure();
            sink.connect_failed(attempt, &ConnectError::Connect(e));
            return;
        }

        let inserted = self
            .registry
            .insert(Connection::new(stream, self.iterations, local_addr));
        debug_assert_eq!(inserted, id);
        trace!(conn = id, attempt, "Registered connection");
    }

    fn dispatch_events(&mut self, sink: &mut dyn ReportSink) {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(
            self.events
                .iter()
                .filter(|event| event.token() != WAKER_TOKEN)
                .map(|event| Readiness {
                    id: event.token().0,
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed() || event.is_error(),
                    read_closed: event.is_read_closed(),
                }),
        );

        for readiness in &ready {
            self.handle_ready(*readiness, sink);
        }

        self.ready = ready;
    }

    fn handle_ready(&mut self, readiness: Readiness, sink: &mut dyn ReportSink) {
        let Readiness {
            id,
            readable,
            writable,
            read_closed,
        } = readiness;

        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };

        let progress = match conn.state() {
            ConnState::WritePending
                if read_closed || (writable && peer_closed(conn.stream_mut())) =>
            {
                conn.on_peer_closed()
            }
            ConnState::WritePending | ConnState::Sending { .. } if writable => {
                conn.on_writable(&self.payload, self.read_timeout)
            }
            ConnState::ReadPending { .. } if readable => conn.on_readable(&mut self.read_buf),
            _ => Progress::Pending,
        };

        self.apply(id, progress, sink);
    }

    fn expire_deadlines(&mut self, sink: &mut dyn ReportSink) {
        let now = Instant::now();
        for id in self.registry.expired(now) {
            if let Some(conn) = self.registry.get_mut(id) {
                let progress = conn.check_deadline(now);
                self.apply(id, progress, sink);
            }
        }
    }

    fn apply(&mut self, id: usize, progress: Progress, sink: &mut dyn ReportSink) {
        let interest = match progress {
            Progress::Pending => return,
            Progress::Finished => return self.finalize(id, sink),
            Progress::AwaitEcho => Interest::READABLE,
            Progress::SendNext => SEND_INTEREST,
        };

        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let switched = self
            .poll
            .registry()
            .reregister(conn.stream_mut(), Token(id), interest);
        if let Err(e) = switched {
            debug!(conn = id, error = %e, "Failed to switch interest");
            conn.abort(e.kind());
            self.finalize(id, sink);
        }
    }

    /// Remove a connection, fold its counters into the totals, and close it.
    fn finalize(&mut self, id: usize, sink: &mut dyn ReportSink) {
        let Some(mut conn) = self.registry.remove(id) else {
            return;
        };
        let _ = self.poll.registry().deregister(conn.stream_mut());
        let (stream, report) = conn.finalize(id);
        drop(stream);

        match report.outcome {
            Outcome::Done => debug!(conn = id, requests = report.requests, "Connection completed"),
            Outcome::Failed(FailReason::Timeout) => {
                warn!(conn = id, local = ?report.local_addr, "Connection has timed out")
            }
            Outcome::Failed(FailReason::PeerClosedEarly) => {
                warn!(conn = id, local = ?report.local_addr, "Server closed connection early")
            }
            Outcome::Failed(reason) => {
                warn!(conn = id, local = ?report.local_addr, %reason, "Connection failed")
            }
            Outcome::Incomplete => debug!(conn = id, "Connection interrupted"),
        }

        self.stats.fold(&report);
        sink.connection_finalized(&report);
    }
}

/// Whether the peer has already sent its FIN. Any other result, including
/// errors, is left to the write path.
fn peer_closed(stream: &mut TcpStream) -> bool {
    let mut byte = [0u8; 1];
    matches!(stream.peek(&mut byte), Ok(0))
}
