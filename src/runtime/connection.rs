//! Connection state machine for a single echo session.
//!
//! Each connection alternates between sending the payload and waiting for
//! the echo until its iterations run out or something goes wrong. The
//! handlers are driven by readiness events and never block: `WouldBlock`
//! leaves the state untouched so the next event resumes where it stopped.

use crate::error::FailReason;
use crate::stats::{average, ConnectionReport, Outcome};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for writability to start the next request.
    WritePending,
    /// Request started but the payload is only partly written.
    Sending {
        /// Bytes of the payload already written.
        written: usize,
    },
    /// Payload sent, waiting for the echo.
    ReadPending {
        /// When the read times out, if a timeout is configured.
        deadline: Option<Instant>,
    },
    /// Every iteration was sent.
    Done,
    /// Ended early.
    Failed(FailReason),
}

impl ConnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Done | ConnState::Failed(_))
    }
}

/// What the event loop has to do after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Keep the current interest.
    Pending,
    /// Request fully written; wait for readability.
    AwaitEcho,
    /// Echo received; wait for writability.
    SendNext,
    /// Terminal state reached; the connection must be finalized.
    Finished,
}

/// A single client connection and its counters.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    local_addr: Option<SocketAddr>,
    iterations_total: u64,
    iterations_remaining: u64,
    requests: u64,
    timeouts: u64,
    rtt_total: Duration,
    rtt_started: Option<Instant>,
    bytes_sent: u64,
    bytes_recv: u64,
}

impl<S> Connection<S> {
    /// Create a new connection waiting to send its first request.
    pub fn new(stream: S, iterations: u64, local_addr: Option<SocketAddr>) -> Self {
        Self {
            stream,
            state: ConnState::WritePending,
            local_addr,
            iterations_total: iterations,
            iterations_remaining: iterations,
            requests: 0,
            timeouts: 0,
            rtt_total: Duration::ZERO,
            rtt_started: None,
            bytes_sent: 0,
            bytes_recv: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    #[cfg(test)]
    pub fn iterations_remaining(&self) -> u64 {
        self.iterations_remaining
    }

    /// Read deadline of the outstanding request, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            ConnState::ReadPending { deadline } => deadline,
            _ => None,
        }
    }

    /// Fail the connection if its echo is overdue at `now`.
    pub fn check_deadline(&mut self, now: Instant) -> Progress {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.fail(FailReason::Timeout),
            _ => Progress::Pending,
        }
    }

    /// The peer shut down its side while we were about to send.
    ///
    /// With no iterations left this is a normal end of the session.
    pub fn on_peer_closed(&mut self) -> Progress {
        match self.state {
            ConnState::WritePending if self.iterations_remaining == 0 => {
                self.state = ConnState::Done;
                Progress::Finished
            }
            ConnState::WritePending => self.fail(FailReason::PeerClosedEarly),
            _ => Progress::Pending,
        }
    }

    /// Fail the connection on an error raised outside the handlers.
    pub fn abort(&mut self, kind: io::ErrorKind) -> Progress {
        if self.state.is_terminal() {
            return Progress::Finished;
        }
        self.fail(FailReason::Socket(kind))
    }

    /// Consume the connection and produce its final report.
    ///
    /// Taking `self` by value makes a second finalize of the same
    /// connection impossible.
    pub fn finalize(self, id: usize) -> (S, ConnectionReport) {
        let outcome = match self.state {
            ConnState::Done => Outcome::Done,
            ConnState::Failed(reason) => Outcome::Failed(reason),
            _ => Outcome::Incomplete,
        };

        let report = ConnectionReport {
            id,
            local_addr: self.local_addr,
            outcome,
            iterations_total: self.iterations_total,
            iterations_remaining: self.iterations_remaining,
            requests: self.requests,
            timeouts: self.timeouts,
            rtt_total: self.rtt_total,
            avg_rtt: average(self.rtt_total, self.requests),
            bytes_sent: self.bytes_sent,
            bytes_recv: self.bytes_recv,
        };

        (self.stream, report)
    }

    fn fail(&mut self, reason: FailReason) -> Progress {
        if reason.is_drop() {
            self.timeouts += 1;
        }
        self.state = ConnState::Failed(reason);
        Progress::Finished
    }

    /// Start the next request, or finish if none are left.
    ///
    /// Returns false when the connection has just moved to `Done`.
    fn begin_request(&mut self, payload_len: usize) -> bool {
        if self.iterations_remaining == 0 {
            self.state = ConnState::Done;
            return false;
        }

        self.iterations_remaining -= 1;
        self.requests += 1;
        self.bytes_sent += payload_len as u64;
        self.rtt_started = Some(Instant::now());
        self.state = ConnState::Sending { written: 0 };
        true
    }
}

impl<S: Write> Connection<S> {
    /// Handle write readiness: start or continue sending the payload.
    pub fn on_writable(&mut self, payload: &[u8], read_timeout: Option<Duration>) -> Progress {
        if self.state == ConnState::WritePending && !self.begin_request(payload.len()) {
            return Progress::Finished;
        }

        let mut written = match self.state {
            ConnState::Sending { written } => written,
            _ => return Progress::Pending,
        };

        while written < payload.len() {
            match self.stream.write(&payload[written..]) {
                Ok(0) => return self.fail(FailReason::Socket(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.state = ConnState::Sending { written };
                    return Progress::Pending;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(FailReason::Socket(e.kind())),
            }
        }

        self.state = ConnState::ReadPending {
            deadline: read_timeout.map(|timeout| Instant::now() + timeout),
        };
        Progress::AwaitEcho
    }
}

impl<S: Read> Connection<S> {
    /// Handle read readiness: receive the echo and stop the RTT timer.
    pub fn on_readable(&mut self, buf: &mut [u8]) -> Progress {
        if !matches!(self.state, ConnState::ReadPending { .. }) {
            return Progress::Pending;
        }

        loop {
            match self.stream.read(buf) {
                Ok(0) => return self.fail(FailReason::PeerClosedEarly),
                Ok(n) => {
                    if let Some(started) = self.rtt_started.take() {
                        self.rtt_total += started.elapsed();
                    }
                    self.bytes_recv += n as u64;
                    self.state = ConnState::WritePending;
                    return Progress::SendNext;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Progress::Pending,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(FailReason::Socket(e.kind())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory stream with scripted read results and a write cap.
    #[derive(Default)]
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        writes: VecDeque<io::Result<usize>>,
        written: Vec<u8>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.writes.pop_front() {
                Some(Ok(cap)) => cap.min(buf.len()),
                Some(Err(e)) => return Err(e),
                None => buf.len(),
            };
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const PAYLOAD: &[u8] = b"ping";

    fn echoing(rounds: usize) -> ScriptedStream {
        let mut stream = ScriptedStream::default();
        for _ in 0..rounds {
            stream.reads.push_back(Ok(PAYLOAD.to_vec()));
        }
        stream
    }

    #[test]
    fn test_full_cycle_reaches_done() {
        let mut conn = Connection::new(echoing(2), 2, None);
        let mut buf = [0u8; 64];

        for _ in 0..2 {
            assert_eq!(conn.on_writable(PAYLOAD, None), Progress::AwaitEcho);
            assert!(matches!(conn.state(), ConnState::ReadPending { .. }));
            assert_eq!(conn.on_readable(&mut buf), Progress::SendNext);
            assert_eq!(conn.state(), ConnState::WritePending);
        }

        assert_eq!(conn.on_writable(PAYLOAD, None), Progress::Finished);
        assert_eq!(conn.state(), ConnState::Done);

        let (stream, report) = conn.finalize(7);
        assert_eq!(stream.written, b"pingping");
        assert_eq!(report.id, 7);
        assert_eq!(report.outcome, Outcome::Done);
        assert_eq!(report.requests, 2);
        assert_eq!(report.completed_iterations(), 2);
        assert_eq!(report.bytes_sent, 8);
        assert_eq!(report.bytes_recv, 8);
        assert_eq!(report.timeouts, 0);
        assert_eq!(report.avg_rtt, average(report.rtt_total, 2));
    }

    #[test]
    fn test_zero_iterations_finishes_immediately() {
        let mut conn = Connection::new(ScriptedStream::default(), 0, None);
        assert_eq!(conn.on_writable(PAYLOAD, None), Progress::Finished);

        let (stream, report) = conn.finalize(0);
        assert!(stream.written.is_empty());
        assert_eq!(report.requests, 0);
        assert_eq!(report.avg_rtt, Duration::ZERO);
    }

    #[test]
    fn test_peer_close_after_first_echo() {
        let mut stream = echoing(1);
        stream.reads.push_back(Ok(Vec::new()));
        let mut conn = Connection::new(stream, 2, None);
        let mut buf = [0u8; 64];

        conn.on_writable(PAYLOAD, None);
        conn.on_readable(&mut buf);
        conn.on_writable(PAYLOAD, None);
        assert_eq!(conn.on_readable(&mut buf), Progress::Finished);
        assert_eq!(
            conn.state(),
            ConnState::Failed(FailReason::PeerClosedEarly)
        );

        let (_, report) = conn.finalize(1);
        assert_eq!(report.outcome, Outcome::Failed(FailReason::PeerClosedEarly));
        assert_eq!(report.requests, 2);
        assert_eq!(report.iterations_remaining, 0);
        assert_eq!(report.bytes_recv, 4);
        assert_eq!(report.timeouts, 0);
    }

    #[test]
    fn test_peer_closed_before_next_request() {
        let mut conn = Connection::new(echoing(1), 2, None);
        let mut buf = [0u8; 64];

        conn.on_writable(PAYLOAD, None);
        conn.on_readable(&mut buf);
        assert_eq!(conn.on_peer_closed(), Progress::Finished);

        let (_, report) = conn.finalize(0);
        assert_eq!(report.outcome, Outcome::Failed(FailReason::PeerClosedEarly));
        assert_eq!(report.requests, 1);
        assert_eq!(report.iterations_remaining, 1);
        assert_eq!(report.bytes_recv, 4);
    }

    #[test]
    fn test_peer_closed_after_last_echo_is_done() {
        let mut conn = Connection::new(echoing(1), 1, None);
        let mut buf = [0u8; 64];

        conn.on_writable(PAYLOAD, None);
        conn.on_readable(&mut buf);
        assert_eq!(conn.on_peer_closed(), Progress::Finished);
        assert_eq!(conn.state(), ConnState::Done);
    }

    #[test]
    fn test_peer_closed_ignored_while_awaiting_echo() {
        let mut conn = Connection::new(ScriptedStream::default(), 2, None);
        conn.on_writable(PAYLOAD, None);
        assert_eq!(conn.on_peer_closed(), Progress::Pending);
        assert!(matches!(conn.state(), ConnState::ReadPending { .. }));
    }

    #[test]
    fn test_abort() {
        let mut conn = Connection::new(ScriptedStream::default(), 2, None);
        assert_eq!(conn.abort(io::ErrorKind::Other), Progress::Finished);
        assert_eq!(conn.state(), ConnState::Failed(FailReason::Socket(io::ErrorKind::Other)));

        let (_, report) = conn.finalize(0);
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.requests, 0);
    }

    #[test]
    fn test_deadline_expiry_is_timeout() {
        let mut conn = Connection::new(ScriptedStream::default(), 3, None);
        let timeout = Duration::from_secs(2);

        assert_eq!(conn.on_writable(PAYLOAD, Some(timeout)), Progress::AwaitEcho);
        let deadline = conn.deadline().unwrap();

        assert_eq!(conn.check_deadline(deadline - Duration::from_millis(1)), Progress::Pending);
        assert_eq!(conn.check_deadline(deadline), Progress::Finished);
        assert_eq!(conn.state(), ConnState::Failed(FailReason::Timeout));

        let (_, report) = conn.finalize(2);
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.requests, 1);
        assert_eq!(report.iterations_remaining, 2);
        assert_eq!(report.bytes_sent, 4);
        assert_eq!(report.bytes_recv, 0);
    }

    #[test]
    fn test_no_deadline_without_timeout() {
        let mut conn = Connection::new(ScriptedStream::default(), 1, None);
        conn.on_writable(PAYLOAD, None);
        assert_eq!(conn.deadline(), None);
        assert_eq!(
            conn.check_deadline(Instant::now() + Duration::from_secs(3600)),
            Progress::Pending
        );
    }

    #[test]
    fn test_partial_write_counts_request_once() {
        let mut stream = ScriptedStream::default();
        stream.writes.push_back(Ok(1));
        stream.writes.push_back(Err(io::ErrorKind::WouldBlock.into()));
        let mut conn = Connection::new(stream, 2, None);

        assert_eq!(conn.on_writable(PAYLOAD, None), Progress::Pending);
        assert_eq!(conn.state(), ConnState::Sending { written: 1 });
        assert_eq!(conn.iterations_remaining(), 1);

        assert_eq!(conn.on_writable(PAYLOAD, None), Progress::AwaitEcho);
        assert_eq!(conn.iterations_remaining(), 1);

        let (stream, report) = conn.finalize(0);
        assert_eq!(stream.written, b"ping");
        assert_eq!(report.requests, 1);
        assert_eq!(report.bytes_sent, 4);
        assert_eq!(report.outcome, Outcome::Incomplete);
    }

    #[test]
    fn test_spurious_read_readiness() {
        let mut conn = Connection::new(ScriptedStream::default(), 1, None);
        let mut buf = [0u8; 8];

        // Not waiting for an echo yet
        assert_eq!(conn.on_readable(&mut buf), Progress::Pending);
        assert_eq!(conn.state(), ConnState::WritePending);

        conn.on_writable(PAYLOAD, None);
        // Nothing to read yet
        assert_eq!(conn.on_readable(&mut buf), Progress::Pending);
        assert!(matches!(conn.state(), ConnState::ReadPending { .. }));
    }

    #[test]
    fn test_socket_error_counts_as_drop() {
        let mut stream = ScriptedStream::default();
        stream
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));
        let mut conn = Connection::new(stream, 4, None);
        let mut buf = [0u8; 8];

        conn.on_writable(PAYLOAD, None);
        assert_eq!(conn.on_readable(&mut buf), Progress::Finished);
        assert_eq!(
            conn.state(),
            ConnState::Failed(FailReason::Socket(io::ErrorKind::ConnectionReset))
        );

        let (_, report) = conn.finalize(0);
        assert_eq!(report.timeouts, 1);
    }

    #[test]
    fn test_write_error_fails_connection() {
        let mut stream = ScriptedStream::default();
        stream.writes.push_back(Err(io::ErrorKind::BrokenPipe.into()));
        let mut conn = Connection::new(stream, 1, None);

        assert_eq!(conn.on_writable(PAYLOAD, None), Progress::Finished);
        assert!(conn.state().is_terminal());
    }

    #[test]
    fn test_counter_invariants_hold_at_every_step() {
        let iterations = 5;
        let mut conn = Connection::new(echoing(3), iterations, None);
        let mut buf = [0u8; 64];

        for _ in 0..3 {
            conn.on_writable(PAYLOAD, Some(Duration::from_secs(1)));
            conn.on_readable(&mut buf);
        }
        conn.on_writable(PAYLOAD, Some(Duration::from_secs(1)));

        let (_, report) = conn.finalize(0);
        assert_eq!(report.requests, iterations - report.iterations_remaining);
        assert_eq!(report.bytes_sent, PAYLOAD.len() as u64 * report.requests);
        assert_eq!(report.avg_rtt, average(report.rtt_total, report.requests));
        assert_eq!(report.outcome, Outcome::Incomplete);
    }
}
