//! Per-connection results and the global aggregate they fold into.
//!
//! `GlobalStats` is owned by the event loop thread and updated only there:
//! once per connect failure, and once per connection when it is finalized.

use crate::error::FailReason;
use std::net::SocketAddr;
use std::time::Duration;

/// How a connection's echo cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// All configured iterations were sent.
    Done,
    /// Ended early on a timeout, socket error, or peer close.
    Failed(FailReason),
    /// Still open when the run was interrupted.
    Incomplete,
}

/// Snapshot of one connection's counters at the moment it was finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionReport {
    /// Registry identifier the connection held while it was live.
    pub id: usize,
    pub local_addr: Option<SocketAddr>,
    pub outcome: Outcome,
    pub iterations_total: u64,
    pub iterations_remaining: u64,
    pub requests: u64,
    pub timeouts: u64,
    /// Sum of the round-trip times of every echo received.
    pub rtt_total: Duration,
    /// `rtt_total / requests`, zero when no request was sent.
    pub avg_rtt: Duration,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

impl ConnectionReport {
    /// Iterations started on this connection.
    pub fn completed_iterations(&self) -> u64 {
        self.iterations_total - self.iterations_remaining
    }
}

/// Average of `total` over `count` samples, zero for an empty set.
pub fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Run-wide totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalStats {
    pub connections_attempted: u64,
    pub connect_failures: u64,
    /// Connections folded in, whatever their outcome.
    pub connections: u64,
    pub connections_done: u64,
    pub timeouts: u64,
    pub peer_closed: u64,
    pub incomplete: u64,
    /// Sum of each connection's own average RTT.
    pub rtt_avg_sum: Duration,
    /// Sum of every echo's RTT across all connections.
    pub rtt_total: Duration,
    pub requests: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub elapsed: Duration,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self) {
        self.connections_attempted += 1;
    }

    pub fn record_connect_failure(&mut self) {
        self.connect_failures += 1;
    }

    /// Fold a finalized connection into the totals.
    pub fn fold(&mut self, report: &ConnectionReport) {
        self.connections += 1;
        self.timeouts += report.timeouts;
        self.requests += report.requests;
        self.bytes_sent += report.bytes_sent;
        self.bytes_recv += report.bytes_recv;
        self.rtt_avg_sum += report.avg_rtt;
        self.rtt_total += report.rtt_total;

        match report.outcome {
            Outcome::Done => self.connections_done += 1,
            Outcome::Failed(FailReason::PeerClosedEarly) => self.peer_closed += 1,
            Outcome::Failed(_) => {}
            Outcome::Incomplete => self.incomplete += 1,
        }
    }

    /// Connections that never completed their cycle: connect failures plus
    /// timed-out or errored connections.
    pub fn drops(&self) -> u64 {
        self.connect_failures + self.timeouts
    }

    /// Unweighted mean of per-connection averages.
    pub fn avg_rtt(&self) -> Duration {
        average(self.rtt_avg_sum, self.connections)
    }

    /// Mean over every request sent.
    pub fn weighted_avg_rtt(&self) -> Duration {
        average(self.rtt_total, self.requests)
    }
}
