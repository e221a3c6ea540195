//! Run reporting.
//!
//! The runtime pushes finalized data into a `ReportSink`; formatting and
//! persistence live here. `LogReporter` prints every block and appends it to
//! the run log file.

use crate::error::ConnectError;
use crate::stats::{ConnectionReport, GlobalStats, Outcome};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const RULE: &str = "------------------------------------------------------------------";

/// Consumer of run results.
pub trait ReportSink {
    /// A connection attempt failed and will not be retried.
    fn connect_failed(&mut self, attempt: usize, error: &ConnectError);

    /// A connection was finalized and folded into the totals.
    fn connection_finalized(&mut self, report: &ConnectionReport);

    /// The run is over. Called exactly once.
    fn summary(&mut self, stats: &GlobalStats);
}

/// Prints to stdout and appends to a log file.
pub struct LogReporter {
    log: Option<File>,
}

impl LogReporter {
    /// Open (or create) the log file in append mode and stamp a run header.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut log = OpenOptions::new().create(true).append(true).open(path)?;
        let started = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(log, "{RULE}\nRun started {started}\n{RULE}")?;
        Ok(Self { log: Some(log) })
    }

    /// Reporter that only prints.
    pub fn console() -> Self {
        Self { log: None }
    }

    fn emit(&mut self, block: &str) {
        println!("{block}");
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = writeln!(log, "{block}") {
                warn!(error = %e, "Failed to append to log file, continuing without it");
                self.log = None;
            }
        }
    }
}

impl ReportSink for LogReporter {
    fn connect_failed(&mut self, attempt: usize, error: &ConnectError) {
        self.emit(&format_connect_failure(attempt, error));
    }

    fn connection_finalized(&mut self, report: &ConnectionReport) {
        self.emit(&format_connection(report));
    }

    fn summary(&mut self, stats: &GlobalStats) {
        self.emit(&format_summary(stats));
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.flush() {
                warn!(error = %e, "Failed to flush log file");
            }
        }
    }
}

fn secs(d: Duration) -> String {
    format!("{:.6}s", d.as_secs_f64())
}

fn outcome_label(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Done => "completed".to_string(),
        Outcome::Failed(reason) => reason.to_string(),
        Outcome::Incomplete => "interrupted".to_string(),
    }
}

pub fn format_connect_failure(attempt: usize, error: &ConnectError) -> String {
    format!("Client connection #{attempt} dropped, failed to connect to server: {error}")
}

pub fn format_connection(report: &ConnectionReport) -> String {
    let socket = match report.local_addr {
        Some(addr) => addr.to_string(),
        None => format!("#{}", report.id),
    };

    format!(
        "[Socket {socket}] completed extended echo of {}/{} ({})\n\
         \x20   Total drops = {}\n\
         \x20   Avg RTT = {}\n\
         \x20   Total data sent = {}\n\
         \x20   Total data recv = {}",
        report.completed_iterations(),
        report.iterations_total,
        outcome_label(&report.outcome),
        report.timeouts,
        secs(report.avg_rtt),
        report.bytes_sent,
        report.bytes_recv,
    )
}

pub fn format_summary(stats: &GlobalStats) -> String {
    format!(
        "{RULE}\n\
         Client Connection Summary:\n\
         {RULE}\n\
         \x20   Total connections made = {}\n\
         \x20   Total dropped connections = {}\n\
         \x20   Avg RTT = {}\n\
         \x20   Avg RTT per request = {}\n\
         \x20   Total echo requests = {}\n\
         \x20   Total data sent = {}\n\
         \x20   Total data recv = {}\n\
         \x20   Total runtime = {}\n\
         \x20   Connect failures = {}\n\
         \x20   Peer closed early = {}\n\
         \x20   Incomplete at shutdown = {}\n\
         {RULE}",
        stats.connections_attempted,
        stats.drops(),
        secs(stats.avg_rtt()),
        secs(stats.weighted_avg_rtt()),
        stats.requests,
        stats.bytes_sent,
        stats.bytes_recv,
        secs(stats.elapsed),
        stats.connect_failures,
        stats.peer_closed,
        stats.incomplete,
    )
}

/// Sink that keeps everything it is given.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CollectingSink {
    pub failures: Vec<usize>,
    pub connections: Vec<ConnectionReport>,
    pub summaries: Vec<GlobalStats>,
}

#[cfg(test)]
impl ReportSink for CollectingSink {
    fn connect_failed(&mut self, attempt: usize, _error: &ConnectError) {
        self.failures.push(attempt);
    }

    fn connection_finalized(&mut self, report: &ConnectionReport) {
        self.connections.push(report.clone());
    }

    fn summary(&mut self, stats: &GlobalStats) {
        self.summaries.push(stats.clone());
    }
}
