//! Connection-management engine.
//!
//! Two threads cooperate:
//! - the spawner opens connections with blocking connects
//! - the multiplexer drives every connected socket through its echo cycle
//!
//! They share nothing but a channel of `Handoff` messages and a waker.

mod connection;
mod multiplexer;
mod registry;
mod spawner;

pub use multiplexer::RunOutcome;

use crate::config::Config;
use crate::report::ReportSink;
use multiplexer::Multiplexer;
use spawner::Spawner;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::time::Instant;
use tracing::{error, info};

/// Run the load test described by `config`, reporting into `sink`.
///
/// Setting `shutdown` stops the run early; open connections are still
/// folded into the summary.
pub fn run(
    config: &Config,
    sink: &mut dyn ReportSink,
    shutdown: &'static AtomicBool,
) -> io::Result<RunOutcome> {
    let (tx, rx) = mpsc::channel();
    let (multiplexer, waker) = Multiplexer::new(config, rx, shutdown)?;

    let started = Instant::now();
    let spawner = Spawner::new(
        config.server_address.clone(),
        config.server_port,
        config.connections,
        tx,
        waker,
        shutdown,
    )
    .spawn()?;

    let outcome = multiplexer.run(started, sink)?;

    // A connect can block indefinitely, so an interrupted run does not wait.
    if !outcome.interrupted && spawner.join().is_err() {
        error!("Spawner thread panicked");
    }

    info!(
        connections = outcome.stats.connections,
        requests = outcome.stats.requests,
        elapsed_ms = u64::try_from(outcome.stats.elapsed.as_millis()).unwrap_or(u64::MAX),
        interrupted = outcome.interrupted,
        "Run finished"
    );

    Ok(outcome)
}
