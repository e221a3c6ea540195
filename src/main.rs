//! echo-stress: a multiplexed TCP echo load generator
//!
//! Opens many concurrent connections to an echo server and drives each one
//! through a fixed number of request/echo round trips, then reports:
//! - Per-connection iterations, drops, average RTT and bytes moved
//! - Run-wide totals, average RTT and runtime
//!
//! Configuration via CLI arguments or a key=value / TOML file.

mod config;
mod error;
mod report;
mod runtime;
mod stats;

use config::Config;
use report::LogReporter;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Process-wide shutdown flag. Set by the SIGINT/SIGTERM handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        server = %format!("{}:{}", config.server_address, config.server_port),
        connections = config.connections,
        iterations = config.iterations,
        payload_len = config.payload.len(),
        socket_timeout = ?config.socket_timeout,
        "Starting echo-stress"
    );

    install_signal_handlers();

    let mut reporter = match LogReporter::open(&config.log_path) {
        Ok(reporter) => reporter,
        Err(e) => {
            warn!(path = %config.log_path.display(), error = %e, "Cannot open log file, reporting to console only");
            LogReporter::console()
        }
    };

    println!("Starting connections to server. Currently running...");
    let outcome = runtime::run(&config, &mut reporter, &SHUTDOWN)?;

    if outcome.interrupted {
        println!("Client Shutdown");
    }

    Ok(())
}
