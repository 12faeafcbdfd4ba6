//! Reference pipe-protocol worker.
//!
//! Hosts one of the built-in behaviors over stdin/stdout. Logs go to stderr
//! since stdout carries the protocol.

use std::io::{self, BufWriter};
use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let stdin = io::stdin().lock();
    let stdout = BufWriter::new(io::stdout().lock());
    match lockstep_core::worker::serve(stdin, stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("worker failed: {e}");
            ExitCode::FAILURE
        }
    }
}
