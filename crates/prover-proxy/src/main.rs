//! Prover proxy.
//!
//! A JSON-RPC front for an expensive prover running on a cloud instance. Proofs are stored on
//! disk, concurrent requests for the same trace share one computation, and the prover instance
//! is started on demand and stopped again once no work is left.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
