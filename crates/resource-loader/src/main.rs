//! Resource loader.
//!
//! Loads web resources with adaptive concurrency, request merging, retries and a cache, and
//! runs an experiment between concurrency strategies to find the best one for the host.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
