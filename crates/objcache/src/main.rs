//! Operator CLI for the object cache.
//!
//! Fetches files and images into the configured caches, and inspects, clears or cleans up those
//! caches.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
