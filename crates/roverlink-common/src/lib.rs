//! Shared utilities for Roverlink: signaling wire types, logging, error types.
//!
//! This crate provides common infrastructure used by the bridge and its tests.

#![forbid(unsafe_code)]

pub mod error;
pub mod helpers;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::*;

/// Initialize tracing with a specific default filter.
///
/// `RUST_LOG` takes precedence when it is set.
pub fn init_tracing_with_default(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
