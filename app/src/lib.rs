//! Tallybook Application Shell
//!
//! Thin shell that wires the storage bootstrap from configuration and exposes
//! the storage commands. Core logic lives in the `crates/` directory.

pub mod commands;
pub mod error;
pub mod state;

pub use error::CommandError;
pub use state::AppState;

/// Initialize tracing subscriber for logging
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tallybook=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
