//! Logging setup
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! left to the application. [`init_logging`] is the stock one the demos use.

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`)
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Initialize logging (no-op when the logging feature is disabled)
#[cfg(not(feature = "logging"))]
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    Ok(())
}
