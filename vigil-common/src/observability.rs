//! Tracing initialization shared by all vigil binaries.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` and falls back to `info` for everything.
/// Call this exactly once, at the very start of `main`.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| eyre::eyre!("cannot install tracing subscriber: {err}"))
}
