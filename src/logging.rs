//! Tracing initialization for binaries and tests that embed the crate.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Panics if a global subscriber is already set; use [`try_init_tracing`]
/// where that can happen.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt_layer())
        .with(env_filter())
        .init();
}

/// Like [`init_tracing`], but returns false instead of panicking when a
/// subscriber is already installed.
pub fn try_init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(fmt_layer())
        .with(env_filter())
        .try_init()
        .is_ok()
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn fmt_layer<S>() -> tracing_subscriber::fmt::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer().with_target(true)
}
