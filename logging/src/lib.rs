#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod file;

use anyhow::{Context, Result};
use tracing::subscriber::DefaultGuard;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::ParseError, fmt, layer::SubscriberExt as _,
    registry::LookupSpan, util::SubscriberInitExt as _,
};

/// Registers a global subscriber with stdout logging and `additional_layer`.
pub fn setup_global_subscriber<L>(additional_layer: L) -> Result<()>
where
    L: Layer<Registry> + Send + Sync,
{
    let directives = std::env::var("RUST_LOG").unwrap_or_default();

    let subscriber = Registry::default()
        .with(
            additional_layer
                .with_filter(try_filter(&directives).context("Failed to parse directives")?),
        )
        .with(
            fmt::layer()
                .with_filter(try_filter(&directives).context("Failed to parse directives")?),
        );
    tracing::subscriber::set_global_default(subscriber).context("Could not set global default")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
pub fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    /// A filter directive that silences noisy crates.
    ///
    /// For debugging, it is useful to set a catch-all log like `debug`.
    /// That floods the output with events from `netlink_proto`, `smoltcp` and friends
    /// which are very likely not what you want to see.
    ///
    /// By prepending this directive to the active log filter, a simple directive like
    /// `debug` actually produces useful logs.
    /// If necessary, you can still activate logs from these crates by restating them
    /// in your directive with a lower filter, i.e. `smoltcp=trace`.
    const IRRELEVANT_CRATES: &str = "netlink_proto=warn,smoltcp=warn";

    if directives.is_empty() {
        return EnvFilter::try_new(IRRELEVANT_CRATES);
    }

    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}

pub fn test_global(directives: &str) {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(directives)
            .finish(),
    )
    .ok();
}

pub fn layer<S>() -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
}
