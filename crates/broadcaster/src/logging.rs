//! Tracing/logging bootstrap.
//!
//! Transport adapters log through the `log` facade; those records are bridged
//! into the tracing subscriber installed here.

use std::env;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,broadcaster=debug";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Initialize the global tracing subscriber, writing to stderr.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `BROADCASTER_LOG`
/// 3) internal default filter
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init(format: LogFormat) {
    let env_filter = filter_from_env();

    let fmt_layer = match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_names(true)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .boxed(),
    };

    if tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .is_err()
    {
        return;
    }

    // tracing-subscriber may already have installed the bridge
    let _ = tracing_log::LogTracer::init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(filter) = env::var("BROADCASTER_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
    {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(LogFormat::Pretty);
        init(LogFormat::Json);
        log::debug!("logged through the log facade");
        tracing::debug!("logged through tracing");
    }
}
