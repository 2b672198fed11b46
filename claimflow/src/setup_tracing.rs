//! Process wide `tracing` setup. The generator runs as a batch job whose output is collected as
//! JSON, `CLAIMFLOW_DEBUG=true` switches to readable text for local runs.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::error;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

const DEBUG_ENV: &str = "CLAIMFLOW_DEBUG";

#[derive(Debug, Clone, Copy, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

/// Output format and default level for the value of `CLAIMFLOW_DEBUG`.
fn log_settings(debug: Option<&str>) -> (LogFormat, LevelFilter) {
    match debug {
        Some(value) if value.trim().eq_ignore_ascii_case("true") => {
            (LogFormat::Text, LevelFilter::DEBUG)
        }
        _ => (LogFormat::Json, LevelFilter::INFO),
    }
}

fn panic_message<'a>(info: &'a PanicHookInfo<'_>) -> &'a str {
    let payload = info.payload();
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Logs a panic as a single event, with the backtrace as a field when one was captured.
fn log_panic(info: &PanicHookInfo<'_>) {
    let location = info
        .location()
        .map(|location| location.to_string())
        .unwrap_or_default();
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        error!(%location, %backtrace, "Panicked: {}", panic_message(info));
    } else {
        error!(%location, "Panicked: {}", panic_message(info));
    }
}

/// Installs the global subscriber and the panic hook. `RUST_LOG` overrides the default level.
pub(crate) fn register() {
    let debug = std::env::var(DEBUG_ENV).ok();
    let (format, level) = log_settings(debug.as_deref());

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let layer = match format {
        LogFormat::Text => fmt::layer().with_target(false).boxed(),
        LogFormat::Json => fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();
    std::panic::set_hook(Box::new(log_panic));
}
