//! Tracing initialization with UNBLOCK_LOG and LOG_FORMAT support.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn build_filter(default_level: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = match std::env::var("UNBLOCK_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("info") => "info",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => default_level,
    };

    EnvFilter::new(format!("{level},unblock={level}"))
}

fn init_with(filter: EnvFilter) {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Install a stderr subscriber for the host process. No-op if one is already set.
pub fn init_tracing() {
    init_with(build_filter("info"));
}

/// Worker-side subscriber. Its stderr ends up in the stderr capture slot, so it
/// defaults to `warn` to keep forwarded logs about the callable, not the worker.
pub(crate) fn init_worker_tracing() {
    init_with(build_filter("warn"));
}
