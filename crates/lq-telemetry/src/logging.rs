use lq_core::config::GeneralConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging for `service_name` according to `[general]`.
///
/// `RUST_LOG` wins over `log_level` when set. Safe to call more than once
/// (tests, embedded use); later calls are no-ops.
pub fn init_logging(service_name: &str, config: &GeneralConfig) {
    if config.log_json {
        init_logging_json(service_name, &config.log_level);
    } else {
        init_logging_human(service_name, &config.log_level);
    }
}

/// Human-readable output on stderr.
pub fn init_logging_human(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(filter_for(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (human-readable)");
}

/// One JSON object per line on stderr.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(filter_for(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_current_span(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (json)");
}

fn filter_for(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
