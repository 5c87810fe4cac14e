//! Logging utilities for the purchase runner.
//!
//! Provides structured logging setup shared by the embedding application
//! and the test harness. Noisy library modules (hyper, reqwest, rustls) are
//! set to `warn` level so attempt-by-attempt business logs stay readable.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default noisy modules that should be filtered to warn level.
///
/// These produce high-volume debug/trace output (connection pooling, TLS
/// handshakes) with no business context for a purchase run.
pub const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

/// Build the default EnvFilter with noise suppression.
fn build_filter(log_level: &str) -> EnvFilter {
    // Environment variable wins (allows override)
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{}=warn", module));
    }

    EnvFilter::new(&directives)
}

/// Initialize logging with the given configuration.
///
/// # Arguments
///
/// * `log_level` - Base log level (trace, debug, info, warn, error)
/// * `log_format` - Output format: "json" for structured JSON, "pretty" for human-readable
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = build_filter(log_level);
    let subscriber = tracing_subscriber::registry().with(filter);

    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        // Default to pretty format
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_file(false)
            .with_line_number(false);
        let _ = subscriber.with(fmt_layer).try_init();
    }

    tracing::info!(
        log_level = %log_level,
        log_format = %log_format,
        noise_filtered = NOISY_MODULES.len(),
        "Logging initialized"
    );
}
