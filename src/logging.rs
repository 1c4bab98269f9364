//! # Structured Logging Module
//!
//! Environment-aware structured logging for the broker and the outbox worker.
//! Output goes to stdout, as JSON when `COURIER_LOG_FORMAT=json`.

use crate::config::ConfigManager;
use crate::constants::environments;
use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once; later calls are no-ops
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(&environment)));

        let json = std::env::var("COURIER_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(filter)
                .boxed()
        };

        // A subscriber may already be installed by the host application
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Tracing subscriber already installed, keeping it");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Default filter directive when `RUST_LOG` is unset
fn default_directive(environment: &str) -> &'static str {
    match environment {
        environments::PRODUCTION => "info",
        _ => "debug",
    }
}

/// Outbox lifecycle event at info level
pub fn log_outbox_operation(
    operation: &str,
    item_id: Option<&str>,
    envelope_type: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        item_id = item_id,
        envelope_type = envelope_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 OUTBOX_OPERATION"
    );
}

/// Publish summary at debug level; one per publish call
pub fn log_broker_operation(
    operation: &str,
    envelope_type: &str,
    handler_count: usize,
    status: &str,
    details: Option<&str>,
) {
    tracing::debug!(
        operation = %operation,
        envelope_type = %envelope_type,
        handler_count = handler_count,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📨 BROKER_OPERATION"
    );
}

/// Error that was handled without stopping the caller
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
