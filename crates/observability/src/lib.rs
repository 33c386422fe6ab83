//! Tracing/logging setup shared by the docflow binaries and tests.

/// Initialize process-wide tracing, format chosen by `DOCFLOW_LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&tracing::TracingConfig::from_env());
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LOG_FORMAT_VAR, LogFormat, TracingConfig};
