//! Tracing/logging setup shared by the service binaries.

pub mod logging;

pub use logging::{LogConfig, LogFormat, UnknownLogFormat};

/// Initialize process-wide logging with defaults (JSON, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    logging::init(&LogConfig::default());
}
