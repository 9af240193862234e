//! Process-wide logging setup shared by the hookrelay binaries.

/// Initialize process-wide tracing with the format and filter from the environment.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env(), "info");
}

pub mod tracing;
