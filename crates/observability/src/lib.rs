//! Process-wide logging setup shared by the binaries.

pub mod tracing;

pub use crate::tracing::{LogFormat, UnknownLogFormat};

/// Initialize logging from `RUST_LOG` and `TENANTFLOW_LOG_FORMAT`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let format = std::env::var("TENANTFLOW_LOG_FORMAT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    crate::tracing::init(format);
}
