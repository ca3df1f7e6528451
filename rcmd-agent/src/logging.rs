//! Diagnostic logging setup.

use tracing_subscriber::EnvFilter;

/// Installs a compact `tracing` subscriber writing to stderr.
///
/// Once the slave captured its stdio, stderr is the capture pipe, so log
/// lines reach the master as untagged stderr chunks. Repeated calls are
/// ignored.
pub fn init(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
