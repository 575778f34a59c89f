use tracing_subscriber::EnvFilter;

/// Initialize structured logging for the CLI.
///
/// `RUST_LOG` wins when set; otherwise the `--log-level` flag decides.
/// Engine events use structured fields (task ids, pipeline ids), so the
/// target is noise and omitted.
pub fn init(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("alto={log_level},{log_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
