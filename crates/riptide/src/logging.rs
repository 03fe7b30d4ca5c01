use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Log filter override, e.g. `RIPTIDE_LOG=debug` or any full
/// `tracing_subscriber` directive string
const FILTER_ENV: &str = "RIPTIDE_LOG";

/// Installs the process-wide subscriber: INFO by default, overridable via
/// [`FILTER_ENV`]. Targets are omitted since every log line already carries
/// its context as fields (peer address, piece index, tracker URL).
pub fn setup_logger() {
    let filter = EnvFilter::builder()
        .with_env_var(FILTER_ENV)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
