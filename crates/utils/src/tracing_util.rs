//! Shared `tracing-subscriber` bootstrap used by the CLI binary.

/// Install a `fmt` subscriber honoring `RUST_LOG`, falling back to
/// `default_filter` when the environment variable is unset.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    // Only the top-level binary should install a global subscriber; library
    // crates only ever call the `tracing` macros.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
