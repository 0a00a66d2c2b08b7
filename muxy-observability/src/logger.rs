/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; `default_level` otherwise. Safe to call
/// once from the binary; tests use `try_init` semantics via the
/// returned result being ignored.
pub fn init(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
