use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` wins over the `debug` toggle.
pub fn init(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
