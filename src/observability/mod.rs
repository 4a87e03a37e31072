use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber from the configured log level.
///
/// `DISABLED` installs nothing; `WARNING` and `CRITICAL` map to the `warn`
/// and `error` filters; the remaining levels map directly.
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_ascii_uppercase();
    if level == "DISABLED" {
        return;
    }

    let directive = match level.as_str() {
        "WARNING" => "warn",
        "CRITICAL" => "error",
        other => other,
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
