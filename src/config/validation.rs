use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is
/// violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is
/// violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_endpoint(config)?;
    validate_chat(config)?;
    validate_watchdogs(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_endpoint(config: &AppConfig) -> Result<(), ConfigError> {
    let endpoint = &config.endpoint;
    if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
        return Err(validation_err(
            "endpoint.url must start with http:// or https://",
        ));
    }
    if url::Url::parse(&endpoint.url).is_err() {
        return Err(validation_err("endpoint.url is not a valid URL"));
    }
    if endpoint.request_timeout_secs == 0 {
        return Err(validation_err(
            "endpoint.request_timeout_secs must be greater than 0",
        ));
    }
    if endpoint.connect_timeout_secs == 0 {
        return Err(validation_err(
            "endpoint.connect_timeout_secs must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_chat(config: &AppConfig) -> Result<(), ConfigError> {
    if config.chat.history_window == 0 {
        return Err(validation_err("chat.history_window must be greater than 0"));
    }
    Ok(())
}

fn validate_watchdogs(config: &AppConfig) -> Result<(), ConfigError> {
    let dogs = &config.watchdogs;
    if dogs.first_token_secs == 0 || dogs.heartbeat_secs == 0 || dogs.guard_fallback_secs == 0 {
        return Err(validation_err(
            "watchdogs grace periods must all be greater than 0",
        ));
    }
    // Tiered semantics: a turn still waiting on the first token gets a looser
    // bound than one already flowing.
    if dogs.first_token_secs < dogs.heartbeat_secs {
        return Err(validation_err(
            "watchdogs.first_token_secs must be at least watchdogs.heartbeat_secs",
        ));
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &[
    "DISABLED", "CRITICAL", "ERROR", "WARNING", "WARN", "INFO", "DEBUG", "TRACE",
];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "log_level '{}' is not one of {VALID_LOG_LEVELS:?}",
            config.log_level
        )));
    }
    Ok(())
}
