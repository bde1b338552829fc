use crate::config::types::{
    Config, DatabaseConfig, DownloadConfig, HealthConfig, ParseConfig, StorageConfig,
};
use crate::ConfigError;
use regex::RegexBuilder;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_database_config(&config.database)?;
    validate_storage_config(&config.storage)?;
    validate_download_config(&config.download)?;
    validate_parse_config(&config.parse)?;
    validate_health_config(&config.health)?;

    if let Some(name) = &config.instance.name {
        if name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "instance name cannot be blank".to_string(),
            ));
        }
    }

    Ok(())
}

/// Validates database configuration
fn validate_database_config(config: &DatabaseConfig) -> Result<(), ConfigError> {
    if config.path.is_empty() {
        return Err(ConfigError::Validation(
            "database path cannot be empty".to_string(),
        ));
    }

    // The schema becomes a path segment and a URL prefix
    if config.schema.is_empty()
        || !config
            .schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "schema must be a non-empty identifier, got '{}'",
            config.schema
        )));
    }

    Ok(())
}

/// Validates storage configuration
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.root.is_empty() {
        return Err(ConfigError::Validation(
            "storage root cannot be empty".to_string(),
        ));
    }

    if config.volume_threshold == 0 {
        return Err(ConfigError::Validation(
            "volume_threshold must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates fetcher configuration
fn validate_download_config(config: &DownloadConfig) -> Result<(), ConfigError> {
    if config.max_num_conn < 1 || config.max_num_conn > 1000 {
        return Err(ConfigError::Validation(format!(
            "max_num_conn must be between 1 and 1000, got {}",
            config.max_num_conn
        )));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    if config.notification_threshold < 1 {
        return Err(ConfigError::Validation(
            "download notification_threshold must be >= 1".to_string(),
        ));
    }

    match (&config.proxy_host, config.proxy_port) {
        (Some(_), Some(_)) | (None, None) => {}
        _ => {
            return Err(ConfigError::Validation(
                "proxy_host and proxy_port must be given together".to_string(),
            ))
        }
    }

    Ok(())
}

/// Validates parser configuration
fn validate_parse_config(config: &ParseConfig) -> Result<(), ConfigError> {
    compile_check("url_blacklist_rx", &config.url_blacklist_rx)?;
    if let Some(rx) = &config.url_whitelist_rx {
        compile_check("url_whitelist_rx", rx)?;
    }

    if config.max_url_length < 1 {
        return Err(ConfigError::Validation(
            "max_url_length must be >= 1".to_string(),
        ));
    }

    if config.notification_threshold < 1 {
        return Err(ConfigError::Validation(
            "parse notification_threshold must be >= 1".to_string(),
        ));
    }

    validate_marks("cache", config.cache_low_mark, config.cache_high_mark)?;
    validate_marks("novelty", config.novelty_low_mark, config.novelty_high_mark)?;

    Ok(())
}

/// Validates health monitor configuration
fn validate_health_config(config: &HealthConfig) -> Result<(), ConfigError> {
    if config.threshold > 100 {
        return Err(ConfigError::Validation(format!(
            "health threshold is a percentage, got {}",
            config.threshold
        )));
    }

    if config.threshold > 0 && (config.interval < 1 || config.effective_tail() < 1) {
        return Err(ConfigError::Validation(
            "health interval and tail must be >= 1 when checks are enabled".to_string(),
        ));
    }

    Ok(())
}

fn validate_marks(name: &str, low: usize, high: usize) -> Result<(), ConfigError> {
    if low >= high {
        return Err(ConfigError::Validation(format!(
            "{} low mark ({}) must be below high mark ({})",
            name, low, high
        )));
    }
    Ok(())
}

fn compile_check(name: &str, pattern: &str) -> Result<(), ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(|_| ())
        .map_err(|e| ConfigError::Validation(format!("{} does not compile: {}", name, e)))
}
