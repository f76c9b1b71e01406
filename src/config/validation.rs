use super::models::{Config, QueueCapacity, SourceConfig};
use crate::humanize::ByteSize;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

const MAX_PAYLOAD_LIMIT: ByteSize = ByteSize::mib(1);

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("queue.max_concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("queue.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("queue.queue_capacity must be at least 1 (or \"unbounded\")")]
    ZeroCapacity,

    #[error("Timeout must be positive: {field}")]
    ZeroTimeout { field: &'static str },

    #[error("max_payload_bytes ({actual}) exceeds limit of 1MB ({limit})")]
    PayloadSizeExceedsLimit { actual: u64, limit: u64 },

    #[error("Source name must not be empty")]
    EmptySourceName,

    #[error("Duplicate source name '{name}'")]
    DuplicateSource { name: String },

    #[error("Source '{name}' has no patterns, hosts or extensions")]
    SourceWithoutMatcher { name: String },

    #[error("Source '{name}' has invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        name: String,
        pattern: String,
        reason: String,
    },

    #[error("compression.target_ratio must be in (0, 1], got {0}")]
    InvalidTargetRatio(f64),

    #[error("cache.ttl_days must be positive")]
    ZeroCacheTtl,

    #[error("Invalid webhook URL '{url}': expected http:// or https://")]
    InvalidWebhookUrl { url: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_queue(config)?;
    validate_payload_size(config)?;
    validate_sources(&config.sources)?;
    validate_compression(config)?;
    validate_cache(config)?;
    validate_notify(config)?;
    Ok(())
}

fn validate_queue(config: &Config) -> Result<(), ValidationError> {
    let queue = &config.queue;
    if queue.max_concurrency == 0 {
        return Err(ValidationError::ZeroConcurrency);
    }
    if queue.max_attempts == 0 {
        return Err(ValidationError::ZeroAttempts);
    }
    if queue.queue_capacity == QueueCapacity::Bounded(0) {
        return Err(ValidationError::ZeroCapacity);
    }

    for (field, value) in [
        ("queue.attempt_timeout", queue.attempt_timeout),
        ("queue.postprocess_timeout", queue.postprocess_timeout),
        ("notify.webhook_timeout", config.notify.webhook_timeout),
    ] {
        if value.is_zero() {
            return Err(ValidationError::ZeroTimeout { field });
        }
    }

    Ok(())
}

/// Transport payloads are tiny JSON bodies
fn validate_payload_size(config: &Config) -> Result<(), ValidationError> {
    let actual = config.server.max_payload_bytes;
    if actual > MAX_PAYLOAD_LIMIT {
        return Err(ValidationError::PayloadSizeExceedsLimit {
            actual: actual.as_u64(),
            limit: MAX_PAYLOAD_LIMIT.as_u64(),
        });
    }
    Ok(())
}

fn validate_sources(sources: &[SourceConfig]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();

    for source in sources {
        if source.name.trim().is_empty() {
            return Err(ValidationError::EmptySourceName);
        }
        if !seen.insert(source.name.as_str()) {
            return Err(ValidationError::DuplicateSource {
                name: source.name.clone(),
            });
        }
        if !source.has_matcher() {
            return Err(ValidationError::SourceWithoutMatcher {
                name: source.name.clone(),
            });
        }
        for pattern in &source.patterns {
            if let Err(e) = Regex::new(pattern) {
                return Err(ValidationError::InvalidPattern {
                    name: source.name.clone(),
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(())
}

fn validate_compression(config: &Config) -> Result<(), ValidationError> {
    let ratio = config.compression.target_ratio;
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(ValidationError::InvalidTargetRatio(ratio));
    }
    Ok(())
}

fn validate_cache(config: &Config) -> Result<(), ValidationError> {
    if config.cache.ttl_days == 0 {
        return Err(ValidationError::ZeroCacheTtl);
    }
    Ok(())
}

fn validate_notify(config: &Config) -> Result<(), ValidationError> {
    if let Some(url) = &config.notify.webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidWebhookUrl { url: url.clone() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use crate::humanize::HumanDuration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.queue.max_concurrency = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroConcurrency)
        ));
    }

    #[test]
    fn test_zero_capacity_rejected_but_unbounded_allowed() {
        let mut config = Config::default();
        config.queue.queue_capacity = QueueCapacity::Bounded(0);
        assert!(matches!(validate(&config), Err(ValidationError::ZeroCapacity)));

        config.queue.queue_capacity = QueueCapacity::Unbounded;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.queue.attempt_timeout = HumanDuration::secs(0);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroTimeout {
                field: "queue.attempt_timeout"
            })
        ));
    }

    #[test]
    fn test_payload_size_limit() {
        let mut config = Config::default();
        config.server.max_payload_bytes = ByteSize::mib(2);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::PayloadSizeExceedsLimit { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_unmatched_sources() {
        let mut config = Config::default();
        let mut a = SourceConfig::new("a", SourceKind::Http);
        a.extensions = vec!["mp4".into()];
        config.sources = vec![a.clone(), a];
        assert!(matches!(
            validate(&config),
            Err(ValidationError::DuplicateSource { .. })
        ));

        config.sources = vec![SourceConfig::new("bare", SourceKind::Http)];
        assert!(matches!(
            validate(&config),
            Err(ValidationError::SourceWithoutMatcher { .. })
        ));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut config = Config::default();
        let mut source = SourceConfig::new("broken", SourceKind::Ytdlp);
        source.patterns = vec!["(unclosed".into()];
        config.sources = vec![source];
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_target_ratio_bounds() {
        let mut config = Config::default();
        config.compression.target_ratio = 0.0;
        assert!(validate(&config).is_err());
        config.compression.target_ratio = 1.0;
        assert!(validate(&config).is_ok());
        config.compression.target_ratio = 1.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_webhook_scheme() {
        let mut config = Config::default();
        config.notify.webhook_url = Some("ftp://bridge".into());
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidWebhookUrl { .. })
        ));
        config.notify.webhook_url = Some("https://bridge.local/events".into());
        assert!(validate(&config).is_ok());
    }
}
