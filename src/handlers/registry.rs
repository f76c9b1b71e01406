use regex::Regex;
use reqwest::Url;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::http::DirectHttpHandler;
use super::traits::SourceHandler;
use super::ytdlp::YtDlpHandler;
use crate::config::{SourceConfig, SourceKind};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no handler for source: {0}")]
    NotFound(String),

    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to build handler '{name}': {reason}")]
    Build { name: String, reason: String },
}

/// Predicate deciding whether a handler accepts a source URL
///
/// A matcher accepts a URL when any of its criteria does.
#[derive(Debug, Clone, Default)]
pub struct SourceMatcher {
    any: bool,
    hosts: Vec<String>,
    patterns: Vec<Regex>,
    extensions: Vec<String>,
}

impl SourceMatcher {
    /// Accepts every URL
    pub fn any() -> Self {
        Self {
            any: true,
            ..Self::default()
        }
    }

    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.hosts
            .extend(hosts.into_iter().map(|h| h.as_ref().to_ascii_lowercase()));
        self
    }

    pub fn with_patterns<I, S>(mut self, patterns: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let regex = Regex::new(pattern).map_err(|source| RegistryError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            self.patterns.push(regex);
        }
        Ok(self)
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions.extend(
            extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase()),
        );
        self
    }

    pub fn from_config(source: &SourceConfig) -> Result<Self, RegistryError> {
        Ok(Self::default()
            .with_hosts(&source.hosts)
            .with_extensions(&source.extensions)
            .with_patterns(&source.patterns)?)
    }

    pub fn matches(&self, source_url: &str) -> bool {
        if self.any || self.patterns.iter().any(|re| re.is_match(source_url)) {
            return true;
        }
        if self.hosts.is_empty() && self.extensions.is_empty() {
            return false;
        }

        let Ok(url) = Url::parse(source_url) else {
            return false;
        };

        if let Some(host) = url.host_str() {
            let host = host.to_ascii_lowercase();
            let host_match = self.hosts.iter().any(|h| {
                host == *h
                    || host
                        .strip_suffix(h.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            });
            if host_match {
                return true;
            }
        }

        url.path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|last| last.rsplit_once('.'))
            .is_some_and(|(_, ext)| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
    }
}

struct RegistryEntry {
    matcher: SourceMatcher,
    handler: Arc<dyn SourceHandler>,
}

/// Ordered list of (matcher, handler) pairs
///
/// Resolution is first-match: when several matchers accept a URL, the entry
/// registered earliest wins. The registry is built at startup and only read
/// afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<RegistryEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; it takes precedence over entries registered later
    pub fn register(&mut self, matcher: SourceMatcher, handler: Arc<dyn SourceHandler>) {
        self.entries.push(RegistryEntry { matcher, handler });
    }

    pub fn resolve(&self, source_url: &str) -> Result<Arc<dyn SourceHandler>, RegistryError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.matcher.matches(source_url))
            .ok_or_else(|| RegistryError::NotFound(source_url.to_string()))?;

        debug!(
            source_url,
            handler = entry.handler.name(),
            "Resolved source handler"
        );
        Ok(Arc::clone(&entry.handler))
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.handler.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build handlers for each configured source, in order
    pub fn from_sources(sources: &[SourceConfig]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();

        for source in sources {
            let matcher = SourceMatcher::from_config(source)?;
            let handler: Arc<dyn SourceHandler> = match source.kind {
                SourceKind::Http => Arc::new(DirectHttpHandler::from_config(source).map_err(
                    |e| RegistryError::Build {
                        name: source.name.clone(),
                        reason: e.to_string(),
                    },
                )?),
                SourceKind::Ytdlp => Arc::new(YtDlpHandler::from_config(source)),
            };
            registry.register(matcher, handler);
        }

        Ok(registry)
    }

    /// Create registry with the built-in sources
    pub fn with_defaults() -> Result<Self, RegistryError> {
        Self::from_sources(&SourceConfig::builtin())
    }
}
