//! Configuration for stream fan-out
//!
//! Loaded from TOML and overridden by environment variables.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | STREAMS_ACTIVE_USER_GROUPS | - | Comma-separated "always active" groups |
//! | STREAMS_LAST_LOGIN_DAYS | 7 | Recency window for active users |
//! | STREAMS_CONNECTIONS_THRESHOLD | 100 | Max eager recipients per post |
//! | STREAMS_PAGE_SIZE | 20 | Connections loaded per page |
//! | STREAMS_BATCH_SIZE | 20 | Recipient writes per commit |
//! | STREAMS_BATCH_SCOPE | stage | `stage` or `event` |

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How long a commit counter lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchScope {
    /// Fresh counter for every fan-out stage (connections, mentioners, members)
    #[default]
    Stage,
    /// One counter shared by every stage of a lifecycle event
    Event,
}

impl std::str::FromStr for BatchScope {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stage" => Ok(BatchScope::Stage),
            "event" => Ok(BatchScope::Event),
            other => Err(StreamError::Config(format!("unknown batch scope: {}", other))),
        }
    }
}

/// Commit batching policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Recipient writes between two commits (default: 20)
    pub size: usize,
    pub scope: BatchScope,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            size: 20,
            scope: BatchScope::Stage,
        }
    }
}

/// Fan-out configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Groups whose members always count as active
    pub active_user_groups: Vec<String>,
    /// Users who logged in within this many days count as active
    pub last_login_around_days: u32,
    /// Max connections receiving an eager reference for one post
    pub connections_threshold: usize,
    /// Connections loaded per page
    pub page_size: usize,
    pub batch: BatchConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            active_user_groups: Vec::new(),
            last_login_around_days: 7,
            connections_threshold: 100,
            page_size: 20,
            batch: BatchConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Small limits for tests
    pub fn test() -> Self {
        StreamConfig {
            active_user_groups: Vec::new(),
            last_login_around_days: 7,
            connections_threshold: 50,
            page_size: 20,
            batch: BatchConfig::default(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: StreamConfig =
            toml::from_str(raw).map_err(|e| StreamError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StreamError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overridden by `STREAMS_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(groups) = std::env::var("STREAMS_ACTIVE_USER_GROUPS") {
            self.active_user_groups = parse_groups(&groups);
        }
        if let Some(days) = env_number("STREAMS_LAST_LOGIN_DAYS")? {
            self.last_login_around_days = days;
        }
        if let Some(threshold) = env_number("STREAMS_CONNECTIONS_THRESHOLD")? {
            self.connections_threshold = threshold;
        }
        if let Some(page_size) = env_number("STREAMS_PAGE_SIZE")? {
            self.page_size = page_size;
        }
        if let Some(size) = env_number("STREAMS_BATCH_SIZE")? {
            self.batch.size = size;
        }
        if let Ok(scope) = std::env::var("STREAMS_BATCH_SCOPE") {
            self.batch.scope = scope.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(StreamError::Config("page_size must be positive".into()));
        }
        if self.batch.size == 0 {
            return Err(StreamError::Config("batch.size must be positive".into()));
        }
        Ok(())
    }
}

/// Parse "g1, g2,,g3" into trimmed, non-empty group names.
fn parse_groups(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StreamError::Config(format!("{} is not a number: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
