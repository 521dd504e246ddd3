use crate::error::ConfigError;
use crate::filter::LevelFilterMap;
use crate::level::Level;
use crate::queue::OverloadPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration of the dispatch pipeline.
///
/// **Fields**
/// - `queue_capacity`: maximum number of events waiting for the dispatch
///   loop before the overload policy applies.
/// - `overload_policy`: what a full queue does with a new event.
/// - `block_timeout_millis`: how long a producer waits for space under
///   [`OverloadPolicy::Block`]. Ignored by the drop policies.
/// - `minimum_level_by_logger`: namespace prefix to minimum level, checked
///   by the dispatch loop before any adapter sees the event.
/// - `root_level`: minimum level for loggers matching no prefix.
/// - `flush_deadline_millis`: bound on draining the queue at shutdown.
///   Events still queued afterwards are discarded and counted.
/// - `forward_timeout_millis`: bound on a single adapter `forward` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub overload_policy: OverloadPolicy,
    pub block_timeout_millis: u64,
    pub minimum_level_by_logger: BTreeMap<String, Level>,
    pub root_level: Level,
    pub flush_deadline_millis: u64,
    pub forward_timeout_millis: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overload_policy: OverloadPolicy::DropOldest,
            block_timeout_millis: 100,
            minimum_level_by_logger: BTreeMap::new(),
            root_level: Level::Trace,
            flush_deadline_millis: 5_000,
            forward_timeout_millis: 1_000,
        }
    }
}

impl DispatchConfig {
    /// Parse a TOML document. Missing keys take their default value.
    ///
    /// ```toml
    /// queue_capacity = 4096
    /// overload_policy = "BLOCK"
    /// block_timeout_millis = 50
    ///
    /// [minimum_level_by_logger]
    /// "app::db" = "WARN"
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: DispatchConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.overload_policy == OverloadPolicy::Block && self.block_timeout_millis == 0 {
            return Err(ConfigError::Invalid {
                field: "block_timeout_millis",
                reason: "must be positive under the BLOCK policy".to_string(),
            });
        }
        if self.forward_timeout_millis == 0 {
            return Err(ConfigError::Invalid {
                field: "forward_timeout_millis",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_millis)
    }

    pub fn flush_deadline(&self) -> Duration {
        Duration::from_millis(self.flush_deadline_millis)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_millis)
    }

    pub fn level_filters(&self) -> LevelFilterMap {
        LevelFilterMap::from_map(self.root_level, &self.minimum_level_by_logger)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_policy(mut self, policy: OverloadPolicy) -> Self {
        self.overload_policy = policy;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout_millis = timeout.as_millis() as u64;
        self
    }

    pub fn with_flush_deadline(mut self, deadline: Duration) -> Self {
        self.flush_deadline_millis = deadline.as_millis() as u64;
        self
    }

    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout_millis = timeout.as_millis() as u64;
        self
    }

    pub fn with_logger_level(mut self, prefix: impl Into<String>, level: Level) -> Self {
        self.minimum_level_by_logger.insert(prefix.into(), level);
        self
    }

    pub fn with_root_level(mut self, level: Level) -> Self {
        self.root_level = level;
        self
    }
}
