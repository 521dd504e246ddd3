use std::error::Error;
use std::time::Duration;

/// Failure detail returned by a [`BackendAdapter`](crate::adapter::BackendAdapter).
pub type AdapterError = Box<dyn Error + Send + Sync>;

/// Error returned to a producer when an event could not be offered.
///
/// Drops under `DropNewest`/`DropOldest` are not errors: they are counted
/// and reported through [`Offer::Dropped`](crate::queue::Offer::Dropped).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OfferError {
    /// The queue stayed full for the whole `Block` timeout.
    #[error("dispatch queue still full after {0:?}")]
    QueueTimeout(Duration),

    #[error("dispatch queue is closed")]
    Closed,

    #[error(transparent)]
    Invalid(#[from] EventError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("logger name must not be empty")]
    EmptyLoggerName,
}

/// A failed forward, isolated to one adapter by the dispatch loop.
#[derive(thiserror::Error, Debug)]
pub enum AdapterForwardError {
    #[error("adapter {adapter} failed to forward event: {source}")]
    Failed {
        adapter: String,
        #[source]
        source: AdapterError,
    },

    #[error("adapter {adapter} did not complete forward within {timeout:?}")]
    TimedOut { adapter: String, timeout: Duration },

    #[error("adapter {adapter} panicked while forwarding: {message}")]
    Panicked { adapter: String, message: String },
}

impl AdapterForwardError {
    pub fn adapter(&self) -> &str {
        match self {
            AdapterForwardError::Failed { adapter, .. }
            | AdapterForwardError::TimedOut { adapter, .. }
            | AdapterForwardError::Panicked { adapter, .. } => adapter,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("adapter id {0:?} registered twice")]
    DuplicateId(String),

    #[error("adapter id must not be empty")]
    EmptyId,
}

/// Error returned while bringing the pipeline up.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("adapter {adapter} failed to start: {source}")]
    AdapterStart {
        adapter: String,
        #[source]
        source: AdapterError,
    },

    #[error("the log dispatcher is already shut down")]
    ShutDown,

    #[error("a global log dispatcher is already installed")]
    AlreadyInstalled,

    #[error("failed to set global tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}
