//! Asynchronous log dispatch: loggers hand events to a bounded queue, and a
//! single background task forwards them to every registered backend
//! adapter. Producers never wait on backend I/O.

pub mod level;
pub mod format;
pub mod record;
pub mod error;
pub mod filter;
pub mod config;
pub mod env;
pub mod queue;

pub mod adapter;
pub mod registry;
pub mod dispatcher;
pub mod facade;
pub mod layer;
pub mod init;

pub mod backend;
pub mod batch;
pub mod memory_adapter;
pub mod metric;
pub mod noop_adapter;
pub mod tracing_adapter;
pub mod writer_adapter;

#[cfg(feature = "clickhouse")]
pub mod clickhouse;

pub use adapter::BackendAdapter;
pub use config::DispatchConfig;
pub use error::{AdapterError, AdapterForwardError, ConfigError, InitError, OfferError};
pub use facade::{global, install_global, DispatchStats, EventBuilder, LogDispatch, Logger, ShutdownReport};
pub use init::{init, init_default, init_with_bridge, install_tracing_bridge, BridgeConfig};
pub use level::Level;
pub use metric::{MetricRecord, MetricRecorder, MetricSink};
pub use queue::{DispatchQueue, Offer, OverloadPolicy};
pub use record::{LogEvent, Throwable};
pub use registry::AdapterRegistry;
