//! Public entry point for application code.
//!
//! A [`LogDispatch`] owns the queue, the adapter registry and the dispatch
//! loop task. It is started explicitly with [`LogDispatch::start`] and torn
//! down with [`LogDispatch::shutdown`]; [`install_global`] optionally makes
//! one instance reachable process-wide.

use crate::config::DispatchConfig;
use crate::dispatcher::{dispatching, release, Dispatcher, LoopCounters, LoopStats, DIAGNOSTIC_TARGET};
use crate::error::{InitError, OfferError};
use crate::filter::LevelFilterMap;
use crate::level::Level;
use crate::queue::{DispatchQueue, Offer, QueueStats};
use crate::record::{LogEvent, LogEventBuilder, Throwable};
use crate::registry::{AdapterRegistry, AdapterStats, RegisteredAdapter, SharedRegistry};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;

static GLOBAL: OnceLock<LogDispatch> = OnceLock::new();

/// Make `dispatch` the process-wide instance returned by [`global`].
/// Only the first call succeeds.
pub fn install_global(dispatch: LogDispatch) -> Result<&'static LogDispatch, InitError> {
    let mut installed = false;
    let current = GLOBAL.get_or_init(|| {
        installed = true;
        dispatch
    });
    if installed {
        Ok(current)
    } else {
        Err(InitError::AlreadyInstalled)
    }
}

pub fn global() -> Option<&'static LogDispatch> {
    GLOBAL.get()
}

/// Monitoring snapshot of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub queue: QueueStats,
    pub dispatch: LoopStats,
    pub adapters: Vec<AdapterStats>,
}

/// Outcome of [`LogDispatch::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// `true` if the loop drained the queue before the flush deadline.
    pub drained: bool,
    /// Events still queued at the deadline and thrown away.
    pub discarded: u64,
    pub stats: DispatchStats,
}

struct Inner {
    config: DispatchConfig,
    queue: Arc<DispatchQueue>,
    registry: Arc<SharedRegistry>,
    filters: Arc<LevelFilterMap>,
    counters: Arc<LoopCounters>,
    worker: Mutex<Option<JoinHandle<()>>>,
    loggers: Mutex<HashMap<String, Logger>>,
    shut_down: AtomicBool,
    // Serializes replace_adapters and shutdown.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Handle on a running pipeline. Cheap to clone.
#[derive(Clone)]
pub struct LogDispatch {
    inner: Arc<Inner>,
}

/// Start every adapter of `registry` that is not already running in
/// `running`. If one fails, the ones started so far are released again.
async fn start_adapters(registry: &AdapterRegistry, running: Option<&SharedRegistry>) -> Result<(), InitError> {
    let fresh: Vec<RegisteredAdapter> = registry
        .iter()
        .filter(|e| running.map_or(true, |r| !r.is_running(e.adapter())))
        .cloned()
        .collect();

    dispatching(async {
        for (i, entry) in fresh.iter().enumerate() {
            if let Err(source) = entry.adapter().start().await {
                for started in &fresh[..i] {
                    release(started).await;
                }
                return Err(InitError::AdapterStart {
                    adapter: entry.id().to_string(),
                    source,
                });
            }
        }
        Ok(())
    })
    .await
}

async fn release_all<'a>(entries: impl IntoIterator<Item = &'a RegisteredAdapter>) {
    dispatching(async {
        for entry in entries {
            release(entry).await;
        }
    })
    .await
}

impl LogDispatch {
    /// Validate `config`, start all adapters and spawn the dispatch loop on
    /// the current tokio runtime.
    pub async fn start(config: DispatchConfig, registry: AdapterRegistry) -> Result<Self, InitError> {
        config.validate()?;
        start_adapters(&registry, None).await?;

        let adapters = registry.len();
        let queue = Arc::new(DispatchQueue::from_config(&config));
        let registry = Arc::new(SharedRegistry::new(registry));
        let filters = Arc::new(config.level_filters());
        let counters = Arc::new(LoopCounters::default());

        let worker = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&filters),
            config.forward_timeout(),
            Arc::clone(&counters),
        )
        .spawn();

        tracing::debug!(
            capacity = queue.capacity(),
            policy = ?queue.policy(),
            adapters,
            "log dispatcher started"
        );

        Ok(LogDispatch {
            inner: Arc::new(Inner {
                config,
                queue,
                registry,
                filters,
                counters,
                worker: Mutex::new(Some(worker)),
                loggers: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.inner.queue
    }

    /// Logger for `name`. Repeated calls with the same name return clones
    /// of one cached logger.
    pub fn logger(&self, name: &str) -> Logger {
        let mut loggers = self.inner.loggers.lock();
        if let Some(logger) = loggers.get(name) {
            return logger.clone();
        }
        let logger = Logger {
            name: Arc::from(name),
            base_tags: Arc::new(BTreeMap::new()),
            queue: Arc::clone(&self.inner.queue),
            filters: Arc::clone(&self.inner.filters),
        };
        loggers.insert(name.to_string(), logger.clone());
        logger
    }

    /// Replace the adapter set. New adapters are started before the swap;
    /// adapters that are dropped from the set are flushed and stopped by
    /// the dispatch loop, or by shutdown if the loop does not get to them.
    pub async fn replace_adapters(&self, registry: AdapterRegistry) -> Result<(), InitError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_shut_down() {
            return Err(InitError::ShutDown);
        }
        start_adapters(&registry, Some(&self.inner.registry)).await?;
        let ids = registry.ids().join(",");
        self.inner.registry.swap(registry);
        tracing::debug!(adapters = %ids, "log adapters replaced");
        Ok(())
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            queue: self.inner.queue.stats(),
            dispatch: self.inner.counters.stats(),
            adapters: self.inner.registry.snapshot().stats(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop accepting events, let the loop drain the queue within the
    /// flush deadline, discard what is left, then flush and stop every
    /// adapter. Calling it again only reports the current counters.
    pub async fn shutdown(&self) -> ShutdownReport {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport {
                drained: self.inner.queue.is_empty(),
                discarded: 0,
                stats: self.stats(),
            };
        }

        self.inner.queue.close();
        let worker = self.inner.worker.lock().take();
        let deadline = self.inner.config.flush_deadline();
        let mut drained = true;

        if let Some(mut worker) = worker {
            match tokio::time::timeout(deadline, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    drained = false;
                    tracing::warn!(target: DIAGNOSTIC_TARGET, error = %e, "dispatch loop ended abnormally");
                }
                Err(_) => {
                    drained = false;
                    worker.abort();
                    let _ = worker.await;
                }
            }
        }

        let discarded = self.inner.queue.discard_remaining();
        if discarded > 0 {
            tracing::warn!(
                target: DIAGNOSTIC_TARGET,
                discarded,
                deadline = ?deadline,
                "flush deadline passed, queued log events discarded"
            );
        }

        // Retired adapters the loop did not get to, then the live set.
        release_all(&self.inner.registry.take_retired()).await;
        let live = self.inner.registry.snapshot();
        release_all(live.iter()).await;

        ShutdownReport {
            drained,
            discarded,
            stats: self.stats(),
        }
    }
}

/// A named source of log events.
///
/// Every emitting method makes exactly one enqueue attempt and reports its
/// outcome; backend errors are never seen here.
#[derive(Clone)]
pub struct Logger {
    name: Arc<str>,
    base_tags: Arc<BTreeMap<String, String>>,
    queue: Arc<DispatchQueue>,
    filters: Arc<LevelFilterMap>,
}

macro_rules! level_methods {
    ($($method:ident => $level:expr),* $(,)?) => {
        $(
            pub fn $method(&self, message: impl Into<String>) -> Result<Offer, OfferError> {
                self.at($level).message(message).emit()
            }
        )*
    };
}

impl Logger {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the namespace filter would let `level` through for this
    /// logger. Useful to skip building expensive arguments.
    pub fn is_enabled(&self, level: Level) -> bool {
        self.filters.admits(&self.name, level)
    }

    /// A logger with the same name whose events always carry `key=value`.
    /// The returned logger is not cached.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<String>) -> Logger {
        let mut tags = (*self.base_tags).clone();
        tags.insert(key.into(), value.into());
        Logger {
            name: Arc::clone(&self.name),
            base_tags: Arc::new(tags),
            queue: Arc::clone(&self.queue),
            filters: Arc::clone(&self.filters),
        }
    }

    /// Start building an event at `level`.
    pub fn at(&self, level: Level) -> EventBuilder<'_> {
        let builder = LogEvent::builder(level, &*self.name).tags(
            self.base_tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        EventBuilder { logger: self, builder }
    }

    pub fn log<I, V>(&self, level: Level, message: impl Into<String>, arguments: I) -> Result<Offer, OfferError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.at(level).message(message).args(arguments).emit()
    }

    pub async fn log_async<I, V>(
        &self,
        level: Level,
        message: impl Into<String>,
        arguments: I,
    ) -> Result<Offer, OfferError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.at(level).message(message).args(arguments).emit_async().await
    }

    level_methods! {
        trace => Level::Trace,
        debug => Level::Debug,
        info => Level::Info,
        warn => Level::Warn,
        error => Level::Error,
        fatal => Level::Fatal,
    }
}

/// Event under construction, bound to the [`Logger`] that will emit it.
#[must_use = "events are only queued by `emit` or `emit_async`"]
pub struct EventBuilder<'a> {
    logger: &'a Logger,
    builder: LogEventBuilder,
}

impl<'a> EventBuilder<'a> {
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.builder = self.builder.message(message);
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.builder = self.builder.arg(value);
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.builder = self.builder.args(values);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.builder = self.builder.tag(key, value);
        self
    }

    pub fn error(mut self, err: &(dyn Error + 'static)) -> Self {
        self.builder = self.builder.error(err);
        self
    }

    pub fn throwable(mut self, throwable: Throwable) -> Self {
        self.builder = self.builder.throwable(throwable);
        self
    }

    /// Attach a marker name to the event's classification.
    pub fn classify(mut self, marker: impl Into<String>) -> Self {
        self.builder = self.builder.classify(marker);
        self
    }

    /// Queue the event without awaiting.
    ///
    /// Under the `Block` policy a full queue parks a plain thread for at
    /// most the block timeout. On a multi-thread runtime worker the wait
    /// goes through `block_in_place`. On a current-thread runtime the
    /// dispatch loop could never run while the thread is parked, so a full
    /// queue fails at once with `QueueTimeout(Duration::ZERO)`; use
    /// [`emit_async`](Self::emit_async) there to actually wait.
    pub fn emit(self) -> Result<Offer, OfferError> {
        let event = self.builder.build()?;
        let queue = &self.logger.queue;
        match Handle::try_current().map(|h| h.runtime_flavor()) {
            Ok(RuntimeFlavor::CurrentThread) => queue.try_offer(event),
            Ok(_) => tokio::task::block_in_place(|| queue.offer_blocking(event)),
            Err(_) => queue.offer_blocking(event),
        }
    }

    /// Queue the event from a tokio task, suspending it under the `Block`
    /// policy instead of parking the thread.
    pub async fn emit_async(self) -> Result<Offer, OfferError> {
        let event = self.builder.build()?;
        self.logger.queue.offer(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_adapter::MemoryAdapter;
    use crate::queue::OverloadPolicy;
    use std::time::Duration;

    async fn start(config: DispatchConfig) -> (LogDispatch, MemoryAdapter) {
        let memory = MemoryAdapter::default();
        let registry = AdapterRegistry::builder().register("memory", memory.clone()).build().unwrap();
        (LogDispatch::start(config, registry).await.unwrap(), memory)
    }

    #[tokio::test]
    async fn loggers_are_cached_by_name() {
        let (dispatch, _) = start(DispatchConfig::default()).await;
        let a = dispatch.logger("app");
        let b = dispatch.logger("app");
        assert!(Arc::ptr_eq(&a.name, &b.name));
        assert_eq!(dispatch.inner.loggers.lock().len(), 1);
        dispatch.shutdown().await;
    }

    #[tokio::test]
    async fn level_methods_set_level_and_message() {
        let (dispatch, memory) = start(DispatchConfig::default()).await;
        let logger = dispatch.logger("app::svc");
        logger.trace("t").unwrap();
        logger.info("i").unwrap();
        logger.fatal("f").unwrap();
        dispatch.shutdown().await;

        let seen: Vec<(Level, String)> = memory
            .events()
            .iter()
            .map(|e| (e.level(), e.message().to_string()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (Level::Trace, "t".to_string()),
                (Level::Info, "i".to_string()),
                (Level::Fatal, "f".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn base_tags_and_builder_fields_reach_adapters() {
        let (dispatch, memory) = start(DispatchConfig::default()).await;
        let logger = dispatch.logger("app").with_tag("request_id", "r-7");
        logger
            .at(Level::Warn)
            .message("retry {} of {}")
            .arg(2)
            .arg(5)
            .tag("peer", "db-1")
            .classify("retry")
            .emit_async()
            .await
            .unwrap();
        dispatch.shutdown().await;

        let event = &memory.events()[0];
        assert_eq!(event.formatted_message(), "retry 2 of 5");
        assert_eq!(event.context_tags().len(), 2);
        assert_eq!(event.context_tags()["request_id"], "r-7");
        assert_eq!(event.classification(), &["retry".to_string()]);
    }

    #[tokio::test]
    async fn empty_logger_name_is_rejected_at_emit() {
        let (dispatch, _) = start(DispatchConfig::default()).await;
        let err = dispatch.logger("").info("x").unwrap_err();
        assert!(matches!(err, OfferError::Invalid(_)));
        assert_eq!(dispatch.queue().stats().offered, 0);
        dispatch.shutdown().await;
    }

    #[tokio::test]
    async fn is_enabled_follows_namespace_filter() {
        let config = DispatchConfig::default().with_logger_level("app::db", Level::Warn);
        let (dispatch, _) = start(config).await;
        let logger = dispatch.logger("app::db::pool");
        assert!(!logger.is_enabled(Level::Info));
        assert!(logger.is_enabled(Level::Error));
        dispatch.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = LogDispatch::start(DispatchConfig::default().with_capacity(0), AdapterRegistry::empty()).await;
        assert!(matches!(result, Err(InitError::Config(_))));
    }

    #[tokio::test]
    async fn emits_after_shutdown_report_closed() {
        let config = DispatchConfig::default()
            .with_policy(OverloadPolicy::Block)
            .with_block_timeout(Duration::from_millis(10));
        let (dispatch, _) = start(config).await;
        let logger = dispatch.logger("late");
        let report = dispatch.shutdown().await;
        assert!(report.drained);

        assert_eq!(logger.info("too late"), Err(OfferError::Closed));
        assert!(matches!(
            dispatch.replace_adapters(AdapterRegistry::empty()).await,
            Err(InitError::ShutDown)
        ));
    }
}
