//! The single consumer of the [`DispatchQueue`].
//!
//! For every event the loop applies the namespace level filter, then
//! forwards it to each registered adapter whose own minimum level admits
//! it. A forward is bounded by a timeout and a panic inside it is caught,
//! so one failing backend cannot stall the loop or starve the others.

use crate::error::AdapterForwardError;
use crate::filter::LevelFilterMap;
use crate::queue::DispatchQueue;
use crate::record::LogEvent;
use crate::registry::{AdapterRegistry, RegisteredAdapter, SharedRegistry};
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Target of the fallback diagnostic channel. The tracing bridge ignores
/// everything under this crate's prefix, so these never re-enter the queue.
pub const DIAGNOSTIC_TARGET: &str = "tracing_log_dispatch::diagnostics";

tokio::task_local! {
    static DISPATCHING: ();
}

/// `true` while the current task is delivering events to adapters or
/// running their lifecycle hooks. Whatever an adapter logs through
/// `tracing` from there must not be fed back into the queue.
pub fn in_dispatch() -> bool {
    DISPATCHING.try_with(|_| ()).is_ok()
}

/// Run `fut` as part of the dispatch path, see [`in_dispatch`].
pub(crate) async fn dispatching<F: Future>(fut: F) -> F::Output {
    DISPATCHING.scope((), fut).await
}

#[derive(Default, Debug)]
pub(crate) struct LoopCounters {
    dispatched: AtomicU64,
    filtered: AtomicU64,
    forward_failures: AtomicU64,
}

/// Counters of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// Events that passed the namespace filter.
    pub dispatched: u64,
    /// Events discarded by the namespace filter.
    pub filtered: u64,
    /// Failed forwards, summed over all adapters.
    pub forward_failures: u64,
}

impl LoopCounters {
    pub(crate) fn stats(&self) -> LoopStats {
        LoopStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct Dispatcher {
    queue: Arc<DispatchQueue>,
    registry: Arc<SharedRegistry>,
    filters: Arc<LevelFilterMap>,
    forward_timeout: Duration,
    counters: Arc<LoopCounters>,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: Arc<DispatchQueue>,
        registry: Arc<SharedRegistry>,
        filters: Arc<LevelFilterMap>,
        forward_timeout: Duration,
        counters: Arc<LoopCounters>,
    ) -> Self {
        Dispatcher {
            queue,
            registry,
            filters,
            forward_timeout,
            counters,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drain the queue until it is closed and empty.
    ///
    /// Adapters swapped out of the registry are released as soon as the
    /// loop sees the swap, even while the queue is idle.
    pub async fn run(self) {
        dispatching(self.drain()).await
    }

    async fn drain(self) {
        loop {
            let next = tokio::select! {
                biased;
                event = self.queue.recv() => event,
                _ = self.registry.retired_signal() => {
                    self.release_retired().await;
                    continue;
                }
            };
            self.release_retired().await;
            let event = match next {
                Some(event) => event,
                None => break,
            };
            let registry = self.registry.snapshot();
            self.dispatch(&registry, &event).await;
        }
        self.release_retired().await;
        tracing::debug!("dispatch queue closed and drained");
    }

    async fn release_retired(&self) {
        while let Some(entry) = self.registry.next_retired() {
            release(&entry).await;
            self.registry.forget_retired(&entry);
        }
    }

    /// Route one event. Returns the number of adapters that accepted it.
    pub async fn dispatch(&self, registry: &AdapterRegistry, event: &LogEvent) -> usize {
        if !self.filters.admits(event.logger_name(), event.level()) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for entry in registry.iter() {
            if !event.level().is_at_least(entry.adapter().minimum_level()) {
                continue;
            }
            match forward_isolated(entry, event, self.forward_timeout).await {
                Ok(()) => {
                    entry.record_forward();
                    delivered += 1;
                }
                Err(err) => {
                    entry.record_failure();
                    self.counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        target: DIAGNOSTIC_TARGET,
                        adapter = err.adapter(),
                        logger = event.logger_name(),
                        error = %err,
                        "log event not delivered"
                    );
                }
            }
        }
        delivered
    }
}

async fn forward_isolated(
    entry: &RegisteredAdapter,
    event: &LogEvent,
    timeout: Duration,
) -> Result<(), AdapterForwardError> {
    let call = AssertUnwindSafe(entry.adapter().forward(event)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(source))) => Err(AdapterForwardError::Failed {
            adapter: entry.id().to_string(),
            source,
        }),
        Ok(Err(panic)) => Err(AdapterForwardError::Panicked {
            adapter: entry.id().to_string(),
            message: panic_message(panic.as_ref()),
        }),
        Err(_) => Err(AdapterForwardError::TimedOut {
            adapter: entry.id().to_string(),
            timeout,
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Flush then stop an adapter, reporting failures on the diagnostic channel.
pub(crate) async fn release(entry: &RegisteredAdapter) {
    let adapter = entry.adapter();
    if let Err(e) = adapter.flush().await {
        tracing::warn!(target: DIAGNOSTIC_TARGET, adapter = entry.id(), error = %e, "adapter flush failed");
    }
    if let Err(e) = adapter.stop().await {
        tracing::warn!(target: DIAGNOSTIC_TARGET, adapter = entry.id(), error = %e, "adapter stop failed");
    }
}
