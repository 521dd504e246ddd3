//! Immutable adapter registry and its atomically swapped holder.

use crate::adapter::BackendAdapter;
use crate::error::RegistryError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default, Debug)]
struct AdapterCounters {
    forwarded: AtomicU64,
    failures: AtomicU64,
}

/// Per-adapter delivery counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub id: String,
    pub name: String,
    pub forwarded: u64,
    pub failures: u64,
}

/// An adapter together with the id it was registered under.
#[derive(Clone)]
pub struct RegisteredAdapter {
    id: String,
    adapter: Arc<dyn BackendAdapter>,
    counters: Arc<AdapterCounters>,
}

impl RegisteredAdapter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    pub fn forwarded(&self) -> u64 {
        self.counters.forwarded.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_forward(&self) {
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            id: self.id.clone(),
            name: self.adapter.name().to_string(),
            forwarded: self.forwarded(),
            failures: self.failures(),
        }
    }
}

/// Mapping from backend id to adapter, in registration order.
///
/// A registry never changes after [`AdapterRegistryBuilder::build`];
/// reconfiguration builds a new one and swaps it into a [`SharedRegistry`].
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    entries: Vec<RegisteredAdapter>,
}

impl AdapterRegistry {
    pub fn builder() -> AdapterRegistryBuilder {
        AdapterRegistryBuilder::default()
    }

    pub fn empty() -> Self {
        AdapterRegistry::default()
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredAdapter> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredAdapter> {
        self.entries.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> Vec<AdapterStats> {
        self.entries.iter().map(RegisteredAdapter::stats).collect()
    }

    /// Take over the counters of entries from `previous` that are kept
    /// under the same id with the same adapter instance.
    pub(crate) fn inherit_counters(mut self, previous: &AdapterRegistry) -> Self {
        for entry in &mut self.entries {
            if let Some(old) = previous.get(&entry.id) {
                if Arc::ptr_eq(&old.adapter, &entry.adapter) {
                    entry.counters = Arc::clone(&old.counters);
                }
            }
        }
        self
    }

    /// `true` if this exact adapter instance is registered, under any id.
    pub(crate) fn holds(&self, adapter: &Arc<dyn BackendAdapter>) -> bool {
        self.entries.iter().any(|e| Arc::ptr_eq(&e.adapter, adapter))
    }

    /// Entries of `self` whose adapter instance is not part of `next`.
    pub(crate) fn retired_by<'a>(&'a self, next: &'a AdapterRegistry) -> impl Iterator<Item = &'a RegisteredAdapter> {
        self.entries.iter().filter(move |old| !next.holds(&old.adapter))
    }
}

#[derive(Default)]
pub struct AdapterRegistryBuilder {
    entries: Vec<(String, Arc<dyn BackendAdapter>)>,
}

impl AdapterRegistryBuilder {
    pub fn register<A>(self, id: impl Into<String>, adapter: A) -> Self
    where
        A: BackendAdapter + 'static,
    {
        self.register_shared(id, Arc::new(adapter))
    }

    pub fn register_shared(mut self, id: impl Into<String>, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.entries.push((id.into(), adapter));
        self
    }

    pub fn build(self) -> Result<AdapterRegistry, RegistryError> {
        let mut entries: Vec<RegisteredAdapter> = Vec::with_capacity(self.entries.len());
        for (id, adapter) in self.entries {
            if id.is_empty() {
                return Err(RegistryError::EmptyId);
            }
            if entries.iter().any(|e| e.id == id) {
                return Err(RegistryError::DuplicateId(id));
            }
            entries.push(RegisteredAdapter {
                id,
                adapter,
                counters: Arc::new(AdapterCounters::default()),
            });
        }
        Ok(AdapterRegistry { entries })
    }
}

/// Holder of the current registry snapshot.
///
/// Readers clone the `Arc` and keep using that snapshot for as long as
/// they need it; [`swap`](SharedRegistry::swap) replaces it as a whole.
/// Adapters a swap drops are parked on a retired list until the dispatch
/// loop (or shutdown) takes them, so every snapshot's leftovers get
/// released exactly once, however many swaps happen in between.
pub struct SharedRegistry {
    current: RwLock<Arc<AdapterRegistry>>,
    retired: Mutex<Vec<RegisteredAdapter>>,
    retired_signal: Notify,
}

impl SharedRegistry {
    pub fn new(registry: AdapterRegistry) -> Self {
        SharedRegistry {
            current: RwLock::new(Arc::new(registry)),
            retired: Mutex::new(Vec::new()),
            retired_signal: Notify::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<AdapterRegistry> {
        Arc::clone(&self.current.read())
    }

    /// Install `next` and return the snapshot it replaced.
    pub fn swap(&self, next: AdapterRegistry) -> Arc<AdapterRegistry> {
        let mut current = self.current.write();
        let next = next.inherit_counters(&current);
        {
            let mut retired = self.retired.lock();
            // Re-registered before it was released: it simply stays live.
            retired.retain(|entry| !next.holds(entry.adapter()));
            retired.extend(current.retired_by(&next).cloned());
        }
        let old = std::mem::replace(&mut *current, Arc::new(next));
        drop(current);
        self.retired_signal.notify_one();
        old
    }

    /// `true` if `adapter` is live or retired but not yet released, i.e.
    /// it was started and must not be started again.
    pub(crate) fn is_running(&self, adapter: &Arc<dyn BackendAdapter>) -> bool {
        self.snapshot().holds(adapter) || self.retired.lock().iter().any(|e| Arc::ptr_eq(e.adapter(), adapter))
    }

    /// Oldest retired adapter not yet released. It stays listed until
    /// [`forget_retired`](SharedRegistry::forget_retired), so a release cut
    /// short is picked up again at shutdown.
    pub(crate) fn next_retired(&self) -> Option<RegisteredAdapter> {
        self.retired.lock().first().cloned()
    }

    pub(crate) fn forget_retired(&self, entry: &RegisteredAdapter) {
        self.retired.lock().retain(|e| !Arc::ptr_eq(e.adapter(), entry.adapter()));
    }

    /// Hand over every adapter retired and not yet released.
    pub(crate) fn take_retired(&self) -> Vec<RegisteredAdapter> {
        std::mem::take(&mut *self.retired.lock())
    }

    /// Resolves after the next [`swap`](SharedRegistry::swap).
    pub(crate) async fn retired_signal(&self) {
        self.retired_signal.notified().await
    }
}
