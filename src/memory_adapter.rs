use crate::adapter::BackendAdapter;
use crate::error::AdapterError;
use crate::level::Level;
use crate::record::LogEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Keeps every forwarded event in memory.
///
/// Clones share the same storage, so a handle kept by the caller sees what
/// the registered copy receives.
#[derive(Clone)]
pub struct MemoryAdapter {
    name: String,
    minimum_level: Level,
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        MemoryAdapter::new("memory")
    }
}

impl MemoryAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryAdapter {
            name: name.into(),
            minimum_level: Level::Trace,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_minimum_level(mut self, level: Level) -> Self {
        self.minimum_level = level;
        self
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(LogEvent::formatted_message).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl BackendAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_level(&self) -> Level {
        self.minimum_level
    }

    async fn forward(&self, event: &LogEvent) -> Result<(), AdapterError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
