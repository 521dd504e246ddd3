use crate::adapter::BackendAdapter;
use crate::error::AdapterError;
use crate::record::LogEvent;
use async_trait::async_trait;

/// An adapter that accepts and discards every event.
///
/// Useful for measuring the overhead of the pipeline itself without any
/// backend I/O.
#[derive(Clone, Default)]
pub struct NoopAdapter;

#[async_trait]
impl BackendAdapter for NoopAdapter {
    fn name(&self) -> &str {
        "noop"
    }

    async fn forward(&self, _event: &LogEvent) -> Result<(), AdapterError> {
        Ok(())
    }
}
