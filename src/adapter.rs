use crate::error::AdapterError;
use crate::level::Level;
use crate::record::LogEvent;
use async_trait::async_trait;

/// Asynchronous destination for [`LogEvent`]s, one per logging backend.
///
/// Implementations translate an event into the backend's native call
/// (the `tracing` façade, a text stream, a database, etc). The dispatch
/// loop owns every call; application code never awaits an adapter.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short name used in diagnostics and statistics.
    fn name(&self) -> &str;

    /// Events below this level are never forwarded to this adapter.
    ///
    /// Default is [`Level::Trace`], i.e. everything.
    fn minimum_level(&self) -> Level {
        Level::Trace
    }

    /// Acquire resources before the first event. Called once, before the
    /// adapter becomes visible to the dispatch loop.
    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Deliver a single event to the backend.
    ///
    /// **Returns**
    /// - `Ok(())` if the backend accepted the event.
    /// - `Err(..)` if it did not. The dispatch loop counts the failure
    ///   against this adapter and carries on with the others; the event is
    ///   not retried.
    ///
    /// The call is bounded by the configured forward timeout. Adapters
    /// doing I/O should use async I/O or hand the event to their own task
    /// (see [`BatchingAdapter`](crate::batch::BatchingAdapter)).
    async fn forward(&self, event: &LogEvent) -> Result<(), AdapterError>;

    /// Flush any buffered events. Default implementation is a no-op.
    async fn flush(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Release resources. Called once, after the last `forward`.
    async fn stop(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
