use crate::adapter::BackendAdapter;
use crate::error::AdapterError;
use crate::level::Level;
use crate::record::LogEvent;
use async_trait::async_trait;

/// Target of every event re-emitted by [`TracingAdapter`]. It lives under
/// this crate's prefix, so [`DispatchLayer`](crate::layer::DispatchLayer)
/// never feeds it back into the pipeline.
pub const FORWARD_TARGET: &str = "tracing_log_dispatch::forward";

macro_rules! forward_at {
    ($lvl:expr, $event:expr, $message:expr, $tags:expr, $error:expr) => {
        tracing::event!(
            target: FORWARD_TARGET,
            $lvl,
            logger = $event.logger_name(),
            severity = $event.level().as_str(),
            tags = $tags.as_str(),
            error = $error,
            "{}",
            $message
        )
    };
}

/// Re-emits events into `tracing`, so whatever subscriber the host has
/// installed (fmt, json, OpenTelemetry...) becomes a backend.
///
/// `FATAL` has no `tracing` equivalent and is emitted at `ERROR`; the
/// original level is kept in the `severity` field.
#[derive(Clone, Debug)]
pub struct TracingAdapter {
    minimum_level: Level,
}

impl Default for TracingAdapter {
    fn default() -> Self {
        TracingAdapter {
            minimum_level: Level::Trace,
        }
    }
}

impl TracingAdapter {
    pub fn new(minimum_level: Level) -> Self {
        TracingAdapter { minimum_level }
    }
}

#[async_trait]
impl BackendAdapter for TracingAdapter {
    fn name(&self) -> &str {
        "tracing"
    }

    fn minimum_level(&self) -> Level {
        self.minimum_level
    }

    async fn forward(&self, event: &LogEvent) -> Result<(), AdapterError> {
        let message = event.formatted_message();
        let tags = event
            .context_tags()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let error = event.throwable().map(|t| t.to_string());
        let error = error.as_deref();

        match event.level() {
            Level::Trace => forward_at!(tracing::Level::TRACE, event, message, tags, error),
            Level::Debug => forward_at!(tracing::Level::DEBUG, event, message, tags, error),
            Level::Info => forward_at!(tracing::Level::INFO, event, message, tags, error),
            Level::Warn => forward_at!(tracing::Level::WARN, event, message, tags, error),
            Level::Error | Level::Fatal => {
                forward_at!(tracing::Level::ERROR, event, message, tags, error)
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    type Captured = Arc<Mutex<Vec<(tracing::Level, String, BTreeMap<String, String>)>>>;

    struct Capture(Captured);

    struct Fields<'a>(&'a mut BTreeMap<String, String>);

    impl Visit for Fields<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{:?}", value));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut fields = BTreeMap::new();
            event.record(&mut Fields(&mut fields));
            let meta = event.metadata();
            self.0.lock().push((*meta.level(), meta.target().to_string(), fields));
        }
    }

    #[test]
    fn reemits_under_its_own_target() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(Capture(Arc::clone(&captured)));
        let event = LogEvent::builder(Level::Fatal, "app::core")
            .message("shutting down: {}")
            .arg("disk full")
            .tag("node", "n1")
            .build()
            .unwrap();

        tracing::subscriber::with_default(subscriber, || {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(TracingAdapter::default().forward(&event)).unwrap();
        });

        let captured = captured.lock();
        assert_eq!(captured.len(), 1);
        let (level, target, fields) = &captured[0];
        assert_eq!(*level, tracing::Level::ERROR);
        assert_eq!(target, FORWARD_TARGET);
        assert_eq!(fields["message"], "shutting down: disk full");
        assert_eq!(fields["logger"], "app::core");
        assert_eq!(fields["severity"], "FATAL");
        assert_eq!(fields["tags"], "node=n1");
    }
}
