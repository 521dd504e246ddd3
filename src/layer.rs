use crate::dispatcher::in_dispatch;
use crate::facade::LogDispatch;
use crate::level::Level;
use crate::queue::DispatchQueue;
use crate::record::{LogEvent, Throwable};
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Events from targets under this prefix are this crate's own diagnostics
/// and are never fed back into the queue.
pub const SELF_TARGET_PREFIX: &str = "tracing_log_dispatch";

/// Targets skipped by default: the HTTP stack networked adapters run on.
/// Its background connection tasks log outside the dispatch scope.
pub const DEFAULT_EXCLUDED_TARGETS: &[&str] = &["hyper", "h2", "reqwest", "rustls", "tower"];

/// `true` if `target` is `prefix` itself or a module below it.
pub(crate) fn target_under(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .map_or(false, |rest| rest.is_empty() || rest.starts_with("::"))
}

/// `tracing_subscriber` layer that turns `tracing` events into
/// [`LogEvent`]s and offers them to a [`DispatchQueue`].
///
/// The event target becomes the logger name, the `message` field the
/// message, an `error` recorded through `record_error` the throwable, and
/// every other field a context tag. The layer never waits: under the
/// `Block` policy a full queue counts as a drop here.
///
/// Events emitted while an adapter runs (see
/// [`in_dispatch`](crate::dispatcher::in_dispatch)), events from this
/// crate's own targets and events from the excluded targets are ignored,
/// so backends logging through `tracing` cannot feed the queue with their
/// own output.
pub struct DispatchLayer {
    queue: Arc<DispatchQueue>,
    minimum_level: Level,
    excluded_targets: Vec<String>,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Successfully enqueued.
    pub enqueued_events: Arc<AtomicU64>,
    /// Not enqueued: dropped by the overload policy or rejected.
    pub dropped_events: Arc<AtomicU64>,
}

impl DispatchLayer {
    pub fn new(dispatch: &LogDispatch) -> Self {
        DispatchLayer::for_queue(Arc::clone(dispatch.queue()))
    }

    pub fn for_queue(queue: Arc<DispatchQueue>) -> Self {
        Self {
            queue,
            minimum_level: Level::Trace,
            excluded_targets: DEFAULT_EXCLUDED_TARGETS.iter().map(|t| t.to_string()).collect(),
            total_events: Arc::new(AtomicU64::new(0)),
            enqueued_events: Arc::new(AtomicU64::new(0)),
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ignore `tracing` events below `level`.
    pub fn with_minimum_level(mut self, level: Level) -> Self {
        self.minimum_level = level;
        self
    }

    /// Replace the excluded targets. Each one also covers its submodules.
    pub fn with_excluded_targets<I, T>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.excluded_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    fn ignores(&self, target: &str) -> bool {
        target_under(target, SELF_TARGET_PREFIX) || self.excluded_targets.iter().any(|t| target_under(target, t))
    }
}

impl<S> Layer<S> for DispatchLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if in_dispatch() || self.ignores(meta.target()) {
            return;
        }
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let level = Level::from(meta.level());
        if !level.is_at_least(self.minimum_level) {
            return;
        }

        let mut fields = BTreeMap::new();
        let mut message: Option<String> = None;
        let mut throwable: Option<Throwable> = None;

        let mut visitor = FieldVisitor {
            fields: &mut fields,
            message: &mut message,
            throwable: &mut throwable,
        };
        event.record(&mut visitor);

        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            fields.insert("location".to_string(), format!("{}:{}", file, line));
        }

        let mut builder = LogEvent::builder(level, meta.target())
            .message(message.unwrap_or_default())
            .tags(fields);
        if let Some(throwable) = throwable {
            builder = builder.throwable(throwable);
        }

        let offered = builder
            .build()
            .map_err(Into::into)
            .and_then(|record| self.queue.try_offer(record));
        match offered {
            Ok(offer) if offer.is_accepted() => {
                self.enqueued_events.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, String>,
    pub message: &'a mut Option<String>,
    pub throwable: &'a mut Option<Throwable>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        if self.throwable.is_none() {
            *self.throwable = Some(Throwable::from_error(value));
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(field.name().to_string(), format!("{:?}", value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OverloadPolicy;
    use std::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    #[derive(Debug, thiserror::Error)]
    #[error("disk full")]
    struct DiskFull;

    fn with_layer<F: FnOnce()>(layer: DispatchLayer, f: F) {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn converts_tracing_events() {
        let queue = Arc::new(DispatchQueue::new(8, OverloadPolicy::DropNewest, Duration::ZERO));
        with_layer(DispatchLayer::for_queue(Arc::clone(&queue)), || {
            let err = DiskFull;
            tracing::warn!(
                target: "app::storage",
                volume = "data",
                free = 0u64,
                error = &err as &(dyn std::error::Error + 'static),
                "write failed"
            );
        });

        let event = queue.try_recv().unwrap();
        assert_eq!(event.level(), Level::Warn);
        assert_eq!(event.logger_name(), "app::storage");
        assert_eq!(event.message(), "write failed");
        assert_eq!(event.context_tags()["volume"], "data");
        assert_eq!(event.context_tags()["free"], "0");
        assert!(event.context_tags().contains_key("location"));
        assert_eq!(event.throwable().map(|t| t.message.as_str()), Some("disk full"));
    }

    #[test]
    fn skips_own_diagnostics_and_low_levels() {
        let queue = Arc::new(DispatchQueue::new(8, OverloadPolicy::DropNewest, Duration::ZERO));
        let layer = DispatchLayer::for_queue(Arc::clone(&queue)).with_minimum_level(Level::Info);
        let total = Arc::clone(&layer.total_events);
        with_layer(layer, || {
            tracing::warn!(target: "tracing_log_dispatch::diagnostics", "adapter failed");
            tracing::debug!(target: "app", "too chatty");
            tracing::info!(target: "app", "kept");
        });

        assert_eq!(total.load(Ordering::Relaxed), 2);
        assert_eq!(queue.try_recv().unwrap().message(), "kept");
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn counts_drops_when_queue_is_full() {
        let queue = Arc::new(DispatchQueue::new(1, OverloadPolicy::DropNewest, Duration::ZERO));
        let layer = DispatchLayer::for_queue(Arc::clone(&queue));
        let (enqueued, dropped) = (Arc::clone(&layer.enqueued_events), Arc::clone(&layer.dropped_events));
        with_layer(layer, || {
            tracing::error!(target: "app", "one");
            tracing::error!(target: "app", "two");
        });

        assert_eq!(enqueued.load(Ordering::Relaxed), 1);
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn skips_excluded_targets_and_their_modules() {
        let queue = Arc::new(DispatchQueue::new(8, OverloadPolicy::DropNewest, Duration::ZERO));
        let layer = DispatchLayer::for_queue(Arc::clone(&queue)).with_excluded_targets(["vendor_sdk"]);
        with_layer(layer, || {
            tracing::info!(target: "vendor_sdk", "root");
            tracing::info!(target: "vendor_sdk::pool", "checkout");
            tracing::info!(target: "vendor_sdk_ext", "kept");
            tracing::info!(target: "hyper::proto", "kept too");
        });

        assert_eq!(queue.try_recv().unwrap().message(), "kept");
        assert_eq!(queue.try_recv().unwrap().message(), "kept too");
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn default_exclusions_cover_the_http_stack() {
        let queue = Arc::new(DispatchQueue::new(8, OverloadPolicy::DropNewest, Duration::ZERO));
        with_layer(DispatchLayer::for_queue(Arc::clone(&queue)), || {
            tracing::debug!(target: "hyper::client::pool", "reuse idle connection");
            tracing::trace!(target: "reqwest::connect", "starting new connection");
        });
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn events_inside_the_dispatch_scope_are_ignored() {
        let queue = Arc::new(DispatchQueue::new(8, OverloadPolicy::DropNewest, Duration::ZERO));
        let subscriber = Registry::default().with(DispatchLayer::for_queue(Arc::clone(&queue)));
        let _guard = tracing::subscriber::set_default(subscriber);

        crate::dispatcher::dispatching(async {
            tracing::info!(target: "app::backend", "written by an adapter");
        })
        .await;
        tracing::info!(target: "app::backend", "written by the application");

        assert_eq!(queue.try_recv().unwrap().message(), "written by the application");
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn target_matching_respects_module_boundaries() {
        assert!(target_under("tracing_log_dispatch", SELF_TARGET_PREFIX));
        assert!(target_under("tracing_log_dispatch::forward", SELF_TARGET_PREFIX));
        assert!(!target_under("tracing_log_dispatcher", SELF_TARGET_PREFIX));
    }
}
