use crate::config::DispatchConfig;
use crate::error::InitError;
use crate::facade::{install_global, LogDispatch};
use crate::layer::{target_under, DispatchLayer, DEFAULT_EXCLUDED_TARGETS, SELF_TARGET_PREFIX};
use crate::level::Level;
use crate::registry::AdapterRegistry;
use crate::tracing_adapter::FORWARD_TARGET;
use tracing::Subscriber;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Registry;

/// How [`install_tracing_bridge`] shapes the global subscriber.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Print every `tracing` event to stdout as well.
    pub enable_stdout: bool,
    /// `tracing` events below this level are not bridged.
    pub minimum_level: Level,
    /// Targets (and their submodules) that are never bridged.
    pub excluded_targets: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            enable_stdout: false,
            minimum_level: Level::Trace,
            excluded_targets: DEFAULT_EXCLUDED_TARGETS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl BridgeConfig {
    pub fn with_stdout(mut self, enable: bool) -> Self {
        self.enable_stdout = enable;
        self
    }

    pub fn with_minimum_level(mut self, level: Level) -> Self {
        self.minimum_level = level;
        self
    }

    /// Add `target` to the excluded targets.
    pub fn exclude_target(mut self, target: impl Into<String>) -> Self {
        self.excluded_targets.push(target.into());
        self
    }
}

/// Install a global `tracing` subscriber that feeds every `tracing` event
/// of the process into `dispatch`.
///
/// **Parameters**
/// - `dispatch`: running pipeline that receives the events.
/// - `bridge`: level and target selection of the [`DispatchLayer`], and
///   whether a `tracing_subscriber::fmt` layer prints to stdout next to it.
///
/// This crate's own diagnostics (undeliverable events, failing flush or
/// stop, events discarded at shutdown) are never bridged. With stdout
/// enabled they are printed there; otherwise the ones at `WARN` and above
/// are printed to stderr, so adapter failures are not only visible in the
/// counters.
///
/// **Errors**
///
/// [`InitError::Subscriber`] if a global subscriber is already set.
pub fn install_tracing_bridge(dispatch: &LogDispatch, bridge: BridgeConfig) -> Result<(), InitError> {
    let layer = DispatchLayer::new(dispatch)
        .with_minimum_level(bridge.minimum_level)
        .with_excluded_targets(bridge.excluded_targets);

    let stdout = bridge.enable_stdout.then(tracing_subscriber::fmt::layer);
    let diagnostics = (!bridge.enable_stdout).then(|| fallback_diagnostics(std::io::stderr));

    let subscriber = Registry::default().with(layer).with(stdout).with(diagnostics);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Whether an event belongs on the fallback diagnostic output: this
/// crate's warnings and errors, but not the events the tracing adapter
/// forwards on behalf of applications.
pub(crate) fn is_fallback_diagnostic(target: &str, level: &tracing::Level) -> bool {
    target_under(target, SELF_TARGET_PREFIX) && !target_under(target, FORWARD_TARGET) && *level <= tracing::Level::WARN
}

fn fallback_diagnostics<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_filter(filter_fn(|meta| is_fallback_diagnostic(meta.target(), meta.level())))
}

/// Start a pipeline, bridge `tracing` into it and make it the global
/// [`LogDispatch`].
///
/// This is the recommended entrypoint for typical services. The returned
/// handle is the same instance as [`global`](crate::facade::global); call
/// [`LogDispatch::shutdown`] on it before the runtime exits.
pub async fn init(
    config: DispatchConfig,
    registry: AdapterRegistry,
    enable_stdout: bool,
) -> Result<&'static LogDispatch, InitError> {
    init_with_bridge(config, registry, BridgeConfig::default().with_stdout(enable_stdout)).await
}

/// [`init`] with full control over the `tracing` bridge.
pub async fn init_with_bridge(
    config: DispatchConfig,
    registry: AdapterRegistry,
    bridge: BridgeConfig,
) -> Result<&'static LogDispatch, InitError> {
    let dispatch = LogDispatch::start(config, registry).await?;
    if let Err(e) = install_tracing_bridge(&dispatch, bridge) {
        dispatch.shutdown().await;
        return Err(e);
    }
    install_global(dispatch)
}

/// [`init`] with [`DispatchConfig::default`] and console output enabled.
pub async fn init_default(registry: AdapterRegistry) -> Result<&'static LogDispatch, InitError> {
    init(DispatchConfig::default(), registry, true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DIAGNOSTIC_TARGET;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fallback_keeps_only_own_warnings_and_errors() {
        assert!(is_fallback_diagnostic(DIAGNOSTIC_TARGET, &tracing::Level::WARN));
        assert!(is_fallback_diagnostic(DIAGNOSTIC_TARGET, &tracing::Level::ERROR));
        assert!(is_fallback_diagnostic("tracing_log_dispatch::batch", &tracing::Level::WARN));
        assert!(!is_fallback_diagnostic(DIAGNOSTIC_TARGET, &tracing::Level::DEBUG));
        assert!(!is_fallback_diagnostic(FORWARD_TARGET, &tracing::Level::ERROR));
        assert!(!is_fallback_diagnostic("app::http", &tracing::Level::ERROR));
    }

    #[test]
    fn fallback_layer_prints_adapter_failures() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = Registry::default().with(fallback_diagnostics(move || writer.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: DIAGNOSTIC_TARGET, adapter = "db", "log event not delivered");
            tracing::error!(target: "app", "application error");
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("log event not delivered"), "{}", output);
        assert!(!output.contains("application error"), "{}", output);
    }

    #[test]
    fn bridge_config_defaults_exclude_the_http_stack() {
        let bridge = BridgeConfig::default().exclude_target("vendor_sdk");
        assert!(!bridge.enable_stdout);
        assert_eq!(bridge.minimum_level, Level::Trace);
        assert!(bridge.excluded_targets.iter().any(|t| t == "hyper"));
        assert_eq!(bridge.excluded_targets.last().map(String::as_str), Some("vendor_sdk"));
    }
}
