use crate::error::EventError;
use crate::format::format_message;
use crate::level::Level;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

thread_local! {
    static LAST_TIMESTAMP: Cell<Option<DateTime<Utc>>> = const { Cell::new(None) };
}

/// Current time, clamped so that it never goes backwards on this thread
/// even if the wall clock is stepped back.
fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now();
    LAST_TIMESTAMP.with(|last| {
        let ts = match last.get() {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        last.set(Some(ts));
        ts
    })
}

/// Captured error context: the error's own message, its `source()` chain
/// and an optional backtrace rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Throwable {
    pub message: String,
    pub causes: Vec<String>,
    pub backtrace: Option<String>,
}

impl Throwable {
    pub fn new(message: impl Into<String>) -> Self {
        Throwable {
            message: message.into(),
            causes: Vec::new(),
            backtrace: None,
        }
    }

    /// Capture an error and walk its `source()` chain.
    pub fn from_error(err: &(dyn Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Throwable {
            message: err.to_string(),
            causes,
            backtrace: None,
        }
    }

    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = Some(backtrace.into());
        self
    }
}

impl fmt::Display for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(bt) = &self.backtrace {
            write!(f, "\n{}", bt.trim_end())?;
        }
        for cause in &self.causes {
            write!(f, "\nCaused by: {}", cause)?;
        }
        Ok(())
    }
}

/// One log occurrence.
///
/// A `LogEvent` is immutable once built: all fields are private and
/// adapters only ever see `&LogEvent`.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    timestamp: DateTime<Utc>,
    level: Level,
    logger_name: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    arguments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    throwable: Option<Throwable>,
    context_tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    classification: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread: Option<String>,
}

impl LogEvent {
    pub fn builder(level: Level, logger_name: impl Into<String>) -> LogEventBuilder {
        LogEventBuilder::new(level, logger_name)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn logger_name(&self) -> &str {
        &self.logger_name
    }

    /// The raw message template.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    pub fn throwable(&self) -> Option<&Throwable> {
        self.throwable.as_ref()
    }

    pub fn context_tags(&self) -> &BTreeMap<String, String> {
        &self.context_tags
    }

    pub fn classification(&self) -> &[String] {
        &self.classification
    }

    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }

    /// Message with `{}` placeholders replaced by the arguments.
    pub fn formatted_message(&self) -> String {
        format_message(&self.message, &self.arguments)
    }
}

/// Builder for [`LogEvent`]. The timestamp is taken when
/// [`build`](LogEventBuilder::build) runs.
#[derive(Debug, Clone)]
pub struct LogEventBuilder {
    level: Level,
    logger_name: String,
    message: String,
    arguments: Vec<Value>,
    throwable: Option<Throwable>,
    context_tags: BTreeMap<String, String>,
    classification: Vec<String>,
}

impl LogEventBuilder {
    pub fn new(level: Level, logger_name: impl Into<String>) -> Self {
        LogEventBuilder {
            level,
            logger_name: logger_name.into(),
            message: String::new(),
            arguments: Vec::new(),
            throwable: None,
            context_tags: BTreeMap::new(),
            classification: Vec::new(),
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.arguments.push(value.into());
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.arguments.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn throwable(mut self, throwable: Throwable) -> Self {
        self.throwable = Some(throwable);
        self
    }

    pub fn error(self, err: &(dyn Error + 'static)) -> Self {
        self.throwable(Throwable::from_error(err))
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_tags.insert(key.into(), value.into());
        self
    }

    pub fn tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.context_tags
            .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn classify(mut self, marker: impl Into<String>) -> Self {
        self.classification.push(marker.into());
        self
    }

    /// Freeze the event. Fails if the logger name is empty.
    pub fn build(self) -> Result<LogEvent, EventError> {
        if self.logger_name.trim().is_empty() {
            return Err(EventError::EmptyLoggerName);
        }

        Ok(LogEvent {
            timestamp: monotonic_now(),
            level: self.level,
            logger_name: self.logger_name,
            message: self.message,
            arguments: self.arguments,
            throwable: self.throwable,
            context_tags: self.context_tags,
            classification: self.classification,
            thread: std::thread::current().name().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("connection refused")]
    struct Root;

    #[derive(Debug, thiserror::Error)]
    #[error("query failed")]
    struct Outer(#[source] Root);

    #[test]
    fn empty_logger_name_is_rejected() {
        let err = LogEvent::builder(Level::Info, "  ").message("x").build().unwrap_err();
        assert!(matches!(err, EventError::EmptyLoggerName));
    }

    #[test]
    fn builder_populates_fields() {
        let event = LogEvent::builder(Level::Warn, "app::db")
            .message("slow query {} ms")
            .arg(250)
            .tag("request_id", "r-1")
            .classify("perf")
            .build()
            .unwrap();

        assert_eq!(event.level(), Level::Warn);
        assert_eq!(event.logger_name(), "app::db");
        assert_eq!(event.formatted_message(), "slow query 250 ms");
        assert_eq!(event.arguments(), &[json!(250)]);
        assert_eq!(event.context_tags().get("request_id").map(String::as_str), Some("r-1"));
        assert_eq!(event.classification(), &["perf".to_string()]);
    }

    #[test]
    fn throwable_captures_cause_chain() {
        let err = Outer(Root);
        let t = Throwable::from_error(&err);
        assert_eq!(t.message, "query failed");
        assert_eq!(t.causes, vec!["connection refused".to_string()]);
        assert_eq!(t.to_string(), "query failed\nCaused by: connection refused");
    }

    #[test]
    fn timestamps_never_decrease_on_one_thread() {
        let mut prev = None;
        for _ in 0..1_000 {
            let event = LogEvent::builder(Level::Trace, "t").build().unwrap();
            if let Some(p) = prev {
                assert!(event.timestamp() >= p);
            }
            prev = Some(event.timestamp());
        }
    }

    #[test]
    fn serializes_without_empty_optionals() {
        let event = LogEvent::builder(Level::Info, "svc").message("hello").build().unwrap();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["level"], json!("INFO"));
        assert_eq!(value["logger_name"], json!("svc"));
        assert!(value.get("throwable").is_none());
        assert!(value.get("arguments").is_none());
    }
}
