use crate::adapter::BackendAdapter;
use crate::error::AdapterError;
use crate::level::Level;
use crate::record::LogEvent;
use async_trait::async_trait;
use std::fmt::Write as _;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stderr, Stdout};
use tokio::sync::Mutex;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Render an event as human-readable text.
///
/// ```text
/// ㏒ 2025-03-01 09:15:02.417 [WARN] app::db (perf,slow) on worker-1
///  ▪ message: slow query 250 ms
///  ▪ request_id: r-1
///  ⊹ Exception Thrown:
/// query failed
/// Caused by: connection refused
/// ```
pub fn render_text(event: &LogEvent) -> String {
    let mut s = String::from("㏒ ");
    let _ = write!(
        s,
        "{} [{}] {}",
        event.timestamp().format(TIMESTAMP_FORMAT),
        event.level(),
        event.logger_name()
    );
    if !event.classification().is_empty() {
        let _ = write!(s, " ({})", event.classification().join(","));
    }
    if let Some(thread) = event.thread() {
        let _ = write!(s, " on {}", thread);
    }

    let message = event.formatted_message();
    if !message.is_empty() {
        let _ = write!(s, "\n ▪ message: {}", message);
    }
    for (key, value) in event.context_tags() {
        let _ = write!(s, "\n ▪ {}: {}", key, value);
    }
    if let Some(throwable) = event.throwable() {
        let _ = write!(s, "\n ⊹ Exception Thrown:\n{}", throwable);
    }
    s
}

/// Writes each event as [`render_text`] output to an async stream.
pub struct WriterAdapter<W> {
    name: String,
    minimum_level: Level,
    writer: Mutex<W>,
}

/// [`WriterAdapter`] over the process's standard output.
pub type StdoutAdapter = WriterAdapter<Stdout>;

impl WriterAdapter<Stdout> {
    pub fn stdout() -> Self {
        WriterAdapter::new("stdout", tokio::io::stdout())
    }
}

impl WriterAdapter<Stderr> {
    pub fn stderr() -> Self {
        WriterAdapter::new("stderr", tokio::io::stderr())
    }
}

impl<W> WriterAdapter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        WriterAdapter {
            name: name.into(),
            minimum_level: Level::Trace,
            writer: Mutex::new(writer),
        }
    }

    pub fn with_minimum_level(mut self, level: Level) -> Self {
        self.minimum_level = level;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> BackendAdapter for WriterAdapter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_level(&self) -> Level {
        self.minimum_level
    }

    async fn forward(&self, event: &LogEvent) -> Result<(), AdapterError> {
        let mut line = render_text(event);
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), AdapterError> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Throwable;

    fn sample() -> LogEvent {
        LogEvent::builder(Level::Warn, "app::db")
            .message("slow query {} ms")
            .arg(250)
            .tag("request_id", "r-1")
            .classify("perf")
            .classify("slow")
            .throwable(Throwable {
                message: "query failed".into(),
                causes: vec!["connection refused".into()],
                backtrace: None,
            })
            .build()
            .unwrap()
    }

    #[test]
    fn renders_header_tags_and_throwable() {
        let text = render_text(&sample());
        let mut lines = text.lines();
        let header = lines.next().unwrap();

        assert!(header.starts_with("㏒ "));
        assert!(header.contains(" [WARN] app::db (perf,slow)"));
        assert_eq!(lines.next(), Some(" ▪ message: slow query 250 ms"));
        assert_eq!(lines.next(), Some(" ▪ request_id: r-1"));
        assert_eq!(lines.next(), Some(" ⊹ Exception Thrown:"));
        assert_eq!(lines.next(), Some("query failed"));
        assert_eq!(lines.next(), Some("Caused by: connection refused"));
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn writes_one_block_per_event() {
        let adapter = WriterAdapter::new("buffer", Vec::<u8>::new());
        adapter.forward(&sample()).await.unwrap();
        adapter.forward(&sample()).await.unwrap();
        adapter.flush().await.unwrap();

        let out = String::from_utf8(adapter.into_inner()).unwrap();
        assert_eq!(out.matches("㏒ ").count(), 2);
        assert!(out.ends_with('\n'));
    }
}
