use crate::adapter::BackendAdapter;
use crate::dispatcher::dispatching;
use crate::error::AdapterError;
use crate::level::Level;
use crate::record::LogEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, MissedTickBehavior};

/// Backend that accepts events in batches, one topic (logger name) per
/// batch. Wrapped by [`BatchingAdapter`] to become a [`BackendAdapter`].
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Write one batch. All events in `batch` share `topic` as their
    /// logger name and are in dispatch order.
    async fn write_batch(&self, topic: &str, batch: &[LogEvent]) -> Result<(), AdapterError>;
}

/// Buffering and retry settings of a [`BatchingAdapter`].
///
/// Minimal thresholds are enforced for `buffer`, `batch_size` and
/// `flush_interval` to avoid degenerate configurations.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Capacity of the channel between `forward` and the writer task.
    pub buffer: usize,
    pub batch_size: usize,
    /// Pending batches are written at least this often.
    pub flush_interval: Duration,
    /// Retries of a failing batch before it is given up.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            buffer: 1024,
            batch_size: 128,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl BatchConfig {
    fn normalized(mut self) -> Self {
        self.buffer = self.buffer.max(16);
        self.batch_size = self.batch_size.max(1);
        if self.flush_interval < Duration::from_millis(10) {
            self.flush_interval = Duration::from_millis(10);
        }
        self
    }
}

enum Command {
    Event(LogEvent),
    Flush(oneshot::Sender<Result<(), String>>),
}

#[derive(Default)]
struct BatchCounters {
    written_batches: AtomicU64,
    failed_batches: AtomicU64,
    lost_events: AtomicU64,
}

/// Adapter that hands events to its own writer task, which groups them
/// by logger name and writes them to a [`BatchSink`].
///
/// `forward` never waits for the sink: it only pushes into a bounded
/// channel and fails when that channel is full. A batch that keeps
/// failing after `max_retries` is dropped and counted.
pub struct BatchingAdapter<S> {
    minimum_level: Level,
    sink: Arc<S>,
    config: BatchConfig,
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<BatchCounters>,
}

impl<S: BatchSink> BatchingAdapter<S> {
    pub fn new(sink: S, config: BatchConfig) -> Self {
        BatchingAdapter {
            minimum_level: Level::Trace,
            sink: Arc::new(sink),
            config: config.normalized(),
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            counters: Arc::new(BatchCounters::default()),
        }
    }

    pub fn with_minimum_level(mut self, level: Level) -> Self {
        self.minimum_level = level;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn written_batches(&self) -> u64 {
        self.counters.written_batches.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.counters.failed_batches.load(Ordering::Relaxed)
    }

    /// Events lost in failed batches.
    pub fn lost_events(&self) -> u64 {
        self.counters.lost_events.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Result<mpsc::Sender<Command>, AdapterError> {
        self.sender
            .lock()
            .clone()
            .ok_or_else(|| format!("batching adapter {} is not running", self.sink.name()).into())
    }
}

#[async_trait]
impl<S: BatchSink> BackendAdapter for BatchingAdapter<S> {
    fn name(&self) -> &str {
        self.sink.name()
    }

    fn minimum_level(&self) -> Level {
        self.minimum_level
    }

    async fn start(&self) -> Result<(), AdapterError> {
        let mut sender = self.sender.lock();
        if sender.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(self.config.buffer);
        // The writer is part of the dispatch path: whatever the sink logs
        // through `tracing` stays out of the queue.
        let handle = tokio::spawn(dispatching(run_writer(
            Arc::clone(&self.sink),
            rx,
            self.config.clone(),
            Arc::clone(&self.counters),
        )));
        *sender = Some(tx);
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    async fn forward(&self, event: &LogEvent) -> Result<(), AdapterError> {
        self.sender()?
            .try_send(Command::Event(event.clone()))
            .map_err(|e| -> AdapterError {
                match e {
                    mpsc::error::TrySendError::Full(_) => "batch buffer full".into(),
                    mpsc::error::TrySendError::Closed(_) => "batch writer stopped".into(),
                }
            })
    }

    async fn flush(&self) -> Result<(), AdapterError> {
        let sender = self.sender()?;
        let (ack, done) = oneshot::channel();
        sender
            .send(Command::Flush(ack))
            .await
            .map_err(|_| -> AdapterError { "batch writer stopped".into() })?;
        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err("batch writer stopped before acknowledging flush".into()),
        }
    }

    /// Closes the channel; the writer task writes what is pending and exits.
    async fn stop(&self) -> Result<(), AdapterError> {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            handle.await?;
        }
        Ok(())
    }
}

async fn run_writer<S: BatchSink>(
    sink: Arc<S>,
    mut rx: mpsc::Receiver<Command>,
    config: BatchConfig,
    counters: Arc<BatchCounters>,
) {
    let mut pending: BTreeMap<String, Vec<LogEvent>> = BTreeMap::new();
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Event(event)) => {
                    let topic = event.logger_name().to_string();
                    let batch = pending.entry(topic.clone()).or_default();
                    batch.push(event);
                    if batch.len() >= config.batch_size {
                        if let Some(batch) = pending.remove(&topic) {
                            let _ = write_counted(&*sink, &topic, batch, &config, &counters).await;
                        }
                    }
                }
                Some(Command::Flush(ack)) => {
                    let result = write_all(&*sink, &mut pending, &config, &counters).await;
                    let _ = ack.send(result);
                }
                None => {
                    let _ = write_all(&*sink, &mut pending, &config, &counters).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    let _ = write_all(&*sink, &mut pending, &config, &counters).await;
                }
            }
        }
    }
}

async fn write_all<S: BatchSink>(
    sink: &S,
    pending: &mut BTreeMap<String, Vec<LogEvent>>,
    config: &BatchConfig,
    counters: &BatchCounters,
) -> Result<(), String> {
    let mut first_error = None;
    for (topic, batch) in std::mem::take(pending) {
        if let Err(e) = write_counted(sink, &topic, batch, config, counters).await {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn write_counted<S: BatchSink>(
    sink: &S,
    topic: &str,
    batch: Vec<LogEvent>,
    config: &BatchConfig,
    counters: &BatchCounters,
) -> Result<(), String> {
    match write_with_retry(sink, topic, &batch, config).await {
        Ok(()) => {
            counters.written_batches.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            counters.failed_batches.fetch_add(1, Ordering::Relaxed);
            counters.lost_events.fetch_add(batch.len() as u64, Ordering::Relaxed);
            tracing::warn!(
                sink = sink.name(),
                topic,
                events = batch.len(),
                error = %e,
                "giving up on log batch"
            );
            Err(e.to_string())
        }
    }
}

async fn write_with_retry<S: BatchSink>(
    sink: &S,
    topic: &str,
    batch: &[LogEvent],
    config: &BatchConfig,
) -> Result<(), AdapterError> {
    let mut backoff = config.initial_backoff;
    let mut attempt = 0;
    loop {
        match sink.write_batch(topic, batch).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= config.max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                tracing::debug!(
                    sink = sink.name(),
                    topic,
                    attempt,
                    error = %e,
                    "log batch write failed, retrying in {:?}",
                    backoff
                );
                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}
