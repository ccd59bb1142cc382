//! Buffered log pipeline
//!
//! `log` is synchronous: it redacts, mirrors and buffers the entry, then
//! signals the background flusher when the buffer is full or the entry is
//! critical. The flusher is the only task that drains the buffer on its
//! own, and `flush` itself is serialized, so batches reach the sink one at
//! a time and in order.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::LoggingConfig;
use crate::logging::entry::{describe_error, LogCategory, LogEntry, LogLevel, SessionResolver};
use crate::monitoring::AlertSink;
use crate::sink::{Sink, COLLECTION_SECURE_LOGS};
use crate::{Environment, Result};

/// Target of the local developer mirror
pub const MIRROR_TARGET: &str = "vigil_core::mirror";

/// Buffered, redacting log pipeline
pub struct LogPipeline {
    /// Buffer and flush settings
    settings: LoggingConfig,

    /// Environment stamped on every entry
    environment: Environment,

    /// Whether entries are mirrored locally
    mirror: bool,

    /// Entries waiting for the next flush, oldest first
    buffer: Mutex<VecDeque<LogEntry>>,

    /// Serializes flushes
    flush_lock: tokio::sync::Mutex<()>,

    /// Wakes the background flusher
    flush_wanted: Notify,

    /// Stops the background flusher
    shutdown: CancellationToken,

    /// Background flusher handle
    flusher: Mutex<Option<JoinHandle<()>>>,

    /// Entries dropped because `max_pending` was exceeded
    dropped: AtomicU64,

    /// Batches accepted by the sink
    flushed_batches: AtomicU64,

    /// Set once `destroy` has run
    destroyed: AtomicBool,

    alert_sink: Arc<dyn AlertSink>,
    sink: Arc<dyn Sink>,
    session: Arc<dyn SessionResolver>,
}

impl LogPipeline {
    /// Create a new pipeline
    pub fn new(
        settings: LoggingConfig,
        environment: Environment,
        alert_sink: Arc<dyn AlertSink>,
        sink: Arc<dyn Sink>,
        session: Arc<dyn SessionResolver>,
    ) -> Self {
        let mirror = settings
            .mirror_local
            .unwrap_or_else(|| environment.mirrors_locally());

        Self {
            settings,
            environment,
            mirror,
            buffer: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_wanted: Notify::new(),
            shutdown: CancellationToken::new(),
            flusher: Mutex::new(None),
            dropped: AtomicU64::new(0),
            flushed_batches: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            alert_sink,
            sink,
            session,
        }
    }

    /// Start the background flusher
    ///
    /// Must be called from within a tokio runtime. Calling it again while a
    /// flusher is running has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut flusher = self.flusher.lock();
        if flusher.is_some() || self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let pipeline = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = self.settings.flush_interval();

        *flusher = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = pipeline.flush_wanted.notified() => {}
                }

                if let Err(e) = pipeline.flush().await {
                    warn!(error = %e, pending = pipeline.pending(), "Log flush failed, batch kept for retry");
                }
            }

            debug!("Log flusher stopped");
        }));

        info!(
            buffer_size = self.settings.buffer_size,
            flush_interval_ms = self.settings.flush_interval_ms,
            "Log pipeline started"
        );
    }

    /// Record a structured log event
    ///
    /// Never waits on the sink. Returns the id of the buffered entry.
    pub fn log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: &str,
        context: Option<Value>,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) -> Uuid {
        let entry = self.build_entry(level, category, message, context, error);
        let id = entry.id;

        if self.mirror {
            mirror(&entry);
        }

        let alert = level.raises_alert().then(|| alert_payload(&entry));

        // Only the push that fills the buffer wakes the flusher; a backlog
        // left by a failed flush waits for the next tick
        let filled = {
            let mut buffer = self.buffer.lock();
            let before = buffer.len();
            buffer.push_back(entry);
            self.enforce_cap(&mut buffer);
            before < self.settings.buffer_size && buffer.len() >= self.settings.buffer_size
        };

        metrics::counter!("vigil_log_entries_total", 1, "level" => level.as_str());

        if filled || level == LogLevel::Critical {
            self.flush_wanted.notify_one();
        }

        if let Some((message, metadata)) = alert {
            self.alert_sink.raise(level, category, &message, metadata);
        }

        id
    }

    /// Record an event without blocking on the buffer lock
    ///
    /// Used from the panic hook, where the panicking thread may already hold
    /// the buffer. On contention the entry is emitted as a tracing event only.
    pub fn try_log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: &str,
        context: Option<Value>,
    ) -> bool {
        let entry = self.build_entry(level, category, message, context, None);

        if self.mirror {
            mirror(&entry);
        }

        let alert = level.raises_alert().then(|| alert_payload(&entry));

        let Some(mut buffer) = self.buffer.try_lock() else {
            error!(
                category = %entry.category,
                id = %entry.id,
                "Log buffer busy, entry not persisted: {}",
                entry.message
            );
            return false;
        };
        buffer.push_back(entry);
        self.enforce_cap(&mut buffer);
        drop(buffer);

        metrics::counter!("vigil_log_entries_total", 1, "level" => level.as_str());
        self.flush_wanted.notify_one();

        if let Some((message, metadata)) = alert {
            self.alert_sink.raise(level, category, &message, metadata);
        }

        true
    }

    pub fn debug(&self, category: LogCategory, message: &str) -> Uuid {
        self.log(LogLevel::Debug, category, message, None, None)
    }

    pub fn info(&self, category: LogCategory, message: &str) -> Uuid {
        self.log(LogLevel::Info, category, message, None, None)
    }

    pub fn warn(&self, category: LogCategory, message: &str) -> Uuid {
        self.log(LogLevel::Warn, category, message, None, None)
    }

    pub fn error(
        &self,
        category: LogCategory,
        message: &str,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) -> Uuid {
        self.log(LogLevel::Error, category, message, None, error)
    }

    pub fn critical(
        &self,
        category: LogCategory,
        message: &str,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) -> Uuid {
        self.log(LogLevel::Critical, category, message, None, error)
    }

    /// Persist everything currently buffered as one batch
    ///
    /// Returns the number of entries the sink accepted. On failure the batch
    /// goes back in front of anything logged meanwhile.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<LogEntry> = self.buffer.lock().drain(..).collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let records = match batch.iter().map(LogEntry::to_record).collect::<Result<Vec<_>>>() {
            Ok(records) => records,
            Err(e) => {
                self.requeue(batch);
                return Err(e);
            }
        };

        let count = batch.len();
        match self.sink.append(COLLECTION_SECURE_LOGS, records).await {
            Ok(()) => {
                self.flushed_batches.fetch_add(1, Ordering::Relaxed);
                trace!(count, "Flushed log batch");
                Ok(count)
            }
            Err(e) => {
                metrics::counter!("vigil_log_flush_failures_total", 1);
                self.requeue(batch);
                Err(e)
            }
        }
    }

    /// Stop the flusher and make one final flush
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Log flusher ended abnormally");
            }
        }

        match self.flush().await {
            Ok(count) => debug!(count, "Final log flush complete"),
            Err(e) => warn!(
                error = %e,
                pending = self.pending(),
                "Final log flush failed, entries not persisted"
            ),
        }
    }

    /// Entries waiting to be flushed
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Entries dropped because the pending ceiling was reached
    pub fn dropped_entries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Batches the sink has accepted
    pub fn flushed_batches(&self) -> u64 {
        self.flushed_batches.load(Ordering::Relaxed)
    }

    /// Whether `destroy` has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn build_entry(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: &str,
        context: Option<Value>,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) -> LogEntry {
        let context = context.map(|value| match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        });

        LogEntry::redacted(
            level,
            category,
            message,
            context.as_ref(),
            error.map(describe_error),
            self.session.current_user_id(),
            self.environment,
        )
    }

    fn requeue(&self, batch: Vec<LogEntry>) {
        let mut buffer = self.buffer.lock();
        let newer = std::mem::take(&mut *buffer);
        buffer.extend(batch);
        buffer.extend(newer);
        self.enforce_cap(&mut buffer);
    }

    fn enforce_cap(&self, buffer: &mut VecDeque<LogEntry>) {
        let overflow = buffer.len().saturating_sub(self.settings.max_pending);
        if overflow > 0 {
            buffer.drain(..overflow);
            self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
            metrics::counter!("vigil_log_entries_dropped_total", overflow as u64);
        }
    }
}

fn alert_payload(entry: &LogEntry) -> (String, Value) {
    let mut metadata = entry.context.clone();
    metadata.insert("log_id".to_string(), Value::String(entry.id.to_string()));
    if let Some(stack) = &entry.stack_trace {
        metadata.insert("stack_trace".to_string(), Value::String(stack.clone()));
    }
    (entry.message.clone(), Value::Object(metadata))
}

fn mirror(entry: &LogEntry) {
    let context = Value::Object(entry.context.clone());
    match entry.level {
        LogLevel::Debug => debug!(
            target: MIRROR_TARGET,
            category = %entry.category, id = %entry.id, context = %context,
            "{}", entry.message
        ),
        LogLevel::Info => info!(
            target: MIRROR_TARGET,
            category = %entry.category, id = %entry.id, context = %context,
            "{}", entry.message
        ),
        LogLevel::Warn => warn!(
            target: MIRROR_TARGET,
            category = %entry.category, id = %entry.id, context = %context,
            "{}", entry.message
        ),
        LogLevel::Error | LogLevel::Critical => error!(
            target: MIRROR_TARGET,
            severity = entry.level.as_str(), category = %entry.category, id = %entry.id,
            context = %context,
            "{}", entry.message
        ),
    }
}
