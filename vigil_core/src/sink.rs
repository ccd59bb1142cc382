//! Durable sinks for log batches, reports and alert mirrors
//!
//! Every record is appended to a named collection. A backend that does not
//! have the collection reports [`VigilError::MissingCollection`];
//! [`GuardedSink`] turns that into a one-time warning and drops later
//! writes to the same collection without calling the backend again.

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{Result, VigilError};

pub const COLLECTION_SECURE_LOGS: &str = "secure_logs";
pub const COLLECTION_ERROR_LOGS: &str = "error_logs";
pub const COLLECTION_SYSTEM_HEALTH_LOGS: &str = "system_health_logs";
pub const COLLECTION_PERFORMANCE_METRICS: &str = "performance_metrics";
pub const COLLECTION_ALERTS: &str = "alerts";
pub const COLLECTION_HEALTH_CHECK_REPORTS: &str = "health_check_reports";

/// Postgres SQLSTATE for an undefined table
const PG_UNDEFINED_TABLE: &str = "42P01";

/// Append-only store of JSON records grouped by collection
#[async_trait]
pub trait Sink: Send + Sync {
    /// Append records to a collection in one write
    async fn append(&self, collection: &str, records: Vec<Value>) -> Result<()>;

    /// Backend name for diagnostics
    fn name(&self) -> &'static str;
}

/// Collection names become file names and table names
fn validate_collection(collection: &str) -> Result<()> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(VigilError::sink(collection, "invalid collection name"))
    }
}

/// In-process sink, mainly for tests and dry runs
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<HashMap<String, Vec<Value>>>,
    missing: Mutex<HashSet<String>>,
    failing: AtomicBool,
    append_calls: AtomicUsize,
}

impl MemorySink {
    /// Create an empty memory sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make a collection behave as if it did not exist
    pub fn mark_missing(&self, collection: &str) {
        self.missing.lock().insert(collection.to_string());
    }

    /// Records stored in a collection
    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.records
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of append calls received, including failed ones
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Total records across all collections
    pub fn total_records(&self) -> usize {
        self.records.lock().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn append(&self, collection: &str, records: Vec<Value>) -> Result<()> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        validate_collection(collection)?;

        if self.missing.lock().contains(collection) {
            return Err(VigilError::MissingCollection(collection.to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(VigilError::sink(collection, "memory sink set to fail"));
        }

        self.records
            .lock()
            .entry(collection.to_string())
            .or_default()
            .extend(records);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Newline-delimited JSON files, one per collection
pub struct JsonlSink {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    /// Create a sink writing under `dir`, creating it if needed
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "JSONL sink ready");

        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// File backing a collection
    pub fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", collection))
    }
}

#[async_trait]
impl Sink for JsonlSink {
    async fn append(&self, collection: &str, records: Vec<Value>) -> Result<()> {
        validate_collection(collection)?;
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(collection))
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;

        debug!(collection, count = records.len(), "Appended JSONL records");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

/// Postgres tables with a single `payload jsonb` column
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    /// Connect a pool to `database_url`
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(database_url)
            .await?;

        info!(pool_size, "Postgres sink connected");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool, shared with the datastore health check
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Sink for PgSink {
    async fn append(&self, collection: &str, records: Vec<Value>) -> Result<()> {
        validate_collection(collection)?;
        if records.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO {}(payload) SELECT value FROM jsonb_array_elements($1)",
            collection
        );

        match sqlx::query(&sql)
            .bind(Value::Array(records))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(PG_UNDEFINED_TABLE) =>
            {
                Err(VigilError::MissingCollection(collection.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// Wrapper that treats a missing collection as a soft, one-time failure
pub struct GuardedSink {
    inner: Arc<dyn Sink>,
    missing: DashSet<String>,
}

impl GuardedSink {
    pub fn new(inner: Arc<dyn Sink>) -> Self {
        Self {
            inner,
            missing: DashSet::new(),
        }
    }

    /// Collections found missing so far
    pub fn missing_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.missing.iter().map(|name| name.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Sink for GuardedSink {
    async fn append(&self, collection: &str, records: Vec<Value>) -> Result<()> {
        if self.missing.contains(collection) {
            return Ok(());
        }

        match self.inner.append(collection, records).await {
            Err(VigilError::MissingCollection(name)) => {
                if self.missing.insert(name.clone()) {
                    warn!(
                        collection = %name,
                        backend = self.inner.name(),
                        "Sink collection does not exist, further writes to it are dropped"
                    );
                }
                Ok(())
            }
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_failure_modes() {
        let sink = MemorySink::new();
        sink.append("alerts", vec![json!({"a": 1})]).await.unwrap();
        assert_eq!(sink.records("alerts").len(), 1);

        sink.set_failing(true);
        assert!(sink.append("alerts", vec![json!({})]).await.is_err());
        assert_eq!(sink.append_calls(), 2);

        assert!(sink.append("../etc", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_guarded_sink_warns_once_and_short_circuits() {
        let memory = Arc::new(MemorySink::new());
        memory.mark_missing(COLLECTION_HEALTH_CHECK_REPORTS);
        let guarded = GuardedSink::new(memory.clone());

        for _ in 0..3 {
            guarded
                .append(COLLECTION_HEALTH_CHECK_REPORTS, vec![json!({})])
                .await
                .unwrap();
        }

        assert_eq!(memory.append_calls(), 1);
        assert_eq!(
            guarded.missing_collections(),
            vec![COLLECTION_HEALTH_CHECK_REPORTS.to_string()]
        );

        // Other failures still propagate
        memory.set_failing(true);
        assert!(guarded.append(COLLECTION_SECURE_LOGS, vec![json!({})]).await.is_err());
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path()).await.unwrap();

        sink.append("secure_logs", vec![json!({"n": 1}), json!({"n": 2})])
            .await
            .unwrap();
        sink.append("secure_logs", vec![json!({"n": 3})]).await.unwrap();

        let contents = tokio::fs::read_to_string(sink.path_for("secure_logs"))
            .await
            .unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    }
}
