// ============================================================================
// COLUMNAR BATCHES
// ============================================================================
// Rows of one signal for one project are appended column by column under a
// mutex and flushed as a single `JSONColumns` insert per table, either when
// the batch reaches its row limit or when the flush ticker fires. A failed
// flush is logged and the rows are dropped.
// ============================================================================

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::Signal;
use crate::error::CollectorError;
use crate::model::ProjectId;
use crate::telemetry::metrics;

/// Destination of flushed tables.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn insert(&self, table: &str, body: Vec<u8>) -> Result<(), CollectorError>;
}

/// Accumulated columns of one table.
#[derive(Debug)]
pub struct Columns {
    table: &'static str,
    names: &'static [&'static str],
    data: Vec<Vec<Value>>,
}

impl Columns {
    pub fn new(table: &'static str, names: &'static [&'static str]) -> Self {
        Self {
            table,
            names,
            data: names.iter().map(|_| Vec::new()).collect(),
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Appends one row; values are in the order of the column names.
    pub fn push(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.names.len(), "row width of {}", self.table);
        for (col, v) in self.data.iter_mut().zip(row) {
            col.push(v);
        }
    }

    pub fn len(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the rows out, leaving the columns empty.
    fn take(&mut self) -> Columns {
        let data = self.data.iter_mut().map(std::mem::take).collect();
        Columns {
            table: self.table,
            names: self.names,
            data,
        }
    }

    /// `{"Column": [v1, v2, ...], ...}`
    pub fn into_json(self) -> Vec<u8> {
        let obj: Map<String, Value> = self
            .names
            .iter()
            .zip(self.data)
            .map(|(name, values)| (name.to_string(), Value::Array(values)))
            .collect();
        serde_json::to_vec(&obj).unwrap_or_default()
    }
}

/// `DateTime64(9)` literal for a unix timestamp in nanoseconds.
pub fn datetime64(nanos: u64) -> Value {
    Value::String(format!("{}.{:09}", nanos / 1_000_000_000, nanos % 1_000_000_000))
}

pub struct Batch {
    signal: Signal,
    project_id: ProjectId,
    limit: usize,
    tables: Mutex<Vec<Columns>>,
    sink: Arc<dyn Sink>,
}

impl Batch {
    pub fn new(
        signal: Signal,
        project_id: ProjectId,
        limit: usize,
        tables: Vec<Columns>,
        sink: Arc<dyn Sink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            signal,
            project_id,
            limit: limit.max(1),
            tables: Mutex::new(tables),
            sink,
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Rows currently buffered in the largest table.
    pub fn len(&self) -> usize {
        self.tables.lock().iter().map(Columns::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends rows via `f` and flushes if the batch is full.
    pub async fn add<F>(&self, f: F)
    where
        F: FnOnce(&mut [Columns]),
    {
        let full = {
            let mut tables = self.tables.lock();
            f(&mut tables);
            tables.iter().any(|t| t.len() >= self.limit)
        };
        if full {
            self.flush().await;
        }
    }

    pub async fn flush(&self) {
        let taken: Vec<Columns> = {
            let mut tables = self.tables.lock();
            tables.iter_mut().map(Columns::take).collect()
        };
        for cols in taken {
            if cols.is_empty() {
                continue;
            }
            let rows = cols.len();
            let table = cols.table();
            match self.sink.insert(table, cols.into_json()).await {
                Ok(()) => {
                    metrics()
                        .collector_rows
                        .with_label_values(&[self.signal.as_str()])
                        .inc_by(rows as u64);
                    debug!(target: "cerebro::collector", project = %self.project_id, table, rows, "batch flushed");
                }
                Err(e) => {
                    metrics()
                        .collector_flush_errors
                        .with_label_values(&[self.signal.as_str()])
                        .inc();
                    error!(
                        target: "cerebro::collector",
                        project = %self.project_id,
                        signal = self.signal.as_str(),
                        table,
                        rows,
                        error = %e,
                        "failed to flush batch"
                    );
                }
            }
        }
    }

    /// Flushes every `timeout` until `shutdown`, then flushes once more.
    pub fn spawn_ticker(self: &Arc<Self>, timeout: StdDuration, shutdown: CancellationToken) -> JoinHandle<()> {
        let batch = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timeout);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => batch.flush().await,
                }
            }
            batch.flush().await;
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Records every insert; fails all of them while `fail` is set.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub(crate) inserts: Mutex<Vec<(String, Value)>>,
        pub(crate) fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Sink for MemorySink {
        async fn insert(&self, table: &str, body: Vec<u8>) -> Result<(), CollectorError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CollectorError::clickhouse("connection refused"));
            }
            let body: Value = serde_json::from_slice(&body).map_err(|e| CollectorError::decode(e.to_string()))?;
            self.inserts.lock().push((table.to_string(), body));
            Ok(())
        }
    }

    impl MemorySink {
        pub(crate) fn tables(&self) -> Vec<String> {
            self.inserts.lock().iter().map(|(t, _)| t.clone()).collect()
        }

        pub(crate) fn body(&self, table: &str) -> Value {
            self.inserts
                .lock()
                .iter()
                .find(|(t, _)| t == table)
                .map(|(_, b)| b.clone())
                .unwrap_or(Value::Null)
        }
    }

    const NAMES: &[&str] = &["ServiceName", "Value"];

    fn batch(sink: Arc<MemorySink>, limit: usize) -> Arc<Batch> {
        Batch::new(
            Signal::Metrics,
            "p1".into(),
            limit,
            vec![Columns::new("@@table_test@@", NAMES)],
            sink,
        )
    }

    #[test]
    fn test_columns_json() {
        let mut cols = Columns::new("@@table_test@@", NAMES);
        cols.push(vec!["api".into(), 1.into()]);
        cols.push(vec!["db".into(), 2.into()]);
        assert_eq!(cols.len(), 2);
        let json: Value = serde_json::from_slice(&cols.into_json()).unwrap();
        assert_eq!(json, serde_json::json!({"ServiceName": ["api", "db"], "Value": [1, 2]}));
    }

    #[test]
    fn test_datetime64() {
        assert_eq!(datetime64(1_700_000_000_000_000_123), Value::from("1700000000.000000123"));
        assert_eq!(datetime64(0), Value::from("0.000000000"));
    }

    #[tokio::test]
    async fn test_flush_on_limit() {
        let sink = Arc::new(MemorySink::default());
        let b = batch(sink.clone(), 2);
        b.add(|t| t[0].push(vec!["a".into(), 1.into()])).await;
        assert!(sink.tables().is_empty());
        b.add(|t| t[0].push(vec!["b".into(), 2.into()])).await;
        assert_eq!(sink.tables(), vec!["@@table_test@@"]);
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_drops_rows() {
        let sink = Arc::new(MemorySink::default());
        sink.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let b = batch(sink.clone(), 10);
        b.add(|t| t[0].push(vec!["a".into(), 1.into()])).await;
        b.flush().await;
        assert!(b.is_empty());

        sink.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        b.flush().await;
        assert!(sink.tables().is_empty());
    }

    #[tokio::test]
    async fn test_ticker_flushes_on_shutdown() {
        let sink = Arc::new(MemorySink::default());
        let b = batch(sink.clone(), 10);
        let token = CancellationToken::new();
        let handle = b.spawn_ticker(StdDuration::from_secs(3600), token.clone());
        b.add(|t| t[0].push(vec!["a".into(), 1.into()])).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(sink.body("@@table_test@@")["ServiceName"], serde_json::json!(["a"]));
    }
}
