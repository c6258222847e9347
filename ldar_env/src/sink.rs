//! Result sink abstraction.
//!
//! Replicates finish in any order on any worker. Each one hands its tables to
//! the sink as [`RecordBatch`]es tagged with program and replicate index, so
//! records stay attributable no matter how writes interleave.

use async_trait::async_trait;
use crate::error::EnvError;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// A table fragment produced by one program in one replicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    /// Output table name (e.g. "leaks", "timeseries")
    pub table: String,

    /// Program the rows belong to
    pub program: String,

    /// Replicate index the rows belong to
    pub replicate: u32,

    /// Serialized rows
    pub rows: Vec<serde_json::Value>,
}

impl RecordBatch {
    /// Creates a batch from serializable rows.
    pub fn from_rows<T: Serialize>(
        table: &str,
        program: &str,
        replicate: u32,
        rows: &[T],
    ) -> Result<Self, EnvError> {
        let rows = rows
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            table: table.to_string(),
            program: program.to_string(),
            replicate,
            rows,
        })
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Destination for simulation records.
///
/// Writes from concurrently finishing replicates are serialized by the
/// implementation; callers may share one sink across tasks.
#[async_trait]
pub trait ResultSink: Send + Sync + 'static {
    /// Appends a batch.
    ///
    /// # Errors
    /// `EnvError::Io` / `EnvError::SerializationError` if the batch cannot
    /// be persisted, `EnvError::SinkClosed` after [`ResultSink::close`].
    async fn write(&self, batch: RecordBatch) -> Result<(), EnvError>;

    /// Flushes buffered records and stops accepting new ones.
    async fn close(&self) -> Result<(), EnvError>;
}

/// Sink that keeps every batch in memory (tests, in-process analysis).
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<RecordBatch>>,
    closed: Mutex<bool>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything written so far.
    pub fn batches(&self) -> Vec<RecordBatch> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Returns all rows of one table, ordered by (program, replicate).
    pub fn table(&self, table: &str) -> Vec<RecordBatch> {
        let mut out: Vec<RecordBatch> = self
            .batches()
            .into_iter()
            .filter(|b| b.table == table)
            .collect();
        out.sort_by(|a, b| (a.program.as_str(), a.replicate).cmp(&(b.program.as_str(), b.replicate)));
        out
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn write(&self, batch: RecordBatch) -> Result<(), EnvError> {
        if self.closed.lock().map(|c| *c).unwrap_or(true) {
            return Err(EnvError::SinkClosed);
        }
        self.batches
            .lock()
            .map_err(|_| EnvError::SinkClosed)?
            .push(batch);
        Ok(())
    }

    async fn close(&self) -> Result<(), EnvError> {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        day: u32,
        value: f64,
    }

    #[tokio::test]
    async fn test_memory_sink_collects_batches() {
        let sink = MemorySink::new();
        let rows = [Row { day: 0, value: 1.0 }, Row { day: 1, value: 2.0 }];

        sink.write(RecordBatch::from_rows("timeseries", "P_OGI", 1, &rows).unwrap()).await.unwrap();
        sink.write(RecordBatch::from_rows("timeseries", "P_OGI", 0, &rows).unwrap()).await.unwrap();

        let table = sink.table("timeseries");
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].replicate, 0);
        assert_eq!(table[0].rows[1]["value"], 2.0);
    }

    #[tokio::test]
    async fn test_memory_sink_rejects_after_close() {
        let sink = MemorySink::new();
        sink.close().await.unwrap();

        let batch = RecordBatch::from_rows::<Row>("leaks", "P_none", 0, &[]).unwrap();
        assert!(matches!(sink.write(batch).await, Err(EnvError::SinkClosed)));
    }
}
