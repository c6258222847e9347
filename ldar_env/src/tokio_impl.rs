//! File-backed result sink using Tokio.

use crate::error::EnvError;
use crate::sink::{RecordBatch, ResultSink};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Writes each table to `<dir>/<table>.jsonl`, one JSON object per row.
///
/// Every row is stamped with `program` and `replicate` so the files can be
/// concatenated or filtered without the batch envelope. Writes go through a
/// single async mutex, which is what serializes concurrently finishing
/// replicates. A table file left by an earlier run is truncated the first
/// time this sink writes to it.
pub struct JsonLinesSink {
    dir: PathBuf,
    files: Mutex<Option<HashMap<String, File>>>,
}

impl JsonLinesSink {
    /// Creates the output directory (if needed) and an empty sink.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self, EnvError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EnvError::io(&dir, e))?;
        Ok(Self {
            dir,
            files: Mutex::new(Some(HashMap::new())),
        })
    }

    /// Returns the output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Opens a table for this sink's lifetime, replacing any earlier run's rows.
    async fn open(&self, table: &str) -> Result<File, EnvError> {
        let path = self.dir.join(format!("{}.jsonl", table));
        debug!("Opening output table {}", path.display());
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| EnvError::io(&path, e))
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn write(&self, batch: RecordBatch) -> Result<(), EnvError> {
        let mut guard = self.files.lock().await;
        let files = guard.as_mut().ok_or(EnvError::SinkClosed)?;

        if !files.contains_key(&batch.table) {
            let file = self.open(&batch.table).await?;
            files.insert(batch.table.clone(), file);
        }
        let file = files.get_mut(&batch.table).ok_or(EnvError::SinkClosed)?;

        let mut buf = Vec::new();
        for mut row in batch.rows {
            if let Some(obj) = row.as_object_mut() {
                obj.insert("program".into(), batch.program.clone().into());
                obj.insert("replicate".into(), batch.replicate.into());
            }
            serde_json::to_writer(&mut buf, &row)?;
            buf.push(b'\n');
        }

        let path = self.dir.join(format!("{}.jsonl", batch.table));
        file.write_all(&buf).await.map_err(|e| EnvError::io(&path, e))
    }

    async fn close(&self) -> Result<(), EnvError> {
        let mut guard = self.files.lock().await;
        if let Some(files) = guard.take() {
            for (table, mut file) in files {
                file.flush().await.map_err(|e| EnvError::io(self.dir.join(&table), e))?;
            }
        }
        Ok(())
    }
}
