//! Persistence boundary. Records leave the collector in batches through a
//! [`RecordSink`]; the storage engine behind it is not our concern.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::PersistError;
use crate::models::{
    GasPriceSample, LiquidityDepthSample, PriceRecord, ReserveSnapshot, TradingPair,
};

/// Everything one cycle hands to persistence.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub pairs: Vec<TradingPair>,
    pub snapshots: Vec<ReserveSnapshot>,
    pub prices: Vec<PriceRecord>,
    pub depth_samples: Vec<LiquidityDepthSample>,
    pub gas_samples: Vec<GasPriceSample>,
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        self.pairs.len()
            + self.snapshots.len()
            + self.prices.len()
            + self.depth_samples.len()
            + self.gas_samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct pools with at least one record in the batch.
    pub fn affected_pairs(&self) -> usize {
        self.pairs
            .iter()
            .map(|p| p.pool_address)
            .chain(self.snapshots.iter().map(|s| s.pair))
            .collect::<HashSet<_>>()
            .len()
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write the whole batch. Returns the number of records written.
    async fn write_batch(&self, batch: &RecordBatch) -> Result<usize, PersistError>;
}

/// Appends one JSON object per line to `<dir>/<kind>.jsonl`.
pub struct JsonlSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub const TRADING_PAIRS: &'static str = "trading_pairs";
    pub const RESERVE_SNAPSHOTS: &'static str = "reserve_snapshots";
    pub const PRICE_RECORDS: &'static str = "price_records";
    pub const DEPTH_SAMPLES: &'static str = "liquidity_depth_samples";
    pub const GAS_SAMPLES: &'static str = "gas_price_samples";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("{kind}.jsonl"))
    }

    async fn append(path: &Path, lines: &str) -> Result<(), PersistError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Truncate every touched file back to its length before the batch.
    async fn rollback(touched: &[(PathBuf, u64)]) {
        for (path, len) in touched.iter().rev() {
            let truncated = match OpenOptions::new().write(true).open(path).await {
                Ok(file) => file.set_len(*len).await,
                Err(e) => Err(e),
            };
            if let Err(e) = truncated {
                warn!(path = %path.display(), error = %e, "[STORE] rollback failed");
            }
        }
    }
}

async fn file_len(path: &Path) -> std::io::Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

fn to_lines<T: Serialize>(records: &[T]) -> Result<String, PersistError> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}

#[async_trait]
impl RecordSink for JsonlSink {
    async fn write_batch(&self, batch: &RecordBatch) -> Result<usize, PersistError> {
        if batch.is_empty() {
            return Ok(0);
        }
        // Serialize everything up front so an encoding error writes nothing.
        let files = [
            (Self::TRADING_PAIRS, to_lines(&batch.pairs)?),
            (Self::RESERVE_SNAPSHOTS, to_lines(&batch.snapshots)?),
            (Self::PRICE_RECORDS, to_lines(&batch.prices)?),
            (Self::DEPTH_SAMPLES, to_lines(&batch.depth_samples)?),
            (Self::GAS_SAMPLES, to_lines(&batch.gas_samples)?),
        ];

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;
        // Snapshots land before the records derived from them. A failed
        // append undoes the whole batch so a retry cannot duplicate rows.
        let mut touched: Vec<(PathBuf, u64)> = Vec::with_capacity(files.len());
        for (kind, lines) in &files {
            if lines.is_empty() {
                continue;
            }
            let path = self.path_for(kind);
            let appended = match file_len(&path).await {
                Ok(len) => {
                    touched.push((path.clone(), len));
                    Self::append(&path, lines).await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = appended {
                Self::rollback(&touched).await;
                return Err(e);
            }
        }
        debug!(dir = %self.dir.display(), records = batch.len(), "[STORE] batch appended");
        Ok(batch.len())
    }
}

/// Keeps batches in memory. Can be told to fail the next N writes.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<RecordBatch>>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, writes: usize) {
        self.fail_next.store(writes, Ordering::SeqCst);
    }

    /// Write calls seen, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn batches(&self) -> Vec<RecordBatch> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write_batch(&self, batch: &RecordBatch) -> Result<usize, PersistError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistError::WriteFailed("injected failure".into()));
        }
        self.batches.lock().await.push(batch.clone());
        Ok(batch.len())
    }
}
