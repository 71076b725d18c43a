//! Append-only persistence for ledger blocks

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::ledger::{LedgerBlock, LedgerError};

/// Storage the ledger writes sealed blocks to.
///
/// Only sequential append and full sequential read are required. A call to
/// `append` must persist every block in the slice or none of them; a failed
/// append should leave the sink as it was. The ledger re-reads the sink after
/// any failure, so a sink that stored the batch and then reported an error is
/// still counted as written.
#[async_trait]
pub trait LedgerSink: Send + Sync + 'static {
    async fn append(&self, blocks: &[LedgerBlock]) -> Result<(), LedgerError>;

    async fn read_all(&self) -> Result<Vec<LedgerBlock>, LedgerError>;
}

/// Process-local sink
#[derive(Debug, Default)]
pub struct MemorySink {
    blocks: RwLock<Vec<LedgerBlock>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Direct access to stored blocks, for simulating storage-level tampering
    #[cfg(test)]
    pub(crate) fn with_blocks_mut<R>(&self, f: impl FnOnce(&mut Vec<LedgerBlock>) -> R) -> R {
        f(&mut self.blocks.write())
    }
}

#[async_trait]
impl LedgerSink for MemorySink {
    async fn append(&self, blocks: &[LedgerBlock]) -> Result<(), LedgerError> {
        self.blocks.write().extend_from_slice(blocks);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LedgerBlock>, LedgerError> {
        Ok(self.blocks.read().clone())
    }
}

/// JSON-lines file, one block per line
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LedgerSink for FileSink {
    async fn append(&self, blocks: &[LedgerBlock]) -> Result<(), LedgerError> {
        let mut buf = Vec::new();
        for block in blocks {
            serde_json::to_writer(&mut buf, block)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let original_len = file.metadata().await?.len();

        if let Err(e) = write_synced(&mut file, &buf).await {
            // Drop any partial line so the file still ends on a block boundary
            if let Err(truncate) = file.set_len(original_len).await {
                warn!(path = %self.path.display(), error = %truncate, "Failed to truncate after a failed append");
            }
            return Err(e.into());
        }

        debug!(path = %self.path.display(), blocks = blocks.len(), "Appended ledger blocks");
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LedgerBlock>, LedgerError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(LedgerError::from))
            .collect()
    }
}

async fn write_synced(file: &mut tokio::fs::File, buf: &[u8]) -> std::io::Result<()> {
    file.write_all(buf).await?;
    file.flush().await?;
    file.sync_data().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{seal_chain, BlockRecord, CheckpointRecord};

    fn blocks(n: u64) -> Vec<LedgerBlock> {
        let records = (0..n)
            .map(|i| {
                BlockRecord::Checkpoint(CheckpointRecord {
                    through_index: i,
                    routed_blocks: i,
                })
            })
            .collect();
        seal_chain(records).unwrap()
    }

    #[tokio::test]
    async fn test_memory_sink_appends() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        sink.append(&blocks(3)).await.unwrap();

        let indices: Vec<u64> = sink.read_all().await.unwrap().iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(sink.len(), 3);
    }

    #[tokio::test]
    async fn test_file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("ledger.jsonl"));

        assert!(sink.read_all().await.unwrap().is_empty());

        let written = blocks(4);
        sink.append(&written[..2]).await.unwrap();
        sink.append(&written[2..]).await.unwrap();

        assert_eq!(sink.read_all().await.unwrap(), written);
    }

    #[tokio::test]
    async fn test_file_sink_rejects_corrupt_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();

        let err = FileSink::new(&path).read_all().await.unwrap_err();
        assert!(matches!(err, LedgerError::Serialization(_)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_file_sink_reports_failed_write() {
        // Every write to /dev/full fails with ENOSPC
        let sink = FileSink::new("/dev/full");
        let err = sink.append(&blocks(2)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Io(_)));
    }
}
