//! Chunked, paced delivery of payloads to the printer's write characteristic.
//!
//! Pacing is a cooperative sleep; callers must not hold the bridge lock while
//! a transfer is running.

use std::time::Duration;

use uuid::Uuid;

use crate::adapter::{BleAdapter, PeripheralId, WriteMode};
use crate::config::BridgeConfig;
use crate::{BridgeError, Result};

/// Peripheral and characteristic a transfer is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTarget {
    pub peripheral: PeripheralId,
    pub characteristic: Uuid,
}

/// Splits payloads into fixed-size chunks and writes them with a pause in
/// between.
#[derive(Debug, Clone)]
pub struct WritePipeline {
    chunk_size: usize,
    pacing: Duration,
    mode: WriteMode,
}

impl WritePipeline {
    pub fn new(chunk_size: usize, pacing: Duration, mode: WriteMode) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pacing,
            mode,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        let mode = if config.confirm_writes {
            WriteMode::WithResponse
        } else {
            WriteMode::WithoutResponse
        };
        Self::new(config.chunk_size, config.chunk_pacing, mode)
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Number of writes `len` bytes will take.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Write `data` in chunks. Returns the number of chunks issued.
    ///
    /// Stops at the first adapter error.
    pub async fn write_chunked<A: BleAdapter + ?Sized>(
        &self,
        adapter: &A,
        target: &WriteTarget,
        data: &[u8],
    ) -> Result<usize> {
        let chunks: Vec<&[u8]> = data.chunks(self.chunk_size).collect();
        tracing::debug!(
            chunk_count = chunks.len(),
            chunk_size = self.chunk_size,
            total_bytes = data.len(),
            "Writing data in chunks"
        );

        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            tracing::debug!(chunk = i + 1, size = chunk.len(), "Writing chunk");
            adapter
                .write(&target.peripheral, target.characteristic, chunk, self.mode)
                .await
                .map_err(|e| {
                    BridgeError::Write(format!("chunk {}/{}: {}", i + 1, chunks.len(), e))
                })?;
        }

        Ok(chunks.len())
    }

    /// Write `data` as a single unchunked write.
    pub async fn write_once<A: BleAdapter + ?Sized>(
        &self,
        adapter: &A,
        target: &WriteTarget,
        data: &[u8],
    ) -> Result<()> {
        tracing::debug!(total_bytes = data.len(), "Writing data unchunked");
        adapter
            .write(&target.peripheral, target.characteristic, data, self.mode)
            .await
            .map_err(|e| BridgeError::Write(e.to_string()))
    }
}
