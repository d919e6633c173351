//! Write group: coalesces block writes into contiguous runs.
//!
//! Generation writers emit one block at a time. Buffering those blocks here
//! and submitting each contiguous run as a single disk operation keeps the
//! submission count proportional to the number of runs, not the number of
//! blocks. A write whose block id does not extend the buffered run flushes
//! the run first; reaching `max_group_len` buffered blocks flushes
//! automatically.

use std::sync::Arc;

use crate::config::DiskConfig;
use crate::error::Result;
use crate::fiber::CompletionTrigger;

use super::controller::{BlockRange, DiskController, IoMode};
use super::volume::Volume;

struct BufferedWrite {
    block_id: u64,
    buf: Vec<u8>,
}

pub struct WriteGroup {
    controller: Arc<DiskController>,
    volume: Arc<Volume>,
    pending: Vec<BufferedWrite>,
    max_group_len: usize,
}

impl WriteGroup {
    pub fn new(
        controller: Arc<DiskController>,
        volume: Arc<Volume>,
        config: &DiskConfig,
    ) -> Self {
        Self {
            controller,
            volume,
            pending: Vec::with_capacity(config.max_group_len),
            max_group_len: config.max_group_len,
        }
    }

    /// Buffer one block write. `buf` must be exactly one block long.
    pub async fn append(&mut self, block_id: u64, buf: Vec<u8>) -> Result<()> {
        debug_assert_eq!(buf.len(), self.volume.block_size());

        if let Some(last) = self.pending.last() {
            if last.block_id + 1 != block_id {
                self.flush().await?;
            }
        }
        self.pending.push(BufferedWrite { block_id, buf });

        if self.pending.len() == self.max_group_len {
            self.flush().await?;
        }
        Ok(())
    }

    /// Submit the buffered run as one write and wait for it to land on disk.
    /// Flushing an empty group is a no-op.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let start = self.pending[0].block_id;
        let count = self.pending.len() as u64;
        let mut data = Vec::with_capacity(self.pending.len() * self.volume.block_size());
        for write in self.pending.drain(..) {
            data.extend_from_slice(&write.buf);
        }

        tracing::debug!(start, count, "Flushing write group");

        let trigger = CompletionTrigger::new();
        self.controller.submit(
            &self.volume,
            BlockRange::new(start, count),
            data,
            IoMode::Write,
            &trigger,
        )?;
        trigger.wait().await
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
