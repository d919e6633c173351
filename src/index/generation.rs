//! On-volume generation files.
//!
//! A generation is an immutable sorted run of key/value entries occupying a
//! contiguous block extent. Entries are laid out back to back and may span
//! block boundaries:
//!
//! ```text
//! +---------+---------+--------+-----------+-------------+
//! |klen:u32 |vlen:u32 |seq:u64 |    key    |    value    |
//! +---------+---------+--------+-----------+-------------+
//! | 4 bytes | 4 bytes |8 bytes |klen bytes | vlen bytes  |
//! +---------+---------+--------+-----------+-------------+
//! ```
//!
//! The writer streams blocks through a [`WriteGroup`] so contiguous runs land
//! in single disk submissions; the cursor pages blocks back in one at a time
//! through the disk controller.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::config::DiskConfig;
use crate::disk::{BlockRange, DiskController, IoMode, Volume, WriteGroup};
use crate::error::{Error, Result};
use crate::fiber::CompletionTrigger;

const ENTRY_HEADER: usize = 16;

/// Bytes one entry occupies on the volume.
pub fn entry_size(key: &[u8], value: &[u8]) -> u64 {
    (ENTRY_HEADER + key.len() + value.len()) as u64
}

/// Streams sorted entries into a pre-allocated block extent.
pub struct GenerationWriter {
    group: WriteGroup,
    range: BlockRange,
    block: Vec<u8>,
    filled: usize,
    blocks_emitted: u64,
    size: u64,
    key_count: u64,
    seq_lo: u64,
    seq_hi: u64,
    block_size: usize,
}

impl GenerationWriter {
    pub fn new(
        controller: Arc<DiskController>,
        volume: Arc<Volume>,
        config: &DiskConfig,
        range: BlockRange,
    ) -> Self {
        let block_size = volume.block_size();
        Self {
            group: WriteGroup::new(controller, volume, config),
            range,
            block: vec![0u8; block_size],
            filled: 0,
            blocks_emitted: 0,
            size: 0,
            key_count: 0,
            seq_lo: u64::MAX,
            seq_hi: 0,
            block_size,
        }
    }

    /// Append one entry. Keys must arrive in ascending order; the writer does
    /// not re-sort.
    pub async fn append(&mut self, key: &[u8], value: &[u8], seq: u64) -> Result<()> {
        let mut header = [0u8; ENTRY_HEADER];
        BigEndian::write_u32(&mut header[0..4], key.len() as u32);
        BigEndian::write_u32(&mut header[4..8], value.len() as u32);
        BigEndian::write_u64(&mut header[8..16], seq);

        self.push_bytes(&header).await?;
        self.push_bytes(key).await?;
        self.push_bytes(value).await?;

        self.size += entry_size(key, value);
        self.key_count += 1;
        self.seq_lo = self.seq_lo.min(seq);
        self.seq_hi = self.seq_hi.max(seq);
        Ok(())
    }

    /// Flush the trailing partial block and wait for everything to land.
    /// Returns `(size, key_count, seq_lo, seq_hi)`.
    pub async fn finish(mut self) -> Result<(u64, u64, u64, u64)> {
        if self.filled > 0 {
            self.block[self.filled..].fill(0);
            self.emit_block().await?;
        }
        self.group.flush().await?;
        let seq_lo = if self.key_count == 0 { 0 } else { self.seq_lo };
        Ok((self.size, self.key_count, seq_lo, self.seq_hi))
    }

    async fn push_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let room = self.block_size - self.filled;
            let take = room.min(bytes.len());
            self.block[self.filled..self.filled + take].copy_from_slice(&bytes[..take]);
            self.filled += take;
            bytes = &bytes[take..];
            if self.filled == self.block_size {
                self.emit_block().await?;
            }
        }
        Ok(())
    }

    async fn emit_block(&mut self) -> Result<()> {
        if self.blocks_emitted == self.range.count {
            return Err(Error::InvalidState(
                "generation writer overran its extent".to_string(),
            ));
        }
        let block_id = self.range.start + self.blocks_emitted;
        let block = std::mem::replace(&mut self.block, vec![0u8; self.block_size]);
        self.group.append(block_id, block).await?;
        self.blocks_emitted += 1;
        self.filled = 0;
        Ok(())
    }
}

/// Reads a generation's entries back in order, paging one block at a time.
pub struct GenerationCursor {
    controller: Arc<DiskController>,
    volume: Arc<Volume>,
    range: BlockRange,
    key_count: u64,
    entries_read: u64,
    block: Vec<u8>,
    blocks_loaded: u64,
    pos: usize,
}

impl GenerationCursor {
    pub fn new(
        controller: Arc<DiskController>,
        volume: Arc<Volume>,
        range: BlockRange,
        key_count: u64,
    ) -> Self {
        Self {
            controller,
            volume,
            range,
            key_count,
            entries_read: 0,
            block: Vec::new(),
            blocks_loaded: 0,
            pos: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.key_count - self.entries_read
    }

    /// The next `(key, value, seq)`, or `None` past the last entry.
    pub async fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>, u64)>> {
        if self.entries_read == self.key_count {
            return Ok(None);
        }

        let header = self.read_bytes(ENTRY_HEADER).await?;
        let klen = BigEndian::read_u32(&header[0..4]) as usize;
        let vlen = BigEndian::read_u32(&header[4..8]) as usize;
        let seq = BigEndian::read_u64(&header[8..16]);

        let key = self.read_bytes(klen).await?;
        let value = self.read_bytes(vlen).await?;
        self.entries_read += 1;
        Ok(Some((key, value, seq)))
    }

    async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.pos == self.block.len() {
                self.load_next_block().await?;
            }
            let take = (n - out.len()).min(self.block.len() - self.pos);
            out.extend_from_slice(&self.block[self.pos..self.pos + take]);
            self.pos += take;
        }
        Ok(out)
    }

    async fn load_next_block(&mut self) -> Result<()> {
        if self.blocks_loaded == self.range.count {
            return Err(Error::InvalidState(
                "generation cursor ran past its extent".to_string(),
            ));
        }
        let range = BlockRange::new(self.range.start + self.blocks_loaded, 1);
        let trigger = CompletionTrigger::new();
        let event = self.controller.submit(
            &self.volume,
            range,
            vec![0u8; self.volume.block_size()],
            IoMode::Read,
            &trigger,
        )?;
        trigger.wait().await?;

        self.block = event
            .take_buffer()
            .ok_or_else(|| Error::InvalidState("read event returned no buffer".to_string()))?;
        self.blocks_loaded += 1;
        self.pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FiberConfig;
    use crate::fiber::FiberPool;
    use crate::tmpfs::TempDir;

    fn setup(dir: &TempDir, config: &DiskConfig) -> (Arc<Volume>, Arc<DiskController>, FiberPool) {
        let volume = Arc::new(Volume::open(dir.path().join("vol"), config).unwrap());
        let controller = Arc::new(DiskController::new(config));
        let pool = FiberPool::new(FiberConfig::default().worker_threads(2));
        (volume, controller, pool)
    }

    #[test]
    fn test_write_then_cursor_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);
        let (volume, controller, pool) = setup(&dir, &config);

        let entries: Vec<(Vec<u8>, Vec<u8>, u64)> = (0..20u64)
            .map(|i| {
                (
                    format!("key-{:03}", i).into_bytes(),
                    format!("value-{}", i).into_bytes(),
                    i + 100,
                )
            })
            .collect();

        let bytes: u64 = entries.iter().map(|(k, v, _)| entry_size(k, v)).sum();
        let blocks = bytes.div_ceil(512);
        let range = volume.allocate_blocks(blocks);

        let write_entries = entries.clone();
        let wconfig = config.clone();
        let (wvolume, wcontroller) = (volume.clone(), controller.clone());
        let (size, key_count, seq_lo, seq_hi) = pool
            .launch(async move {
                let mut writer = GenerationWriter::new(wcontroller, wvolume, &wconfig, range);
                for (key, value, seq) in &write_entries {
                    writer.append(key, value, *seq).await.unwrap();
                }
                writer.finish().await.unwrap()
            })
            .unwrap();

        assert_eq!(size, bytes);
        assert_eq!(key_count, 20);
        assert_eq!(seq_lo, 100);
        assert_eq!(seq_hi, 119);

        let read_back = pool
            .launch(async move {
                let mut cursor = GenerationCursor::new(controller, volume, range, key_count);
                let mut out = Vec::new();
                while let Some(entry) = cursor.next_entry().await.unwrap() {
                    out.push(entry);
                }
                out
            })
            .unwrap();
        assert_eq!(read_back, entries);
    }

    #[test]
    fn test_entry_spanning_block_boundary() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);
        let (volume, controller, pool) = setup(&dir, &config);

        // One value larger than a block forces the entry across boundaries.
        let big = vec![0x42u8; 1500];
        let bytes = entry_size(b"big", &big);
        let range = volume.allocate_blocks(bytes.div_ceil(512));

        let wbig = big.clone();
        let wconfig = config.clone();
        let (wvolume, wcontroller) = (volume.clone(), controller.clone());
        pool.launch(async move {
            let mut writer = GenerationWriter::new(wcontroller, wvolume, &wconfig, range);
            writer.append(b"big", &wbig, 7).await.unwrap();
            writer.finish().await.unwrap();
        })
        .unwrap();

        let entry = pool
            .launch(async move {
                let mut cursor = GenerationCursor::new(controller, volume, range, 1);
                cursor.next_entry().await.unwrap().unwrap()
            })
            .unwrap();
        assert_eq!(entry, (b"big".to_vec(), big, 7));
    }

    #[test]
    fn test_cursor_stops_at_key_count() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);
        let (volume, controller, pool) = setup(&dir, &config);

        let range = volume.allocate_blocks(1);
        let wconfig = config.clone();
        let (wvolume, wcontroller) = (volume.clone(), controller.clone());
        pool.launch(async move {
            let mut writer = GenerationWriter::new(wcontroller, wvolume, &wconfig, range);
            writer.append(b"a", b"1", 1).await.unwrap();
            writer.append(b"b", b"2", 2).await.unwrap();
            writer.finish().await.unwrap();
        })
        .unwrap();

        pool.launch(async move {
            let mut cursor = GenerationCursor::new(controller, volume, range, 2);
            assert_eq!(cursor.remaining(), 2);
            cursor.next_entry().await.unwrap().unwrap();
            cursor.next_entry().await.unwrap().unwrap();
            assert_eq!(cursor.remaining(), 0);
            assert!(cursor.next_entry().await.unwrap().is_none());
        })
        .unwrap();
    }
}
