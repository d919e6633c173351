//! Durable file catalog.
//!
//! The catalog maps `(file_id, generation)` pairs to the on-volume location
//! and key statistics of each generation file. It lives on blocks reserved at
//! the front of the volume: two base-image extents written alternately, plus
//! an append-log extent for individual mutations.
//!
//! # On-volume format
//!
//! A base image is one framed snapshot of the whole catalog:
//!
//! ```text
//! +-----------+--------------------+-----------+
//! |length:u32 | serialized snapshot|crc32:u32  |
//! +-----------+--------------------+-----------+
//! | 4 bytes   | variable length    | 4 bytes   |
//! +-----------+--------------------+-----------+
//! ```
//!
//! The log extent holds a run of frames in the same shape, each carrying the
//! epoch of the image it extends plus one insert or remove record. When the
//! log fills up, the catalog snapshots itself to the alternate image extent
//! under the next epoch and restarts the log from offset zero; frames left
//! over from the previous epoch are skipped on replay.
//!
//! # Recovery
//!
//! On open, both image extents are decoded and the valid image with the
//! higher epoch wins. Log frames are then replayed from offset zero until the
//! first frame that fails its checksum or carries a stale epoch.
//!
//! # Mutation path
//!
//! Inserts and removes are queued to a runner fiber; the caller's completion
//! trigger is armed at enqueue time and fires once the record is on disk and
//! applied, or with the validation error. Lookups read the in-memory map
//! directly.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};
use futures::channel::mpsc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::disk::{BlockRange, DiskController, IoMode, Volume};
use crate::error::{Error, Result};
use crate::fiber::{CompletionTrigger, FiberPool};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Bytes of framing around each payload: length prefix plus checksum.
const FRAME_OVERHEAD: usize = 8;

/// What a catalog entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// A generation written by an index flush or consolidation.
    Data,
    /// A file pinned by a higher layer; never consolidated away.
    Durable,
}

/// Location and key statistics of one generation file on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub kind: FileKind,
    pub generation: u64,
    pub start_block: u64,
    pub start_offset: u64,
    pub size: u64,
    pub key_count: u64,
    pub seq_lo: u64,
    pub seq_hi: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CatalogRecord {
    Insert { file_id: u64, entry: FileEntry },
    Remove { file_id: u64, generation: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    epoch: u64,
    record: CatalogRecord,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageSnapshot {
    epoch: u64,
    entries: Vec<(u64, FileEntry)>,
}

struct CatalogOp {
    record: CatalogRecord,
    trigger: CompletionTrigger,
}

type FileMap = BTreeMap<(u64, u64), FileEntry>;

/// Durable map of generation files, shared by every index manager on the
/// volume.
pub struct FileCatalog {
    ops: mpsc::UnboundedSender<CatalogOp>,
    files: Arc<RwLock<FileMap>>,
}

impl FileCatalog {
    /// Recover the catalog from the volume's reserved extents and start the
    /// runner fiber that serializes mutations.
    pub fn open(
        pool: &FiberPool,
        controller: Arc<DiskController>,
        volume: Arc<Volume>,
    ) -> Result<Arc<Self>> {
        let block_size = volume.block_size();
        let layout = *volume.layout();

        let image_1 = read_image(&volume, layout.catalog_image_1, block_size)?;
        let image_2 = read_image(&volume, layout.catalog_image_2, block_size)?;
        let (epoch, entries, next_image_first) = match (image_1, image_2) {
            (Some(a), Some(b)) if a.epoch >= b.epoch => (a.epoch, a.entries, false),
            (Some(_), Some(b)) => (b.epoch, b.entries, true),
            (Some(a), None) => (a.epoch, a.entries, false),
            (None, Some(b)) => (b.epoch, b.entries, true),
            (None, None) => (0, Vec::new(), true),
        };

        let mut files: FileMap = entries
            .into_iter()
            .map(|(file_id, entry)| ((file_id, entry.generation), entry))
            .collect();

        let log_bytes = (layout.catalog_log.count as usize) * block_size;
        let mut log_buf = vec![0u8; log_bytes];
        volume.read_blocks(layout.catalog_log, &mut log_buf)?;

        let mut log_len = 0;
        let mut replayed = 0u64;
        while let Some((payload, next)) = decode_frame(&log_buf, log_len) {
            let record: LogRecord = bincode::deserialize(&payload)
                .map_err(|e| Error::CorruptedCatalog(e.to_string()))?;
            if record.epoch != epoch {
                break;
            }
            apply(&mut files, &record.record)?;
            log_len = next;
            replayed += 1;
        }

        tracing::info!(
            epoch,
            entries = files.len(),
            replayed,
            "File catalog recovered"
        );

        let files = Arc::new(RwLock::new(files));
        let (tx, rx) = mpsc::unbounded();
        let runner = Runner {
            controller,
            volume,
            files: files.clone(),
            log_buf,
            log_len,
            epoch,
            next_image_first,
            block_size,
        };
        pool.spawn(runner.run(rx))?;

        Ok(Arc::new(Self { ops: tx, files }))
    }

    /// Queue an insert of `(file_id, entry.generation)`. The trigger fires
    /// once the record is durable, or with `DuplicateCatalogEntry`.
    pub fn insert_file(&self, file_id: u64, entry: FileEntry, trigger: &CompletionTrigger) {
        self.enqueue(CatalogRecord::Insert { file_id, entry }, trigger);
    }

    /// Queue a removal. The trigger fires once the record is durable, or with
    /// `CatalogEntryMissing` when no such entry exists.
    pub fn remove_file(&self, file_id: u64, generation: u64, trigger: &CompletionTrigger) {
        self.enqueue(CatalogRecord::Remove { file_id, generation }, trigger);
    }

    pub fn find_file(&self, file_id: u64, generation: u64) -> Option<FileEntry> {
        self.files
            .read()
            .unwrap()
            .get(&(file_id, generation))
            .copied()
    }

    /// Append the generation numbers recorded for `file_id`, in ascending
    /// order, to `out`.
    pub fn append_generation_set(&self, file_id: u64, out: &mut Vec<u64>) {
        let files = self.files.read().unwrap();
        out.extend(
            files
                .range((file_id, 0)..=(file_id, u64::MAX))
                .map(|((_, generation), _)| *generation),
        );
    }

    pub fn for_each_file(&self, mut cb: impl FnMut(u64, &FileEntry)) {
        for ((file_id, _), entry) in self.files.read().unwrap().iter() {
            cb(*file_id, entry);
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.read().unwrap().len()
    }

    fn enqueue(&self, record: CatalogRecord, trigger: &CompletionTrigger) {
        trigger.wait_for_one_more();
        let op = CatalogOp {
            record,
            trigger: trigger.clone(),
        };
        if self.ops.unbounded_send(op).is_err() {
            trigger.complete(Err(Error::RuntimeShutdown));
        }
    }
}

fn apply(files: &mut FileMap, record: &CatalogRecord) -> Result<()> {
    match record {
        CatalogRecord::Insert { file_id, entry } => {
            let key = (*file_id, entry.generation);
            if files.contains_key(&key) {
                return Err(Error::DuplicateCatalogEntry {
                    file_id: *file_id,
                    generation: entry.generation,
                });
            }
            files.insert(key, *entry);
        }
        CatalogRecord::Remove {
            file_id,
            generation,
        } => {
            if files.remove(&(*file_id, *generation)).is_none() {
                return Err(Error::CatalogEntryMissing {
                    file_id: *file_id,
                    generation: *generation,
                });
            }
        }
    }
    Ok(())
}

struct Runner {
    controller: Arc<DiskController>,
    volume: Arc<Volume>,
    files: Arc<RwLock<FileMap>>,
    log_buf: Vec<u8>,
    log_len: usize,
    epoch: u64,
    /// Which image extent the next snapshot goes to.
    next_image_first: bool,
    block_size: usize,
}

impl Runner {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<CatalogOp>) {
        while let Some(op) = ops.next().await {
            let result = self.handle(&op.record).await;
            op.trigger.complete(result);
        }
        tracing::debug!("Catalog runner stopped");
    }

    async fn handle(&mut self, record: &CatalogRecord) -> Result<()> {
        // Validate against the current map before touching the log so a
        // rejected record never lands on disk.
        {
            let files = self.files.read().unwrap();
            check(&files, record)?;
        }

        self.persist(record).await?;

        let mut files = self.files.write().unwrap();
        apply(&mut files, record)
    }

    async fn persist(&mut self, record: &CatalogRecord) -> Result<()> {
        let payload = bincode::serialize(&LogRecord {
            epoch: self.epoch,
            record: record.clone(),
        })
        .map_err(|e| Error::CorruptedCatalog(e.to_string()))?;
        let frame_len = payload.len() + FRAME_OVERHEAD;

        if frame_len > self.log_buf.len() {
            return Err(Error::CatalogRegionFull);
        }
        if self.log_len + frame_len > self.log_buf.len() {
            self.snapshot().await?;
            // The log restarted under the new epoch; re-encode.
            let payload = bincode::serialize(&LogRecord {
                epoch: self.epoch,
                record: record.clone(),
            })
            .map_err(|e| Error::CorruptedCatalog(e.to_string()))?;
            return self.append_frame(&payload).await;
        }
        self.append_frame(&payload).await
    }

    async fn append_frame(&mut self, payload: &[u8]) -> Result<()> {
        let start = self.log_len;
        encode_frame(payload, &mut self.log_buf[start..]);
        self.log_len = start + payload.len() + FRAME_OVERHEAD;

        // Rewrite only the blocks the frame touches.
        let first_block = start / self.block_size;
        let last_block = (self.log_len - 1) / self.block_size;
        let range = BlockRange::new(
            self.volume.layout().catalog_log.start + first_block as u64,
            (last_block - first_block + 1) as u64,
        );
        let data =
            self.log_buf[first_block * self.block_size..(last_block + 1) * self.block_size].to_vec();

        let trigger = CompletionTrigger::new();
        self.controller
            .submit(&self.volume, range, data, IoMode::Write, &trigger)?;
        trigger.wait().await
    }

    /// Write the full catalog to the alternate image extent under the next
    /// epoch, then restart the log.
    async fn snapshot(&mut self) -> Result<()> {
        let entries: Vec<(u64, FileEntry)> = {
            let files = self.files.read().unwrap();
            files
                .iter()
                .map(|((file_id, _), entry)| (*file_id, *entry))
                .collect()
        };
        let next_epoch = self.epoch + 1;
        let payload = bincode::serialize(&ImageSnapshot {
            epoch: next_epoch,
            entries,
        })
        .map_err(|e| Error::CorruptedCatalog(e.to_string()))?;

        let layout = *self.volume.layout();
        let extent = if self.next_image_first {
            layout.catalog_image_1
        } else {
            layout.catalog_image_2
        };
        let extent_bytes = (extent.count as usize) * self.block_size;
        if payload.len() + FRAME_OVERHEAD > extent_bytes {
            return Err(Error::CatalogRegionFull);
        }

        let blocks_needed = (payload.len() + FRAME_OVERHEAD).div_ceil(self.block_size);
        let mut data = vec![0u8; blocks_needed * self.block_size];
        encode_frame(&payload, &mut data);

        tracing::info!(
            epoch = next_epoch,
            bytes = payload.len(),
            "Snapshotting file catalog"
        );

        let trigger = CompletionTrigger::new();
        self.controller.submit(
            &self.volume,
            BlockRange::new(extent.start, blocks_needed as u64),
            data,
            IoMode::Write,
            &trigger,
        )?;
        trigger.wait().await?;

        // The image is durable; frames under the old epoch are now ignored.
        self.epoch = next_epoch;
        self.next_image_first = !self.next_image_first;
        self.log_len = 0;
        Ok(())
    }
}

fn check(files: &FileMap, record: &CatalogRecord) -> Result<()> {
    match record {
        CatalogRecord::Insert { file_id, entry } => {
            if files.contains_key(&(*file_id, entry.generation)) {
                return Err(Error::DuplicateCatalogEntry {
                    file_id: *file_id,
                    generation: entry.generation,
                });
            }
        }
        CatalogRecord::Remove {
            file_id,
            generation,
        } => {
            if !files.contains_key(&(*file_id, *generation)) {
                return Err(Error::CatalogEntryMissing {
                    file_id: *file_id,
                    generation: *generation,
                });
            }
        }
    }
    Ok(())
}

/// Write `length | payload | crc32` into `out`, which must be large enough.
fn encode_frame(payload: &[u8], out: &mut [u8]) {
    BigEndian::write_u32(&mut out[..4], payload.len() as u32);
    out[4..4 + payload.len()].copy_from_slice(payload);
    BigEndian::write_u32(
        &mut out[4 + payload.len()..8 + payload.len()],
        CRC32.checksum(payload),
    );
}

/// Decode the frame at `offset`, returning its payload and the offset of the
/// next frame. `None` means no valid frame starts there.
fn decode_frame(buf: &[u8], offset: usize) -> Option<(Vec<u8>, usize)> {
    if offset + 4 > buf.len() {
        return None;
    }
    let len = BigEndian::read_u32(&buf[offset..]) as usize;
    if len == 0 || offset + FRAME_OVERHEAD + len > buf.len() {
        return None;
    }
    let payload = &buf[offset + 4..offset + 4 + len];
    let stored = BigEndian::read_u32(&buf[offset + 4 + len..]);
    if CRC32.checksum(payload) != stored {
        return None;
    }
    Some((payload.to_vec(), offset + FRAME_OVERHEAD + len))
}

fn read_image(volume: &Volume, extent: BlockRange, block_size: usize) -> Result<Option<ImageSnapshot>> {
    let mut buf = vec![0u8; (extent.count as usize) * block_size];
    volume.read_blocks(extent, &mut buf)?;
    let Some((payload, _)) = decode_frame(&buf, 0) else {
        return Ok(None);
    };
    match bincode::deserialize::<ImageSnapshot>(&payload) {
        Ok(image) => Ok(Some(image)),
        // A torn image is recoverable as long as the other extent is intact.
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskConfig, FiberConfig};
    use crate::tmpfs::TempDir;

    struct Harness {
        pool: FiberPool,
        controller: Arc<DiskController>,
        volume: Arc<Volume>,
    }

    fn harness(dir: &TempDir, config: &DiskConfig) -> Harness {
        let volume = Arc::new(Volume::open(dir.path().join("vol"), config).unwrap());
        Harness {
            pool: FiberPool::new(FiberConfig::default().worker_threads(2)),
            controller: Arc::new(DiskController::new(config)),
            volume,
        }
    }

    fn entry(generation: u64) -> FileEntry {
        FileEntry {
            kind: FileKind::Data,
            generation,
            start_block: 100 + generation,
            start_offset: 0,
            size: 4096,
            key_count: 10,
            seq_lo: generation * 100,
            seq_hi: generation * 100 + 99,
        }
    }

    fn insert_sync(catalog: &FileCatalog, file_id: u64, e: FileEntry) -> Result<()> {
        let trigger = CompletionTrigger::new();
        catalog.insert_file(file_id, e, &trigger);
        trigger.wait_sync()
    }

    fn remove_sync(catalog: &FileCatalog, file_id: u64, generation: u64) -> Result<()> {
        let trigger = CompletionTrigger::new();
        catalog.remove_file(file_id, generation, &trigger);
        trigger.wait_sync()
    }

    #[test]
    fn test_insert_and_find() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);
        let h = harness(&dir, &config);
        let catalog =
            FileCatalog::open(&h.pool, h.controller.clone(), h.volume.clone()).unwrap();

        insert_sync(&catalog, 7, entry(1)).unwrap();

        let found = catalog.find_file(7, 1).unwrap();
        assert_eq!(found.start_block, 101);
        assert!(catalog.find_file(7, 2).is_none());
        assert!(catalog.find_file(8, 1).is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);
        let h = harness(&dir, &config);
        let catalog =
            FileCatalog::open(&h.pool, h.controller.clone(), h.volume.clone()).unwrap();

        insert_sync(&catalog, 7, entry(1)).unwrap();
        let err = insert_sync(&catalog, 7, entry(1)).unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateCatalogEntry {
                file_id: 7,
                generation: 1
            }
        ));
        assert_eq!(catalog.file_count(), 1);
    }

    #[test]
    fn test_remove_missing_rejected() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);
        let h = harness(&dir, &config);
        let catalog =
            FileCatalog::open(&h.pool, h.controller.clone(), h.volume.clone()).unwrap();

        let err = remove_sync(&catalog, 7, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::CatalogEntryMissing {
                file_id: 7,
                generation: 1
            }
        ));
    }

    #[test]
    fn test_generation_set_is_ordered() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);
        let h = harness(&dir, &config);
        let catalog =
            FileCatalog::open(&h.pool, h.controller.clone(), h.volume.clone()).unwrap();

        insert_sync(&catalog, 7, entry(3)).unwrap();
        insert_sync(&catalog, 7, entry(1)).unwrap();
        insert_sync(&catalog, 9, entry(2)).unwrap();

        let mut generations = Vec::new();
        catalog.append_generation_set(7, &mut generations);
        assert_eq!(generations, vec![1, 3]);
    }

    #[test]
    fn test_recovery_from_log() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);

        {
            let h = harness(&dir, &config);
            let catalog =
                FileCatalog::open(&h.pool, h.controller.clone(), h.volume.clone()).unwrap();
            insert_sync(&catalog, 7, entry(1)).unwrap();
            insert_sync(&catalog, 7, entry(2)).unwrap();
            remove_sync(&catalog, 7, 1).unwrap();
        }

        let h = harness(&dir, &config);
        let catalog = FileCatalog::open(&h.pool, h.controller.clone(), h.volume.clone()).unwrap();
        assert!(catalog.find_file(7, 1).is_none());
        assert!(catalog.find_file(7, 2).is_some());
        assert_eq!(catalog.file_count(), 1);
    }

    #[test]
    fn test_log_overflow_snapshots_and_recovers() {
        let dir = TempDir::new().unwrap();
        // A one-block log forces a snapshot every few records.
        let config = DiskConfig::default()
            .block_size(512)
            .catalog_image_blocks(8)
            .catalog_log_blocks(1);

        {
            let h = harness(&dir, &config);
            let catalog =
                FileCatalog::open(&h.pool, h.controller.clone(), h.volume.clone()).unwrap();
            for generation in 0..50 {
                insert_sync(&catalog, 7, entry(generation)).unwrap();
            }
        }

        let h = harness(&dir, &config);
        let catalog = FileCatalog::open(&h.pool, h.controller.clone(), h.volume.clone()).unwrap();
        assert_eq!(catalog.file_count(), 50);
        for generation in 0..50 {
            assert!(catalog.find_file(7, generation).is_some());
        }
    }

    #[test]
    fn test_for_each_file_visits_all() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);
        let h = harness(&dir, &config);
        let catalog =
            FileCatalog::open(&h.pool, h.controller.clone(), h.volume.clone()).unwrap();

        insert_sync(&catalog, 1, entry(1)).unwrap();
        insert_sync(&catalog, 2, entry(1)).unwrap();

        let mut seen = Vec::new();
        catalog.for_each_file(|file_id, e| seen.push((file_id, e.generation)));
        assert_eq!(seen, vec![(1, 1), (2, 1)]);
    }
}
