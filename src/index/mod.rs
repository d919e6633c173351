//! Generation index manager.
//!
//! An index keeps its newest entries in an in-memory sorted buffer and the
//! rest in immutable on-disk generations. Filling the buffer flushes it as a
//! new generation; accumulating enough generations consolidates the oldest
//! ones into one merged generation. Every entry carries the sequence number
//! assigned at emplace time and the highest sequence number wins whenever a
//! key appears more than once.
//!
//! Readers never block writers: lookups and cursors operate on snapshots
//! taken from atomically swapped `Arc`s, while emplace, flush and
//! consolidation serialize on one async lock.

pub mod cursor;
pub mod generation;
pub mod merge;

pub use cursor::{IndexCursor, Source};
pub use generation::{GenerationCursor, GenerationWriter};
pub use merge::MergeSorter;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::catalog::{FileCatalog, FileEntry, FileKind};
use crate::config::{DiskConfig, IndexConfig};
use crate::disk::{BlockRange, DiskController, Volume};
use crate::error::Result;
use crate::fiber::CompletionTrigger;

/// Monotonic stamp assigned to each emplace; higher wins.
pub type SequenceNumber = u64;

/// One immutable on-disk generation.
pub struct Generation {
    pub generation: u64,
    pub range: BlockRange,
    pub size: u64,
    pub key_count: u64,
    pub seq_lo: u64,
    pub seq_hi: u64,
    volume: Arc<Volume>,
    retired: AtomicBool,
}

impl Generation {
    fn from_entry(entry: &FileEntry, volume: &Arc<Volume>) -> Self {
        let block_size = volume.block_size() as u64;
        Self {
            generation: entry.generation,
            range: BlockRange::new(entry.start_block, entry.size.div_ceil(block_size)),
            size: entry.size,
            key_count: entry.key_count,
            seq_lo: entry.seq_lo,
            seq_hi: entry.seq_hi,
            volume: volume.clone(),
            retired: AtomicBool::new(false),
        }
    }

    /// Mark the extent for release once the last reference drops. Open
    /// cursors pin superseded generations, so the blocks stay valid until
    /// every reader moved on.
    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn to_entry(&self) -> FileEntry {
        FileEntry {
            kind: FileKind::Data,
            generation: self.generation,
            start_block: self.range.start,
            start_offset: 0,
            size: self.size,
            key_count: self.key_count,
            seq_lo: self.seq_lo,
            seq_hi: self.seq_hi,
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        if *self.retired.get_mut() {
            self.volume.release_blocks(self.range);
        }
    }
}

struct MemBuffer {
    entries: SkipMap<Vec<u8>, (Vec<u8>, SequenceNumber)>,
    bytes: AtomicU64,
}

impl MemBuffer {
    fn new() -> Self {
        Self {
            entries: SkipMap::new(),
            bytes: AtomicU64::new(0),
        }
    }

    fn insert(&self, key: &[u8], value: &[u8], seq: SequenceNumber) {
        self.bytes
            .fetch_add(generation::entry_size(key, value), Ordering::SeqCst);
        self.entries
            .insert(key.to_vec(), (value.to_vec(), seq));
    }

    /// Approximate occupancy; overwrites count twice until the next flush.
    fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>, SequenceNumber)> {
        self.entries
            .iter()
            .map(|e| {
                let (value, seq) = e.value().clone();
                (e.key().clone(), value, seq)
            })
            .collect()
    }
}

pub struct IndexManager {
    id: u64,
    config: IndexConfig,
    disk_config: DiskConfig,
    controller: Arc<DiskController>,
    volume: Arc<Volume>,
    catalog: Arc<FileCatalog>,
    mem: RwLock<Arc<MemBuffer>>,
    generations: RwLock<Arc<Vec<Arc<Generation>>>>,
    next_seq: AtomicU64,
    next_generation: AtomicU64,
    write_lock: futures::lock::Mutex<()>,
    #[cfg(test)]
    fail_consolidation_publish: AtomicBool,
}

impl IndexManager {
    /// Open index `id`, rebuilding its generation list from the catalog.
    pub fn open(
        id: u64,
        controller: Arc<DiskController>,
        volume: Arc<Volume>,
        catalog: Arc<FileCatalog>,
        config: &IndexConfig,
        disk_config: &DiskConfig,
    ) -> Result<Arc<Self>> {
        let mut gen_ids = Vec::new();
        catalog.append_generation_set(id, &mut gen_ids);

        let mut generations = Vec::with_capacity(gen_ids.len());
        let mut next_seq = 0;
        let mut next_generation = 0;
        for gen_id in gen_ids {
            if let Some(entry) = catalog.find_file(id, gen_id) {
                next_seq = next_seq.max(entry.seq_hi + 1);
                next_generation = next_generation.max(gen_id + 1);
                match entry.kind {
                    FileKind::Data => {
                        generations.push(Arc::new(Generation::from_entry(&entry, &volume)))
                    }
                    // Pinned files are not index generations.
                    FileKind::Durable => {}
                }
            }
        }
        generations.sort_by_key(|g| g.seq_lo);

        tracing::info!(
            index = id,
            generations = generations.len(),
            next_seq,
            "Index manager opened"
        );

        Ok(Arc::new(Self {
            id,
            config: config.clone(),
            disk_config: disk_config.clone(),
            controller,
            volume,
            catalog,
            mem: RwLock::new(Arc::new(MemBuffer::new())),
            generations: RwLock::new(Arc::new(generations)),
            next_seq: AtomicU64::new(next_seq),
            next_generation: AtomicU64::new(next_generation),
            write_lock: futures::lock::Mutex::new(()),
            #[cfg(test)]
            fail_consolidation_publish: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation_count(&self) -> usize {
        self.generations.read().unwrap().len()
    }

    pub fn mem_entry_count(&self) -> usize {
        self.mem.read().unwrap().entries.len()
    }

    /// Insert or overwrite `key`, returning the sequence number assigned to
    /// this version. A buffer that cannot also hold the new entry is flushed
    /// to disk first.
    pub async fn emplace(&self, key: &[u8], value: &[u8]) -> Result<SequenceNumber> {
        let _guard = self.write_lock.lock().await;

        let needs_flush = {
            let mem = self.mem.read().unwrap().clone();
            let incoming = generation::entry_size(key, value);
            mem.bytes() > 0 && mem.bytes() + incoming > self.config.mem_capacity as u64
        };
        if needs_flush {
            self.flush_locked().await?;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mem = self.mem.read().unwrap().clone();
        mem.insert(key, value, seq);
        Ok(seq)
    }

    /// The newest value recorded for `key`, with its sequence number.
    pub async fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, SequenceNumber)>> {
        // The memory buffer always holds the newest version of its keys.
        // The entry guard borrows the map, so the value is cloned out before
        // the buffer snapshot goes away.
        let cached = {
            let mem = self.mem.read().unwrap().clone();
            mem.entries.get(key).map(|entry| entry.value().clone())
        };
        if let Some(found) = cached {
            return Ok(Some(found));
        }

        let mut cursor = self.cursor_from(key).await?;
        match cursor.next().await? {
            Some((found, value, seq)) if found == key => Ok(Some((value, seq))),
            _ => Ok(None),
        }
    }

    /// A merged cursor over the current snapshot: memory buffer plus every
    /// published generation.
    pub async fn cursor(&self) -> Result<IndexCursor> {
        let mem = self.mem.read().unwrap().clone();
        let generations = self.generations.read().unwrap().clone();

        let mut sources: Vec<Source> = generations
            .iter()
            .map(|g| Source::Generation {
                cursor: GenerationCursor::new(
                    self.controller.clone(),
                    self.volume.clone(),
                    g.range,
                    g.key_count,
                ),
                pinned: g.clone(),
            })
            .collect();
        sources.push(Source::Mem(mem.snapshot().into_iter()));
        IndexCursor::new(sources).await
    }

    /// A merged cursor positioned at the first key `>= hint`.
    pub async fn cursor_from(&self, hint: &[u8]) -> Result<IndexCursor> {
        let mut cursor = self.cursor().await?;
        cursor.seek(hint).await?;
        Ok(cursor)
    }

    /// Force the memory buffer out as a generation.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.flush_locked().await
    }

    /// Merge the oldest generations into one, regardless of the threshold.
    pub async fn consolidate(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.consolidate_locked().await
    }

    async fn flush_locked(&self) -> Result<()> {
        let mem = self.mem.read().unwrap().clone();
        let snapshot = mem.snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }

        let bytes: u64 = snapshot
            .iter()
            .map(|(k, v, _)| generation::entry_size(k, v))
            .sum();
        let range = self
            .volume
            .allocate_blocks(bytes.div_ceil(self.volume.block_size() as u64));
        let gen_id = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let (size, key_count, seq_lo, seq_hi) = match self.write_entries(&snapshot, range).await {
            Ok(stats) => stats,
            Err(err) => {
                self.volume.release_blocks(range);
                return Err(err);
            }
        };

        let generation = Arc::new(Generation {
            generation: gen_id,
            range,
            size,
            key_count,
            seq_lo,
            seq_hi,
            volume: self.volume.clone(),
            retired: AtomicBool::new(false),
        });

        // Durable in the catalog before it becomes visible to readers. A
        // queued record may already be on disk when the wait fails, so the
        // extent is leaked on that path instead of released.
        let trigger = CompletionTrigger::new();
        self.catalog
            .insert_file(self.id, generation.to_entry(), &trigger);
        trigger.wait().await?;

        // Publish the generation first, then retire the buffer; during the
        // window in between, readers see the flushed keys twice with equal
        // sequence numbers and key dedup picks one.
        {
            let mut generations = self.generations.write().unwrap();
            let mut list = (**generations).clone();
            list.push(generation);
            *generations = Arc::new(list);
        }
        *self.mem.write().unwrap() = Arc::new(MemBuffer::new());

        tracing::info!(
            index = self.id,
            generation = gen_id,
            key_count,
            size,
            "Flushed memory buffer to generation"
        );

        if self.generation_count() >= self.config.consolidation_threshold {
            self.consolidate_locked().await?;
        }
        Ok(())
    }

    async fn consolidate_locked(&self) -> Result<()> {
        let generations = self.generations.read().unwrap().clone();
        let take = generations
            .len()
            .min(self.config.consolidation_threshold);
        if take < 2 {
            return Ok(());
        }
        let victims: Vec<Arc<Generation>> = generations[..take].to_vec();
        let survivors: Vec<Arc<Generation>> = generations[take..].to_vec();

        // Upper-bound allocation; unused tail blocks go back to the free
        // list once the merged size is known.
        let max_bytes: u64 = victims.iter().map(|g| g.size).sum();
        let block_size = self.volume.block_size() as u64;
        let range = self.volume.allocate_blocks(max_bytes.div_ceil(block_size));
        let gen_id = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let (size, key_count, seq_lo, seq_hi) = match self.merge_victims(&victims, range).await {
            Ok(stats) => stats,
            Err(err) => {
                self.volume.release_blocks(range);
                return Err(err);
            }
        };

        let used_blocks = size.div_ceil(block_size);
        if used_blocks < range.count {
            self.volume
                .release_blocks(BlockRange::new(range.start + used_blocks, range.count - used_blocks));
        }

        #[cfg(test)]
        if self.fail_consolidation_publish.load(Ordering::SeqCst) {
            self.volume
                .release_blocks(BlockRange::new(range.start, used_blocks));
            return Err(crate::error::Error::ConsolidationFailed(
                "fault injected before catalog publish".to_string(),
            ));
        }

        let merged = Arc::new(Generation {
            generation: gen_id,
            range: BlockRange::new(range.start, used_blocks),
            size,
            key_count,
            seq_lo,
            seq_hi,
            volume: self.volume.clone(),
            retired: AtomicBool::new(false),
        });

        // One trigger fans in the insert and every removal; the catalog
        // runner applies them in order. Queued records may already be
        // durable when the wait fails, so the merged extent is leaked on
        // that path instead of released.
        let trigger = CompletionTrigger::new();
        self.catalog.insert_file(self.id, merged.to_entry(), &trigger);
        for victim in &victims {
            self.catalog
                .remove_file(self.id, victim.generation, &trigger);
        }
        trigger.wait().await?;

        {
            let mut generations = self.generations.write().unwrap();
            let mut list = Vec::with_capacity(1 + survivors.len());
            list.push(merged);
            list.extend(survivors);
            *generations = Arc::new(list);
        }

        // Open cursors still pin the victims; each extent returns to the
        // free list only when the last reference to its generation drops.
        if self.disk_config.reclaim_blocks {
            for victim in &victims {
                victim.retire();
            }
        }

        tracing::info!(
            index = self.id,
            generation = gen_id,
            merged = victims.len(),
            key_count,
            "Consolidated generations"
        );
        Ok(())
    }

    async fn write_entries(
        &self,
        entries: &[(Vec<u8>, Vec<u8>, SequenceNumber)],
        range: BlockRange,
    ) -> Result<(u64, u64, u64, u64)> {
        let mut writer = GenerationWriter::new(
            self.controller.clone(),
            self.volume.clone(),
            &self.disk_config,
            range,
        );
        for (key, value, seq) in entries {
            writer.append(key, value, *seq).await?;
        }
        writer.finish().await
    }

    async fn merge_victims(
        &self,
        victims: &[Arc<Generation>],
        range: BlockRange,
    ) -> Result<(u64, u64, u64, u64)> {
        let sources: Vec<Source> = victims
            .iter()
            .map(|g| Source::Generation {
                cursor: GenerationCursor::new(
                    self.controller.clone(),
                    self.volume.clone(),
                    g.range,
                    g.key_count,
                ),
                pinned: g.clone(),
            })
            .collect();
        let mut cursor = IndexCursor::new(sources).await?;
        let mut writer = GenerationWriter::new(
            self.controller.clone(),
            self.volume.clone(),
            &self.disk_config,
            range,
        );
        while let Some((key, value, seq)) = cursor.next().await? {
            writer.append(&key, &value, seq).await?;
        }
        writer.finish().await
    }

    #[cfg(test)]
    fn fail_next_consolidation(&self, fail: bool) {
        self.fail_consolidation_publish.store(fail, Ordering::SeqCst);
    }
}
