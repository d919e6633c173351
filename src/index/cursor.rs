//! Merged read cursor over an index snapshot.
//!
//! The cursor walks the in-memory buffer snapshot and every on-disk
//! generation as one sorted stream. The merge sorter surfaces equal keys
//! newest first, so keeping the first occurrence of each key and skipping the
//! rest yields exactly the winning version.

use std::sync::Arc;

use crate::error::{Error, Result};

use super::generation::GenerationCursor;
use super::merge::MergeSorter;
use super::Generation;

/// One input to the merged view.
pub enum Source {
    /// Sorted snapshot of the in-memory buffer.
    Mem(std::vec::IntoIter<(Vec<u8>, Vec<u8>, u64)>),
    /// An on-disk generation.
    Generation {
        cursor: GenerationCursor,
        /// Keeps the generation's extent from being recycled while the
        /// cursor is still paging it.
        pinned: Arc<Generation>,
    },
}

impl Source {
    async fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>, u64)>> {
        match self {
            Source::Mem(iter) => Ok(iter.next()),
            Source::Generation { cursor, .. } => cursor.next_entry().await,
        }
    }
}

pub struct IndexCursor {
    sources: Vec<Source>,
    /// Value and sequence of the entry currently in the sorter, per source.
    staged: Vec<Option<(Vec<u8>, u64)>>,
    sorter: MergeSorter<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl IndexCursor {
    pub async fn new(sources: Vec<Source>) -> Result<Self> {
        let staged = sources.iter().map(|_| None).collect();
        let mut cursor = Self {
            sources,
            staged,
            sorter: MergeSorter::new(),
            last_key: None,
        };
        for source in 0..cursor.sources.len() {
            cursor.refill(source).await?;
        }
        Ok(cursor)
    }

    /// The next live entry as `(key, value, seq)`. Superseded versions of a
    /// key are consumed silently.
    pub async fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>, u64)>> {
        loop {
            let Some((key, source, seq)) = self.sorter.pop() else {
                return Ok(None);
            };
            let staged = self.staged[source]
                .take()
                .ok_or_else(|| Error::InvalidState("cursor source lost its entry".to_string()))?;
            self.refill(source).await?;

            if self.last_key.as_deref() == Some(key.as_slice()) {
                continue;
            }
            self.last_key = Some(key.clone());
            debug_assert_eq!(staged.1, seq);
            return Ok(Some((key, staged.0, seq)));
        }
    }

    /// Advance so the next `next()` returns the first key `>= target`.
    pub async fn seek(&mut self, target: &[u8]) -> Result<()> {
        while let Some(key) = self.sorter.peek() {
            if key.as_slice() >= target {
                break;
            }
            let (key, source, _) = self
                .sorter
                .pop()
                .ok_or_else(|| Error::InvalidState("cursor sorter emptied mid-seek".to_string()))?;
            self.staged[source].take();
            self.refill(source).await?;
            self.last_key = Some(key);
        }
        Ok(())
    }

    async fn refill(&mut self, source: usize) -> Result<()> {
        if let Some((key, value, seq)) = self.sources[source].next_entry().await? {
            self.sorter.push(source, key, seq);
            self.staged[source] = Some((value, seq));
        }
        Ok(())
    }
}
