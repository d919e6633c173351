//! File-backed block volume.
//!
//! The volume is addressed in fixed-size blocks. The front of the volume is
//! reserved for the file catalog (two base-image extents plus an append-log
//! extent); everything after that is the data region handed out by the block
//! allocator. Blocks of superseded generations are returned to a free list
//! and recycled before the volume grows.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::DiskConfig;
use crate::error::Result;

use super::controller::BlockRange;

/// Block extents reserved for the catalog, fixed at volume creation.
#[derive(Debug, Clone, Copy)]
pub struct VolumeLayout {
    pub catalog_image_1: BlockRange,
    pub catalog_image_2: BlockRange,
    pub catalog_log: BlockRange,
    pub data_start: u64,
}

struct Allocator {
    next_block: u64,
    free: Vec<BlockRange>,
}

pub struct Volume {
    file: File,
    path: PathBuf,
    block_size: usize,
    layout: VolumeLayout,
    alloc: Mutex<Allocator>,
}

impl Volume {
    /// Create or reopen the volume file at `path`.
    pub fn open(path: impl AsRef<Path>, config: &DiskConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let image_1 = BlockRange::new(0, config.catalog_image_blocks);
        let image_2 = BlockRange::new(image_1.end(), config.catalog_image_blocks);
        let log = BlockRange::new(image_2.end(), config.catalog_log_blocks);
        let layout = VolumeLayout {
            catalog_image_1: image_1,
            catalog_image_2: image_2,
            catalog_log: log,
            data_start: log.end(),
        };

        // The data-region high-water mark is implied by the file length;
        // free-list state is not persisted and resets on reopen.
        let len_blocks = file.metadata()?.len() / config.block_size as u64;
        let next_block = len_blocks.max(layout.data_start);

        // A fresh volume is shorter than the reserved region; extend it so
        // catalog recovery reads zeroed extents instead of hitting EOF.
        let reserved_bytes = layout.data_start * config.block_size as u64;
        if file.metadata()?.len() < reserved_bytes {
            file.set_len(reserved_bytes)?;
        }

        Ok(Self {
            file,
            path,
            block_size: config.block_size,
            layout,
            alloc: Mutex::new(Allocator {
                next_block,
                free: Vec::new(),
            }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate a contiguous extent of `count` blocks from the data region.
    pub fn allocate_blocks(&self, count: u64) -> BlockRange {
        let mut alloc = self.alloc.lock().unwrap();
        if let Some(pos) = alloc.free.iter().position(|r| r.count >= count) {
            let range = alloc.free[pos];
            if range.count == count {
                alloc.free.swap_remove(pos);
                return range;
            }
            alloc.free[pos] = BlockRange::new(range.start + count, range.count - count);
            return BlockRange::new(range.start, count);
        }
        let start = alloc.next_block;
        alloc.next_block += count;
        BlockRange::new(start, count)
    }

    /// Return a data-region extent to the free list.
    pub fn release_blocks(&self, range: BlockRange) {
        debug_assert!(range.start >= self.layout.data_start);
        self.alloc.lock().unwrap().free.push(range);
    }

    /// Blocks allocated from the data region and not yet released.
    pub fn allocated_blocks(&self) -> u64 {
        let alloc = self.alloc.lock().unwrap();
        let freed: u64 = alloc.free.iter().map(|r| r.count).sum();
        alloc.next_block - self.layout.data_start - freed
    }

    pub fn read_blocks(&self, range: BlockRange, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), (range.count as usize) * self.block_size);
        self.file
            .read_exact_at(buf, range.start * self.block_size as u64)?;
        Ok(())
    }

    pub fn write_blocks(&self, range: BlockRange, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), (range.count as usize) * self.block_size);
        self.file
            .write_all_at(buf, range.start * self.block_size as u64)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn test_volume(dir: &TempDir) -> Volume {
        let config = DiskConfig::default().block_size(512);
        Volume::open(dir.path().join("vol"), &config).unwrap()
    }

    #[test]
    fn test_layout_reserves_catalog_region() {
        let dir = TempDir::new().unwrap();
        let vol = test_volume(&dir);
        let layout = vol.layout();
        assert_eq!(layout.catalog_image_1.start, 0);
        assert_eq!(layout.catalog_image_2.start, layout.catalog_image_1.end());
        assert_eq!(layout.catalog_log.start, layout.catalog_image_2.end());
        assert_eq!(layout.data_start, layout.catalog_log.end());
    }

    #[test]
    fn test_new_volume_reserved_region_is_readable() {
        let dir = TempDir::new().unwrap();
        let vol = test_volume(&dir);
        let layout = *vol.layout();

        // A never-written volume must serve zeroed catalog extents.
        let mut log = vec![0xffu8; (layout.catalog_log.count as usize) * 512];
        vol.read_blocks(layout.catalog_log, &mut log).unwrap();
        assert!(log.iter().all(|b| *b == 0));

        let mut image = vec![0xffu8; (layout.catalog_image_1.count as usize) * 512];
        vol.read_blocks(layout.catalog_image_1, &mut image).unwrap();
        assert!(image.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_block_round_trip() {
        let dir = TempDir::new().unwrap();
        let vol = test_volume(&dir);

        let range = vol.allocate_blocks(2);
        let data = vec![0xabu8; 1024];
        vol.write_blocks(range, &data).unwrap();

        let mut out = vec![0u8; 1024];
        vol.read_blocks(range, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_allocator_recycles_released_blocks() {
        let dir = TempDir::new().unwrap();
        let vol = test_volume(&dir);

        let a = vol.allocate_blocks(4);
        let _b = vol.allocate_blocks(4);
        vol.release_blocks(a);
        assert_eq!(vol.allocated_blocks(), 4);

        // Smaller request splits the freed extent.
        let c = vol.allocate_blocks(2);
        assert_eq!(c.start, a.start);
        let d = vol.allocate_blocks(2);
        assert_eq!(d.start, a.start + 2);
    }

    #[test]
    fn test_reopen_preserves_high_water_mark() {
        let dir = TempDir::new().unwrap();
        let config = DiskConfig::default().block_size(512);
        let path = dir.path().join("vol");

        let first = {
            let vol = Volume::open(&path, &config).unwrap();
            let range = vol.allocate_blocks(3);
            vol.write_blocks(range, &vec![7u8; 3 * 512]).unwrap();
            vol.sync().unwrap();
            range
        };

        let vol = Volume::open(&path, &config).unwrap();
        let next = vol.allocate_blocks(1);
        assert!(next.start >= first.end());
    }
}
