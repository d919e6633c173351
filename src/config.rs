use std::path::PathBuf;

/// Top-level configuration for the storage core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the backing volume file
    pub path: PathBuf,

    /// Fiber runtime configuration
    pub fiber: FiberConfig,

    /// Disk controller / volume configuration
    pub disk: DiskConfig,

    /// Index manager configuration
    pub index: IndexConfig,
}

#[derive(Debug, Clone)]
pub struct FiberConfig {
    /// Number of OS worker threads multiplexing fibers (default: 4)
    pub worker_threads: usize,

    /// Maximum number of live fiber frames (default: 4096)
    pub max_frames: usize,
}

#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Physical block size in bytes (default: 4KB)
    pub block_size: usize,

    /// Number of I/O threads servicing submissions (default: 2)
    pub io_threads: usize,

    /// Maximum buffered writes per write group before auto-flush (default: 32)
    pub max_group_len: usize,

    /// Blocks reserved for each catalog base image (default: 8)
    pub catalog_image_blocks: u64,

    /// Blocks reserved for the catalog append log (default: 16)
    pub catalog_log_blocks: u64,

    /// Return blocks of superseded generations to the free list (default: true)
    pub reclaim_blocks: bool,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Maximum bytes held in the in-memory sorted buffer before a flush (default: 4MB)
    pub mem_capacity: usize,

    /// On-disk generation count that triggers consolidation (default: 4)
    pub consolidation_threshold: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_frames: 4096,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            io_threads: 2,
            max_group_len: 32,
            catalog_image_blocks: 8,
            catalog_log_blocks: 16,
            reclaim_blocks: true,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            mem_capacity: 4 * 1024 * 1024, // 4MB
            consolidation_threshold: 4,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./emberdb.vol"),
            fiber: FiberConfig::default(),
            disk: DiskConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config with the given volume path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Configure the fiber runtime
    pub fn fiber(mut self, config: FiberConfig) -> Self {
        self.fiber = config;
        self
    }

    /// Configure the disk layer
    pub fn disk(mut self, config: DiskConfig) -> Self {
        self.disk = config;
        self
    }

    /// Configure index managers opened by this engine
    pub fn index(mut self, config: IndexConfig) -> Self {
        self.index = config;
        self
    }
}

impl FiberConfig {
    /// Set worker thread count
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Set the frame pool capacity
    pub fn max_frames(mut self, count: usize) -> Self {
        self.max_frames = count;
        self
    }
}

impl DiskConfig {
    /// Set block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set I/O thread count
    pub fn io_threads(mut self, count: usize) -> Self {
        self.io_threads = count;
        self
    }

    /// Set maximum buffered writes per write group
    pub fn max_group_len(mut self, len: usize) -> Self {
        self.max_group_len = len;
        self
    }

    /// Set blocks reserved per catalog base image
    pub fn catalog_image_blocks(mut self, blocks: u64) -> Self {
        self.catalog_image_blocks = blocks;
        self
    }

    /// Set blocks reserved for the catalog append log
    pub fn catalog_log_blocks(mut self, blocks: u64) -> Self {
        self.catalog_log_blocks = blocks;
        self
    }

    /// Enable or disable block reclamation after consolidation
    pub fn reclaim_blocks(mut self, enabled: bool) -> Self {
        self.reclaim_blocks = enabled;
        self
    }
}

impl IndexConfig {
    /// Set the memory buffer capacity in bytes
    pub fn mem_capacity(mut self, bytes: usize) -> Self {
        self.mem_capacity = bytes;
        self
    }

    /// Set the generation count that triggers consolidation
    pub fn consolidation_threshold(mut self, threshold: usize) -> Self {
        self.consolidation_threshold = threshold;
        self
    }
}
