//! Storage core: a cooperative fiber runtime over an asynchronous block
//! volume, with a durable file catalog and LSM-style generation indexes.

pub mod catalog;
pub mod config;
pub mod disk;
pub mod engine;
pub mod error;
pub mod fiber;
pub mod index;

#[cfg(test)]
pub mod tmpfs;

pub use catalog::{FileCatalog, FileEntry, FileKind};
pub use config::{Config, DiskConfig, FiberConfig, IndexConfig};
pub use engine::StorageEngine;
pub use error::{Error, Result};
pub use fiber::{CompletionTrigger, FiberPool};
pub use index::{IndexCursor, IndexManager, MergeSorter, SequenceNumber};
