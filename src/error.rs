use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    CorruptedCatalog(String),
    DuplicateCatalogEntry { file_id: u64, generation: u64 },
    CatalogEntryMissing { file_id: u64, generation: u64 },
    FramePoolExhausted,
    StaleFrameHandle,
    RuntimeShutdown,
    CatalogRegionFull,
    InvalidState(String),
    ConsolidationFailed(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::CorruptedCatalog(msg) => write!(f, "Corrupted catalog: {}", msg),
            Error::DuplicateCatalogEntry {
                file_id,
                generation,
            } => write!(
                f,
                "Catalog entry already exists: file {} generation {}",
                file_id, generation
            ),
            Error::CatalogEntryMissing {
                file_id,
                generation,
            } => write!(
                f,
                "Catalog entry not found: file {} generation {}",
                file_id, generation
            ),
            Error::FramePoolExhausted => write!(f, "Frame pool exhausted"),
            Error::StaleFrameHandle => write!(f, "Stale frame handle"),
            Error::RuntimeShutdown => write!(f, "Fiber runtime is shut down"),
            Error::CatalogRegionFull => write!(f, "Reserved catalog region is full"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::ConsolidationFailed(msg) => write!(f, "Consolidation failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
