//! Storage engine: owns the runtime and the volume-wide services.
//!
//! The engine wires together the fiber pool, the backing volume, the disk
//! controller and the file catalog, and hands out index managers that share
//! them. Work enters through [`StorageEngine::launch`] or
//! [`StorageEngine::spawn`].

use std::future::Future;
use std::sync::Arc;

use crate::catalog::FileCatalog;
use crate::config::Config;
use crate::disk::{DiskController, Volume};
use crate::error::Result;
use crate::fiber::FiberPool;
use crate::index::IndexManager;

pub struct StorageEngine {
    config: Config,
    pool: FiberPool,
    controller: Arc<DiskController>,
    volume: Arc<Volume>,
    catalog: Arc<FileCatalog>,
}

impl StorageEngine {
    /// Open the volume at `config.path`, recover the catalog and start the
    /// runtime.
    pub fn open(config: Config) -> Result<Self> {
        let pool = FiberPool::new(config.fiber.clone());
        let controller = Arc::new(DiskController::new(&config.disk));
        let volume = Arc::new(Volume::open(&config.path, &config.disk)?);
        let catalog = FileCatalog::open(&pool, controller.clone(), volume.clone())?;

        tracing::info!(path = %config.path.display(), "Storage engine opened");

        Ok(Self {
            config,
            pool,
            controller,
            volume,
            catalog,
        })
    }

    /// Open (or recover) the index identified by `id`.
    pub fn open_index(&self, id: u64) -> Result<Arc<IndexManager>> {
        IndexManager::open(
            id,
            self.controller.clone(),
            self.volume.clone(),
            self.catalog.clone(),
            &self.config.index,
            &self.config.disk,
        )
    }

    /// Run `fut` on a fiber and block until it completes.
    pub fn launch<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.pool.launch(fut)
    }

    /// Schedule a detached fiber.
    pub fn spawn<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pool.spawn(fut)
    }

    pub fn pool(&self) -> &FiberPool {
        &self.pool
    }

    pub fn catalog(&self) -> &Arc<FileCatalog> {
        &self.catalog
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    /// Drain in-flight I/O, then stop the fiber workers.
    pub fn shutdown(&self) {
        self.controller.shutdown();
        self.pool.shutdown();
        tracing::info!("Storage engine shut down");
    }
}
