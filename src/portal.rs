//! One handle over the whole engine, sharing a store and a clock.
use crate::activity::ActivityLog;
use crate::archive::ArchiveService;
use crate::clock::{Clock, SystemClock};
use crate::directory::Directory;
use crate::error::Result;
use crate::executor::OrderService;
use crate::hierarchy::HierarchyResolver;
use crate::store::Store;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct Portal {
    store: Store,
    pub directory: Directory,
    pub resolver: HierarchyResolver,
    pub orders: OrderService,
    pub activity: ActivityLog,
    pub archive: ArchiveService,
}

impl Portal {
    pub fn new(store: Store, clock: Arc<dyn Clock>, retention_days: i64) -> Self {
        let directory = Directory::new(store.clone(), Arc::clone(&clock));
        let resolver = HierarchyResolver::new(directory.clone());
        Self {
            orders: OrderService::new(store.clone(), resolver.clone(), Arc::clone(&clock)),
            activity: ActivityLog::new(store.clone(), Arc::clone(&clock)),
            archive: ArchiveService::new(store.clone(), directory.clone(), clock, retention_days),
            directory,
            resolver,
            store,
        }
    }

    /// Open the sled database at `path` with the system clock.
    pub fn open(path: impl AsRef<Path>, retention_days: i64) -> Result<Self> {
        Ok(Self::new(Store::open(path)?, Arc::new(SystemClock), retention_days))
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}
