//! Write serialization for received files.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes writes into a destination. Dropping the guard releases the lock.
pub trait WriteLock: Send + Sync + 'static {
    type Guard: Send;

    fn acquire(&self, destination: &Path) -> impl Future<Output = Self::Guard> + Send;
}

/// One lock for every destination: at most one chunk is written at a time, process-wide.
#[derive(Clone, Default)]
pub struct GlobalWriteLock {
    inner: Arc<Mutex<()>>,
}

impl GlobalWriteLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WriteLock for GlobalWriteLock {
    type Guard = OwnedMutexGuard<()>;

    fn acquire(&self, _destination: &Path) -> impl Future<Output = Self::Guard> + Send {
        Arc::clone(&self.inner).lock_owned()
    }
}
