use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::TopologyError;
use crate::model::TopologySnapshot;
use crate::platform::TopologyProvider;

/// Caches the last snapshot built by a provider for read-mostly callers.
/// The rescan loop bypasses the cache with [`TopologyService::refresh`].
pub struct TopologyService {
    provider: Arc<dyn TopologyProvider>,
    cached: Mutex<Option<Arc<TopologySnapshot>>>,
}

impl TopologyService {
    pub fn new(provider: Arc<dyn TopologyProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &Arc<dyn TopologyProvider> {
        &self.provider
    }

    /// The cached snapshot, building one on first use.
    pub fn snapshot(&self) -> Result<Arc<TopologySnapshot>, TopologyError> {
        if let Some(snapshot) = self.lock_cache()?.as_ref() {
            return Ok(Arc::clone(snapshot));
        }
        self.refresh()
    }

    /// Always rebuilds and replaces the cached snapshot.
    pub fn refresh(&self) -> Result<Arc<TopologySnapshot>, TopologyError> {
        let snapshot = Arc::new(self.provider.enumerate()?);
        debug!(
            "{} snapshot: {} block devices, {} controllers, {} multipath devices",
            self.provider.name(),
            snapshot.scsi_block_devices().len(),
            snapshot.scsi_controllers().len(),
            snapshot.multipath_devices().len()
        );
        *self.lock_cache()? = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }

    fn lock_cache(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Option<Arc<TopologySnapshot>>>, TopologyError> {
        self.cached
            .lock()
            .map_err(|_| TopologyError::Rescan("topology cache lock poisoned".to_string()))
    }
}
