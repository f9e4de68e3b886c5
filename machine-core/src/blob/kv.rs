use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use machine_common::logging::{Component, Logger};

use super::BlobStore;
use crate::error::{MachineError, Result};
use crate::kv::KvConnector;
use crate::location::StorageRoot;

/// Blob store on the shared key-value backend.
///
/// Paths may be full URLs under the configured root or plain store-relative
/// paths; both map to the same key. Permissions are not representable and
/// the mode argument of [`BlobStore::write`] is ignored.
pub struct KvBlobStore {
    root: StorageRoot,
    connector: KvConnector,
    logger: Arc<Logger>,
    exists_failures: AtomicU64,
}

impl KvBlobStore {
    /// Connect `connector` to the root's endpoint (a no-op when already
    /// connected) and wrap it.
    pub fn connect(root: StorageRoot, connector: KvConnector, logger: Arc<Logger>) -> Result<Self> {
        let endpoint = root.endpoint().ok_or_else(|| {
            MachineError::Configuration("KV blob store requires a distributed root".to_string())
        })?;
        connector.connect(&endpoint)?;
        Ok(Self {
            root,
            connector,
            logger: Arc::new(logger.with_component(Component::Storage)),
            exists_failures: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &StorageRoot {
        &self.root
    }

    fn key(&self, path: &str) -> String {
        self.root.relative_key(path)
    }
}

impl BlobStore for KvBlobStore {
    fn write(&self, path: &str, data: &[u8], _mode: u32) -> Result<()> {
        self.connector.put(&self.key(path), data)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.connector.get(&self.key(path))
    }

    fn exists(&self, path: &str) -> bool {
        let key = self.key(path);
        match self.connector.exists(&key) {
            Ok(found) => found,
            Err(e) => {
                self.exists_failures.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(format!(
                    "KV lookup failure on {key}, reporting as absent: {e}"
                ));
                false
            }
        }
    }

    fn exists_failures(&self) -> u64 {
        self.exists_failures.load(Ordering::Relaxed)
    }
}
