//! Key-addressable blob storage
//!
//! Certificates, SSH keys and other machine material are read and written
//! through [`BlobStore`]. The backend is chosen once from the configured
//! location by [`open_blob_store`]: plain paths go to [`FileBlobStore`],
//! scheme-prefixed URLs to [`KvBlobStore`].

mod file;
mod kv;

pub use file::FileBlobStore;
pub use kv::KvBlobStore;

use std::sync::Arc;

use machine_common::logging::Logger;

use crate::error::Result;
use crate::kv::KvConnector;
use crate::location::StorageRoot;

/// Mode for files that may be world readable (certificates, public keys)
pub const PUBLIC_FILE_MODE: u32 = 0o644;

/// Mode for private keys
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Byte storage addressed by path
pub trait BlobStore: Send + Sync {
    /// Store `data` at `path`, replacing any previous content.
    ///
    /// `mode` is honored where the backend has permissions.
    fn write(&self, path: &str, data: &[u8], mode: u32) -> Result<()>;

    /// Content at `path`; absence is [`crate::MachineError::KeyNotFound`]
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Whether `path` holds data.
    ///
    /// Backend failures are reported as `false`; they are logged and counted
    /// in [`BlobStore::exists_failures`] so they are not invisible.
    fn exists(&self, path: &str) -> bool;

    /// Number of `exists` calls whose backend failed
    fn exists_failures(&self) -> u64;
}

/// Select the blob store for `location`, connecting the KV backend if needed
pub fn open_blob_store(
    location: &str,
    connector: &KvConnector,
    logger: Arc<Logger>,
) -> Result<Arc<dyn BlobStore>> {
    open_blob_store_at(StorageRoot::parse(location)?, connector, logger)
}

/// Like [`open_blob_store`] for an already parsed root
pub fn open_blob_store_at(
    root: StorageRoot,
    connector: &KvConnector,
    logger: Arc<Logger>,
) -> Result<Arc<dyn BlobStore>> {
    match root {
        StorageRoot::Local { .. } => Ok(Arc::new(FileBlobStore::new(logger))),
        StorageRoot::Distributed { .. } => {
            Ok(Arc::new(KvBlobStore::connect(root, connector.clone(), logger)?))
        }
    }
}
