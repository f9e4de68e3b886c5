//! In-process backend selected by the `memory://` scheme.
//!
//! Data lives as long as the connector that created it and is never shared
//! across processes, which makes it suitable for tests and single-process
//! tooling.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::{KvBackend, KvPair};
use crate::error::{MachineError, Result};

/// Ordered in-memory key space
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned(op: &'static str, key: &str) -> MachineError {
        MachineError::backend(op, key, "memory backend lock poisoned")
    }
}

impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().map_err(|_| Self::poisoned("get", key))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut data = self.data.write().map_err(|_| Self::poisoned("put", key))?;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let data = self.data.read().map_err(|_| Self::poisoned("exists", key))?;
        Ok(data.contains_key(key))
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let data = self.data.read().map_err(|_| Self::poisoned("list", prefix))?;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KvPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    fn delete_tree(&self, key: &str) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| Self::poisoned("delete_tree", key))?;
        let children = format!("{key}/");
        data.retain(|k, _| k != key && !k.starts_with(&children));
        Ok(())
    }
}
