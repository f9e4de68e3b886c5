//! Distributed key-value access
//!
//! [`KvConnector`] owns at most one live connection to a key-value backend.
//! It is cloned and handed to every component that needs the backend; all
//! clones share the same connection. Every key passed through the connector
//! is namespaced under [`MACHINE_KV_PREFIX`].

mod etcd;
mod memory;

pub use etcd::EtcdBackend;
pub use memory::MemoryBackend;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use machine_common::logging::{Component, Logger};
use url::Url;

use crate::error::{MachineError, Result};
use crate::location::normalize_key;

/// Fixed namespace for every key written by this crate
pub const MACHINE_KV_PREFIX: &str = "machine/v0";

/// Connection timeout applied when establishing a backend connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A key and its value as returned by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// Raw key-value operations a backend must provide.
///
/// Keys handed to a backend are already namespaced.
pub trait KvBackend: Send + Sync {
    /// Backend identifier, e.g. `etcd`
    fn name(&self) -> &'static str;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Every pair whose key starts with `prefix`
    fn list_prefix(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Remove `key` and every key below `key/`
    fn delete_tree(&self, key: &str) -> Result<()>;
}

/// Supported backend identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Etcd,
    Memory,
}

impl BackendKind {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "etcd" => Some(BackendKind::Etcd),
            "memory" => Some(BackendKind::Memory),
            _ => None,
        }
    }
}

struct ConnectorInner {
    backend: Mutex<Option<Arc<dyn KvBackend>>>,
    connections: AtomicUsize,
    connect_timeout: Duration,
    logger: Arc<Logger>,
}

/// Shared handle to the process' key-value connection
#[derive(Clone)]
pub struct KvConnector {
    inner: Arc<ConnectorInner>,
}

impl KvConnector {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self::with_timeout(logger, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(logger: Arc<Logger>, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                backend: Mutex::new(None),
                connections: AtomicUsize::new(0),
                connect_timeout,
                logger: Arc::new(logger.with_component(Component::Kv)),
            }),
        }
    }

    /// Connector already attached to `backend`
    #[cfg(test)]
    pub(crate) fn with_backend(logger: Arc<Logger>, backend: Arc<dyn KvBackend>) -> Self {
        let connector = Self::new(logger);
        if let Ok(mut guard) = connector.inner.backend.lock() {
            *guard = Some(backend);
        }
        connector
    }

    /// Connect to the backend named by the endpoint's scheme.
    ///
    /// Connecting again while connected is a no-op. Concurrent callers are
    /// serialized, so exactly one connection is ever established.
    pub fn connect(&self, endpoint: &str) -> Result<()> {
        let mut guard = self.lock_backend()?;
        if guard.is_some() {
            self.inner
                .logger
                .debug(format!("Already connected, ignoring connect to {endpoint}"));
            return Ok(());
        }

        let url = Url::parse(endpoint).map_err(|e| {
            MachineError::Configuration(format!("Malformed store path: {endpoint} {e}"))
        })?;
        let kind = BackendKind::from_scheme(url.scheme()).ok_or_else(|| {
            MachineError::Configuration(format!("Unsupported KV store type: {}", url.scheme()))
        })?;
        let host = url.host_str().unwrap_or_default();
        let address = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let backend: Arc<dyn KvBackend> = match kind {
            BackendKind::Etcd => Arc::new(
                EtcdBackend::connect(&address, self.inner.connect_timeout).map_err(|e| {
                    self.inner
                        .logger
                        .warn(format!("Connecting to {endpoint} failed: {e}"));
                    e
                })?,
            ),
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        };

        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        self.inner
            .logger
            .info(format!("Connected to {} backend at {address}", backend.name()));
        *guard = Some(backend);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .backend
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Number of underlying connections created by this connector
    pub fn connections_established(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Every pair below `dir`. A prefix with no children yields an empty
    /// vector; returned keys are relative to the namespace.
    pub fn list(&self, dir: &str) -> Result<Vec<KvPair>> {
        let backend = self.backend()?;
        let prefix = format!("{}/", namespaced(dir));
        self.inner.logger.debug(format!("list {prefix}"));
        let pairs = backend.list_prefix(&prefix)?;
        Ok(pairs
            .into_iter()
            .map(|pair| KvPair {
                key: strip_namespace(&pair.key),
                value: pair.value,
            })
            .collect())
    }

    pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let backend = self.backend()?;
        let key = namespaced(key);
        self.inner.logger.debug(format!("put {key}"));
        backend.put(&key, data)
    }

    /// Value stored at `key`, or [`MachineError::KeyNotFound`]
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let backend = self.backend()?;
        let full = namespaced(key);
        self.inner.logger.debug(format!("get {full}"));
        backend
            .get(&full)?
            .ok_or_else(|| MachineError::KeyNotFound(full))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        let backend = self.backend()?;
        let key = namespaced(key);
        self.inner.logger.debug(format!("exists {key}"));
        backend.exists(&key)
    }

    pub fn delete_tree(&self, key: &str) -> Result<()> {
        let backend = self.backend()?;
        let key = namespaced(key);
        self.inner.logger.debug(format!("delete tree {key}"));
        backend.delete_tree(&key)
    }

    fn lock_backend(&self) -> Result<std::sync::MutexGuard<'_, Option<Arc<dyn KvBackend>>>> {
        self.inner
            .backend
            .lock()
            .map_err(|_| MachineError::Configuration("KV connector lock poisoned".to_string()))
    }

    fn backend(&self) -> Result<Arc<dyn KvBackend>> {
        self.lock_backend()?
            .as_ref()
            .cloned()
            .ok_or(MachineError::Uninitialized)
    }
}

/// Prefix a store-relative key with [`MACHINE_KV_PREFIX`]
pub fn namespaced(key: &str) -> String {
    let key = normalize_key(key);
    if key.is_empty() {
        MACHINE_KV_PREFIX.to_string()
    } else {
        format!("{MACHINE_KV_PREFIX}/{key}")
    }
}

fn strip_namespace(key: &str) -> String {
    let key = normalize_key(key);
    key.strip_prefix(MACHINE_KV_PREFIX)
        .map(normalize_key)
        .unwrap_or(key)
}
