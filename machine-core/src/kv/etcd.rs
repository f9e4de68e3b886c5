//! etcd backend selected by the `etcd://host:port` scheme.
//!
//! The etcd client is async; a private single-worker runtime drives it so the
//! rest of the crate stays blocking. Calls made from inside another tokio
//! runtime are refused with a configuration error instead of blocking it.

use std::future::Future;
use std::time::Duration;

use etcd_client::{Client, ConnectOptions, DeleteOptions, GetOptions};
use tokio::runtime::{Builder, Handle, Runtime};

use super::{KvBackend, KvPair};
use crate::error::{MachineError, Result};

pub struct EtcdBackend {
    // Dropped before the runtime that drives it
    client: Client,
    runtime: Runtime,
}

/// Blocking on a runtime from one of its own workers panics
fn ensure_blocking_context() -> Result<()> {
    if Handle::try_current().is_ok() {
        return Err(MachineError::Configuration(
            "etcd backend cannot be driven from inside an async runtime; \
             call it from a blocking thread"
                .to_string(),
        ));
    }
    Ok(())
}

impl EtcdBackend {
    pub fn connect(address: &str, timeout: Duration) -> Result<Self> {
        ensure_blocking_context()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("machine-etcd")
            .enable_all()
            .build()
            .map_err(|e| MachineError::backend("connect", address, e))?;

        let options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);
        let client = runtime
            .block_on(Client::connect([address], Some(options)))
            .map_err(|e| MachineError::backend("connect", address, e))?;

        Ok(Self { client, runtime })
    }

    fn run<F, T>(&self, op: &'static str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        ensure_blocking_context()?;
        self.runtime
            .block_on(fut)
            .map_err(|e| MachineError::backend(op, key, e))
    }
}

impl KvBackend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let owned = key.to_string();
        let response = self.run("get", key, async move { client.get(owned, None).await })?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut client = self.client.clone();
        let owned = key.to_string();
        let value = value.to_vec();
        self.run("put", key, async move { client.put(owned, value, None).await })?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let owned = key.to_string();
        let response = self.run("exists", key, async move {
            client
                .get(owned, Some(GetOptions::new().with_count_only()))
                .await
        })?;
        Ok(response.count() > 0)
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let mut client = self.client.clone();
        let owned = prefix.to_string();
        let response = self.run("list", prefix, async move {
            client
                .get(owned, Some(GetOptions::new().with_prefix()))
                .await
        })?;
        Ok(response
            .kvs()
            .iter()
            .map(|kv| KvPair {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect())
    }

    fn delete_tree(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        let owned = key.to_string();
        let children = format!("{key}/");
        self.run("delete_tree", key, async move {
            client.delete(owned, None).await?;
            client
                .delete(children, Some(DeleteOptions::new().with_prefix()))
                .await
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_thread_may_drive_the_backend() {
        assert!(ensure_blocking_context().is_ok());
    }

    #[tokio::test]
    async fn async_context_is_refused_before_connecting() {
        let err = EtcdBackend::connect("127.0.0.1:1", Duration::from_millis(100))
            .err()
            .expect("connect inside a runtime must fail");
        assert!(matches!(err, MachineError::Configuration(_)), "{err}");
    }
}
