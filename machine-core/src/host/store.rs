use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use machine_common::logging::{Component, Logger};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;

use super::{HostMigrator, HostRecord, BACKUP_FILE, CONFIG_FILE};
use crate::blob::{BlobStore, FileBlobStore, PRIVATE_FILE_MODE};
use crate::config::StorageConfig;
use crate::error::{MachineError, Result};
use crate::kv::KvConnector;
use crate::location::{normalize_key, StorageRoot};

/// Persistence of host descriptors by name
pub trait HostRecordStore: Send + Sync {
    /// Write `host` to `<machines>/<host.name>/config.json`
    fn save(&self, host: &HostRecord) -> Result<()>;

    /// Load and migrate the descriptor; absent hosts are
    /// [`MachineError::HostNotFound`]
    fn load(&self, name: &str) -> Result<HostRecord>;

    fn exists(&self, name: &str) -> Result<bool>;

    /// Names of all stored hosts
    fn list(&self) -> Result<Vec<String>>;

    /// Delete everything stored for `name`
    fn remove(&self, name: &str) -> Result<()>;

    /// Location of the machines directory
    fn machines_dir(&self) -> String;

    /// Every file stored below a host, as `<name>/<relative path>`
    fn list_machine_files(&self, name: &str) -> Result<Vec<String>> {
        Err(MachineError::Configuration(format!(
            "listing machine files of {name} requires a key-value store"
        )))
    }
}

/// Select the host store matching the configured root
pub fn open_host_store(
    config: &StorageConfig,
    connector: &KvConnector,
    migrator: Arc<dyn HostMigrator>,
    logger: Arc<Logger>,
) -> Result<Arc<dyn HostRecordStore>> {
    match config.root() {
        StorageRoot::Local { path } => Ok(Arc::new(FileHostStore::new(
            path.join("machines"),
            migrator,
            logger,
        ))),
        root @ StorageRoot::Distributed { .. } => Ok(Arc::new(KvHostStore::connect(
            root.clone(),
            connector.clone(),
            migrator,
            logger,
        )?)),
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(MachineError::InvalidInput(format!(
            "invalid host name {name:?}"
        )));
    }
    Ok(())
}

/// Descriptor with the host name re-applied after migration
fn migrate(migrator: &dyn HostMigrator, name: &str, raw: &[u8]) -> Result<(HostRecord, bool)> {
    let (mut host, upgraded) = migrator
        .migrate_host(raw)
        .map_err(|e| MachineError::Migration(format!("Error getting migrated host {name}: {e}")))?;
    host.name = name.to_string();
    Ok((host, upgraded))
}

/// Host store in a local machines directory
pub struct FileHostStore {
    machines_dir: PathBuf,
    blobs: FileBlobStore,
    migrator: Arc<dyn HostMigrator>,
    logger: Arc<Logger>,
}

impl FileHostStore {
    pub fn new(machines_dir: impl Into<PathBuf>, migrator: Arc<dyn HostMigrator>, logger: Arc<Logger>) -> Self {
        let logger = Arc::new(logger.with_component(Component::Hosts));
        Self {
            machines_dir: machines_dir.into(),
            blobs: FileBlobStore::new(logger.clone()),
            migrator,
            logger,
        }
    }

    fn host_dir(&self, name: &str) -> PathBuf {
        self.machines_dir.join(name)
    }

    fn file_path(&self, name: &str, file: &str) -> String {
        self.host_dir(name).join(file).to_string_lossy().into_owned()
    }

    /// Descriptors on disk are indented with four spaces
    fn encode(host: &HostRecord) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
        host.serialize(&mut serializer)?;
        Ok(out)
    }
}

impl HostRecordStore for FileHostStore {
    fn save(&self, host: &HostRecord) -> Result<()> {
        validate_name(&host.name)?;
        self.logger.debug(format!("Saving host {}", host.name));
        self.blobs.write(
            &self.file_path(&host.name, CONFIG_FILE),
            &Self::encode(host)?,
            PRIVATE_FILE_MODE,
        )
    }

    fn load(&self, name: &str) -> Result<HostRecord> {
        validate_name(name)?;
        if !self.exists(name)? {
            return Err(MachineError::HostNotFound(name.to_string()));
        }

        let raw = self.blobs.read(&self.file_path(name, CONFIG_FILE))?;
        let (host, upgraded) = migrate(self.migrator.as_ref(), name, &raw)?;

        if upgraded {
            self.logger.with_scope(name).info("Migrated descriptor");
            self.blobs
                .write(&self.file_path(name, BACKUP_FILE), &raw, PRIVATE_FILE_MODE)
                .map_err(|e| {
                    MachineError::Migration(format!(
                        "Error attempting to save backup after migration: {e}"
                    ))
                })?;
            self.save(&host).map_err(|e| {
                MachineError::Migration(format!(
                    "Error saving config after migration was performed: {e}"
                ))
            })?;
        }
        Ok(host)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let dir = self.host_dir(name);
        match fs::metadata(&dir) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MachineError::io("stat", dir.display().to_string(), e)),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.machines_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MachineError::io(
                    "list",
                    self.machines_dir.display().to_string(),
                    e,
                ))
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| MachineError::io("list", self.machines_dir.display().to_string(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !is_dir(&entry.path()) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let dir = self.host_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MachineError::io("remove", dir.display().to_string(), e)),
        }
    }

    fn machines_dir(&self) -> String {
        self.machines_dir.to_string_lossy().into_owned()
    }
}

fn is_dir(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// Host store on the shared key-value backend
pub struct KvHostStore {
    root: StorageRoot,
    connector: KvConnector,
    migrator: Arc<dyn HostMigrator>,
    logger: Arc<Logger>,
}

impl KvHostStore {
    pub fn connect(
        root: StorageRoot,
        connector: KvConnector,
        migrator: Arc<dyn HostMigrator>,
        logger: Arc<Logger>,
    ) -> Result<Self> {
        let endpoint = root.endpoint().ok_or_else(|| {
            MachineError::Configuration("KV host store requires a distributed root".to_string())
        })?;
        connector.connect(&endpoint)?;
        Ok(Self {
            root,
            connector,
            migrator,
            logger: Arc::new(logger.with_component(Component::Hosts)),
        })
    }

    fn key(&self, elems: &[&str]) -> String {
        let mut path = vec!["machines"];
        path.extend_from_slice(elems);
        self.root.relative_key(&self.root.join(&path))
    }
}

impl HostRecordStore for KvHostStore {
    fn save(&self, host: &HostRecord) -> Result<()> {
        validate_name(&host.name)?;
        let key = self.key(&[&host.name, CONFIG_FILE]);
        self.logger.debug(format!("Saving host {} to {key}", host.name));
        self.connector.put(&key, &serde_json::to_vec(host)?)
    }

    fn load(&self, name: &str) -> Result<HostRecord> {
        validate_name(name)?;
        if !self.exists(name)? {
            return Err(MachineError::HostNotFound(name.to_string()));
        }

        let raw = match self.connector.get(&self.key(&[name, CONFIG_FILE])) {
            Ok(raw) => raw,
            // Removed between the existence check and the read
            Err(MachineError::KeyNotFound(_)) => {
                return Err(MachineError::HostNotFound(name.to_string()))
            }
            Err(e) => return Err(e),
        };
        let (host, upgraded) = migrate(self.migrator.as_ref(), name, &raw)?;

        if upgraded {
            self.logger.with_scope(name).info("Migrated descriptor");
            self.save(&host).map_err(|e| {
                MachineError::Migration(format!(
                    "Error saving config after migration was performed: {e}"
                ))
            })?;
        }
        Ok(host)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.connector.exists(&self.key(&[name, CONFIG_FILE]))
    }

    fn list(&self) -> Result<Vec<String>> {
        let dir = self.key(&[]);
        let mut names = BTreeSet::new();
        for pair in self.connector.list(&dir)? {
            let rest = pair.key.strip_prefix(dir.as_str()).unwrap_or(&pair.key);
            // Only a descriptor makes a host; stray keys and orphaned files do not
            if let Some((name, file)) = normalize_key(rest).split_once('/') {
                if !name.is_empty() && file == CONFIG_FILE {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.logger.debug(format!("Removing host {name}"));
        self.connector.delete_tree(&self.key(&[name]))
    }

    fn machines_dir(&self) -> String {
        self.root.join(&["machines"])
    }

    fn list_machine_files(&self, name: &str) -> Result<Vec<String>> {
        validate_name(name)?;
        let dir = self.key(&[name]);
        let mut files: Vec<String> = self
            .connector
            .list(&dir)?
            .into_iter()
            .map(|pair| {
                let rest = pair.key.strip_prefix(dir.as_str()).unwrap_or(&pair.key);
                format!("{name}/{}", normalize_key(rest))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SchemaMigrator;
    use tempfile::TempDir;

    fn logger() -> Arc<Logger> {
        Arc::new(Logger::new_root(Component::System, "host-test"))
    }

    fn migrator() -> Arc<dyn HostMigrator> {
        Arc::new(SchemaMigrator::current(logger()))
    }

    #[test]
    fn file_store_roundtrip_and_indentation() {
        let dir = TempDir::new().unwrap();
        let store = FileHostStore::new(dir.path().join("machines"), migrator(), logger());
        let host = HostRecord::new("node1", "none", serde_json::json!({"IPAddress": "10.0.0.5"}));
        store.save(&host).unwrap();

        let raw = fs::read_to_string(dir.path().join("machines/node1/config.json")).unwrap();
        assert!(raw.contains("\n    \"ConfigVersion\""));
        assert_eq!(store.load("node1").unwrap(), host);
        assert!(store.exists("node1").unwrap());
    }

    #[test]
    fn file_store_rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        let store = FileHostStore::new(dir.path().join("machines"), migrator(), logger());
        for name in ["", "..", "a/b"] {
            assert!(matches!(store.load(name), Err(MachineError::InvalidInput(_))));
        }
    }

    #[test]
    fn missing_host_is_host_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileHostStore::new(dir.path().join("machines"), migrator(), logger());
        assert!(matches!(store.load("ghost"), Err(MachineError::HostNotFound(_))));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn file_store_cannot_list_machine_files() {
        let dir = TempDir::new().unwrap();
        let store = FileHostStore::new(dir.path().join("machines"), migrator(), logger());
        assert!(matches!(
            store.list_machine_files("node1"),
            Err(MachineError::Configuration(_))
        ));
    }

    #[test]
    fn kv_keys_live_under_machines() {
        let root = StorageRoot::parse("memory://hosts").unwrap();
        let store =
            KvHostStore::connect(root, KvConnector::new(logger()), migrator(), logger()).unwrap();
        assert_eq!(store.key(&["n1", CONFIG_FILE]), "machines/n1/config.json");
        assert_eq!(store.key(&[]), "machines");
        assert_eq!(store.machines_dir(), "memory://hosts/machines");
    }
}
