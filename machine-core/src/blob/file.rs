use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use machine_common::logging::{Component, Logger};
use tempfile::Builder;

use super::BlobStore;
use crate::error::{MachineError, Result};

/// Blob store on the local filesystem.
///
/// Paths are used as given. Overwrites go through a temporary file in the
/// target directory that is renamed over the target, so readers never see a
/// partially written file.
pub struct FileBlobStore {
    logger: Arc<Logger>,
    exists_failures: AtomicU64,
}

impl FileBlobStore {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            logger: Arc::new(logger.with_component(Component::Storage)),
            exists_failures: AtomicU64::new(0),
        }
    }

    fn write_new(&self, target: &Path, data: &[u8], mode: u32) -> Result<()> {
        let display = target.display().to_string();
        let mut file = create_with_mode(target, mode)
            .map_err(|e| MachineError::io("create", &display, e))?;
        file.write_all(data)
            .map_err(|e| MachineError::io("write", &display, e))?;
        file.sync_all()
            .map_err(|e| MachineError::io("sync", &display, e))?;
        Ok(())
    }

    fn replace(&self, target: &Path, dir: &Path, data: &[u8], mode: u32) -> Result<()> {
        let display = target.display().to_string();
        // Removed on every exit path unless persisted below
        let mut tmp = Builder::new()
            .prefix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| MachineError::io("create temp file in", dir.display().to_string(), e))?;
        tmp.write_all(data)
            .map_err(|e| MachineError::io("write temp file for", &display, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| MachineError::io("sync temp file for", &display, e))?;
        set_mode(tmp.path(), mode).map_err(|e| MachineError::io("chmod", &display, e))?;

        let tmp_path = tmp.into_temp_path();
        match fs::remove_file(target) {
            // A concurrent writer may have replaced it already
            Err(e) if e.kind() != ErrorKind::NotFound => {
                return Err(MachineError::io("remove", &display, e));
            }
            _ => {}
        }
        tmp_path
            .persist(target)
            .map_err(|e| MachineError::io("rename temp file to", &display, e.error))?;
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn write(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        self.logger.debug(format!("write {path}"));
        let target = Path::new(path);
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        create_private_dir(dir)
            .map_err(|e| MachineError::io("create dir", dir.display().to_string(), e))?;

        match fs::symlink_metadata(target) {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                match self.write_new(target, data, mode) {
                    // Lost the race to create it; overwrite instead
                    Err(MachineError::Io { source, .. })
                        if source.kind() == ErrorKind::AlreadyExists =>
                    {
                        self.replace(target, dir, data, mode)
                    }
                    other => other,
                }
            }
            Err(e) => Err(MachineError::io("stat", path, e)),
            Ok(_) => self.replace(target, dir, data, mode),
        }
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.logger.debug(format!("read {path}"));
        fs::read(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => MachineError::KeyNotFound(path.to_string()),
            _ => MachineError::io("read", path, e),
        })
    }

    fn exists(&self, path: &str) -> bool {
        match fs::metadata(path) {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                self.exists_failures.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(format!(
                    "Stat failure on {path}, reporting as absent: {e}"
                ));
                false
            }
        }
    }

    fn exists_failures(&self) -> u64 {
        self.exists_failures.load(Ordering::Relaxed)
    }
}

#[cfg(unix)]
fn create_with_mode(path: &Path, mode: u32) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)?;
    // The process umask may have narrowed the requested mode
    set_mode(path, mode)?;
    Ok(file)
}

#[cfg(not(unix))]
fn create_with_mode(path: &Path, _mode: u32) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{PRIVATE_FILE_MODE, PUBLIC_FILE_MODE};
    use machine_common::logging::Component;
    use tempfile::TempDir;

    fn store() -> FileBlobStore {
        FileBlobStore::new(Arc::new(Logger::new_root(Component::System, "blob-test")))
    }

    fn path_in(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let path = path_in(&dir, "certs/ca.pem");
        assert!(!store.exists(&path));
        store.write(&path, b"first", PUBLIC_FILE_MODE).unwrap();
        assert!(store.exists(&path));
        assert_eq!(store.read(&path).unwrap(), b"first");
    }

    #[test]
    fn overwrite_replaces_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let path = path_in(&dir, "config.json");
        store.write(&path, b"old content that is longer", PUBLIC_FILE_MODE).unwrap();
        store.write(&path, b"new", PUBLIC_FILE_MODE).unwrap();
        assert_eq!(store.read(&path).unwrap(), b"new");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failed_replace_leaves_target_and_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let path = path_in(&dir, "occupied");
        // A non-empty directory cannot be removed as a file
        fs::create_dir(&path).unwrap();
        fs::write(dir.path().join("occupied/keep"), b"x").unwrap();

        let err = store.write(&path, b"data", PUBLIC_FILE_MODE).unwrap_err();
        assert!(matches!(err, MachineError::Io { .. }), "{err}");
        assert!(fs::metadata(&path).unwrap().is_dir());

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["occupied"]);
    }

    #[test]
    fn racing_first_writes_both_succeed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store());
        let path = path_in(&dir, "fresh/config.json");
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = [b'a', b'b']
            .into_iter()
            .map(|byte| {
                let (store, path, barrier) = (store.clone(), path.clone(), barrier.clone());
                std::thread::spawn(move || {
                    let data = vec![byte; 4096];
                    barrier.wait();
                    store.write(&path, &data, PUBLIC_FILE_MODE).map(|_| data)
                })
            })
            .collect();
        let written: Vec<Vec<u8>> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let data = store.read(&path).unwrap();
        assert!(written.contains(&data));
    }

    #[test]
    fn read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = store().read(&path_in(&dir, "missing.pem")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[cfg(unix)]
    #[test]
    fn private_keys_are_not_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let store = store();
        let path = path_in(&dir, "key.pem");
        store.write(&path, b"secret", PRIVATE_FILE_MODE).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        store.write(&path, b"rotated", PRIVATE_FILE_MODE).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn concurrent_readers_see_whole_values() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store());
        let path = path_in(&dir, "blob");
        let a = vec![b'a'; 64 * 1024];
        let b = vec![b'b'; 64 * 1024];
        store.write(&path, &a, PUBLIC_FILE_MODE).unwrap();

        let writer = {
            let store = store.clone();
            let path = path.clone();
            let (a, b) = (a.clone(), b.clone());
            std::thread::spawn(move || {
                for i in 0..50 {
                    let data = if i % 2 == 0 { &b } else { &a };
                    store.write(&path, data, PUBLIC_FILE_MODE).unwrap();
                }
            })
        };

        for _ in 0..200 {
            // The target is briefly absent between remove and rename
            if let Ok(data) = store.read(&path) {
                assert!(data == a || data == b, "observed a partial write");
            }
        }
        writer.join().unwrap();
    }
}
