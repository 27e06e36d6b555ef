use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::Builder;

use crate::error::{AuthError, AuthResult};

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> AuthResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AuthResult<()>;
}

/// One `<key>.json` file per key, replaced atomically under an advisory lock.
pub struct FileKeyValueStore {
    root_dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(format!("{}.json", key))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(format!(".{}.lock", key))
    }

    // Staged next to the target so the final rename never crosses filesystems.
    fn replace_value(&self, key: &str, data: &[u8]) -> AuthResult<()> {
        let path = self.value_path(key);
        let mut staged = Builder::new()
            .prefix(&format!(".{}.", key))
            .suffix(".tmp")
            .permissions(fs::Permissions::from_mode(0o600))
            .tempfile_in(&self.root_dir)
            .map_err(|err| AuthError::storage(format!("failed to stage {}: {}", key, err)))?;
        staged
            .write_all(data)
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|err| AuthError::storage(format!("failed to write {}: {}", key, err)))?;
        staged.persist(&path).map_err(|err| {
            AuthError::storage(format!("failed to replace {}: {}", path.display(), err))
        })?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> AuthResult<Option<String>> {
        let path = self.value_path(key);
        match fs::read_to_string(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AuthError::storage(format!(
                "failed to read {}: {}",
                path.display(),
                err
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> AuthResult<()> {
        fs::create_dir_all(&self.root_dir).map_err(|err| {
            AuthError::storage(format!(
                "failed to create store dir {}: {}",
                self.root_dir.display(),
                err
            ))
        })?;

        let lock_path = self.lock_path(key);
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| {
                AuthError::storage(format!(
                    "failed to open lock file {}: {}",
                    lock_path.display(),
                    err
                ))
            })?;
        let _ = lock.set_permissions(fs::Permissions::from_mode(0o600));
        lock.lock_exclusive().map_err(|err| {
            AuthError::storage(format!(
                "failed to acquire lock {}: {}",
                lock_path.display(),
                err
            ))
        })?;

        let result = self.replace_value(key, value.as_bytes());
        let _ = lock.unlock();
        result
    }
}

/// Volatile backend used by tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryKeyValueStore {
    pub fn with_value(key: &str, value: &str) -> Self {
        let store = Self::default();
        store
            .values
            .lock()
            .expect("memory store lock")
            .insert(key.to_string(), value.to_string());
        store
    }
}

#[cfg(test)]
impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> AuthResult<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| AuthError::storage("memory store poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AuthResult<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| AuthError::storage("memory store poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
