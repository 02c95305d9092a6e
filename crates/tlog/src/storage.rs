//! Storage trait and implementations
//!
//! Backends are byte stores addressed by slash-separated object paths such as
//! `tile/0/x001/234` or `checkpoint`. Writes replace the whole object.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Result, TlogError};

pub trait Storage: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, path: &str, value: &[u8]) -> Result<()>;
}

/// In-memory storage (for testing and demos)
///
/// Clones share the same underlying map.
#[derive(Clone)]
pub struct InMemoryStorage {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for InMemoryStorage {
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(path).cloned())
    }

    fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        self.data.write().insert(path.to_string(), value.to_vec());
        Ok(())
    }
}

/// Directory-backed storage: one file per object path.
///
/// Writes go to a sibling temporary file that is renamed into place, so a
/// reader sees either the previous object or the new one, never a torn write.
#[derive(Clone, Debug)]
pub struct FileBackedStorage {
    root: PathBuf,
}

impl FileBackedStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let clean = !path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(TlogError::Storage(format!("invalid object path {path:?}")));
        }
        Ok(self.root.join(rel))
    }
}

impl Storage for FileBackedStorage {
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = full.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, value)?;
        fs::rename(&tmp, &full)?;
        Ok(())
    }
}
