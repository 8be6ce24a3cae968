use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ScriptError, ScriptResult};
use crate::ids::ItemId;
use crate::lock;

/// Durable home for captured state blobs.
pub trait StateStore: Send + Sync {
    fn save_state(&self, item: ItemId, blob: &[u8]) -> ScriptResult<()>;

    fn load_state(&self, item: ItemId) -> ScriptResult<Option<Vec<u8>>>;

    fn delete_state(&self, item: ItemId) -> ScriptResult<()>;

    /// Every item with a saved blob.
    fn saved_items(&self) -> ScriptResult<Vec<ItemId>>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    blobs: Mutex<HashMap<ItemId, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn save_state(&self, item: ItemId, blob: &[u8]) -> ScriptResult<()> {
        lock(&self.blobs).insert(item, blob.to_vec());
        Ok(())
    }

    fn load_state(&self, item: ItemId) -> ScriptResult<Option<Vec<u8>>> {
        Ok(lock(&self.blobs).get(&item).cloned())
    }

    fn delete_state(&self, item: ItemId) -> ScriptResult<()> {
        lock(&self.blobs).remove(&item);
        Ok(())
    }

    fn saved_items(&self) -> ScriptResult<Vec<ItemId>> {
        Ok(lock(&self.blobs).keys().copied().collect())
    }
}

const STATE_EXTENSION: &str = "state";

/// One `<item>.state` file per script under a directory.
pub struct DirectoryStateStore {
    root: PathBuf,
}

impl DirectoryStateStore {
    pub fn open(root: impl AsRef<Path>) -> ScriptResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| persistence_error(&root, err))?;
        Ok(Self { root })
    }

    fn path_for(&self, item: ItemId) -> PathBuf {
        self.root.join(format!("{item}.{STATE_EXTENSION}"))
    }
}

fn persistence_error(path: &Path, err: io::Error) -> ScriptError {
    ScriptError::Persistence(format!("{}: {err}", path.display()))
}

impl StateStore for DirectoryStateStore {
    fn save_state(&self, item: ItemId, blob: &[u8]) -> ScriptResult<()> {
        let path = self.path_for(item);
        let staging = path.with_extension("tmp");
        fs::write(&staging, blob).map_err(|err| persistence_error(&staging, err))?;
        fs::rename(&staging, &path).map_err(|err| persistence_error(&path, err))
    }

    fn load_state(&self, item: ItemId) -> ScriptResult<Option<Vec<u8>>> {
        let path = self.path_for(item);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(persistence_error(&path, err)),
        }
    }

    fn delete_state(&self, item: ItemId) -> ScriptResult<()> {
        let path = self.path_for(item);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(persistence_error(&path, err)),
        }
    }

    fn saved_items(&self) -> ScriptResult<Vec<ItemId>> {
        let entries = fs::read_dir(&self.root).map_err(|err| persistence_error(&self.root, err))?;
        let mut items = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| persistence_error(&self.root, err))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STATE_EXTENSION) {
                continue;
            }
            if let Some(item) = path.file_stem().and_then(|stem| stem.to_str()).and_then(|s| s.parse().ok()) {
                items.push(item);
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_store_round_trips_and_deletes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = DirectoryStateStore::open(dir.path().join("states")).expect("open store");
        let item = ItemId::new();
        assert_eq!(store.load_state(item).expect("load"), None);
        store.save_state(item, b"blob").expect("save");
        assert_eq!(store.load_state(item).expect("load"), Some(b"blob".to_vec()));
        assert_eq!(store.saved_items().expect("list"), vec![item]);
        store.delete_state(item).expect("delete");
        store.delete_state(item).expect("second delete is a no-op");
        assert!(store.saved_items().expect("list").is_empty());
    }

    #[test]
    fn memory_store_overwrites_saves() {
        let store = MemoryStateStore::new();
        let item = ItemId::new();
        store.save_state(item, b"one").expect("save");
        store.save_state(item, b"two").expect("save");
        assert_eq!(store.len(), 1);
        assert_eq!(store.load_state(item).expect("load"), Some(b"two".to_vec()));
    }
}
