//! Key/value storage back-ends.
//!
//! Two kinds of storage are read when looking for Teams tokens:
//!
//! - [`ExtensionStorage`]: the tool's own persisted store. It holds captured
//!   tokens and the last processing status. Values are arbitrary JSON.
//! - [`PageStorage`]: a web page's `localStorage`, enumerated by index like
//!   `window.localStorage`. Values are always strings.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::{Map, Value};

use crate::CoreError;

/// Persistent key/value store with JSON values.
///
/// `set` merges its items into the stored map; keys it does not name are kept.
pub trait ExtensionStorage {
    /// Return every stored key/value pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be read.
    fn get_all(&self) -> Result<Map<String, Value>, CoreError>;

    /// Return the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be read.
    fn get(&self, key: &str) -> Result<Option<Value>, CoreError> {
        Ok(self.get_all()?.remove(key))
    }

    /// Merge `items` into the store, replacing existing keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be written.
    fn set(&self, items: Map<String, Value>) -> Result<(), CoreError>;

    /// Remove every key.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be written.
    fn clear(&self) -> Result<(), CoreError>;
}

/// Index-addressed string storage, shaped like a page's `localStorage`.
pub trait PageStorage {
    /// Number of stored items.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is not accessible.
    fn length(&self) -> Result<usize, CoreError>;

    /// Key at position `index`, or `None` when out of range.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is not accessible.
    fn key(&self, index: usize) -> Result<Option<String>, CoreError>;

    /// Value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is not accessible.
    fn get_item(&self, key: &str) -> Result<Option<String>, CoreError>;
}

/// Extension storage persisted as a single JSON object on disk.
///
/// Writes hold an exclusive lock on a sibling lock file, so processes sharing
/// the same store (the CLI and the API server) merge their keys instead of
/// overwriting each other. Readers see either the old or the new file.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    lock_file: PathBuf,
    lock: Mutex<()>,
}

/// Held across a read-modify-write. Dropping it releases both locks.
struct WriteLock<'a> {
    _thread: MutexGuard<'a, ()>,
    _process: File,
}

impl JsonFileStorage {
    /// Create a store backed by `path`. The file is created on first write.
    ///
    /// The lock file defaults to `path` with a `.lock` extension.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock_file: path.with_extension("lock"),
            path,
            lock: Mutex::new(()),
        }
    }

    /// Use `lock_file` to coordinate writers instead of the default.
    #[must_use]
    pub fn with_lock_file(mut self, lock_file: impl Into<PathBuf>) -> Self {
        self.lock_file = lock_file.into();
        self
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the file locked while writing.
    #[must_use]
    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, CoreError> {
        self.lock
            .lock()
            .map_err(|e| CoreError::Storage(format!("storage lock poisoned: {e}")))
    }

    fn write_lock(&self) -> Result<WriteLock<'_>, CoreError> {
        let thread = self.guard()?;
        if let Some(parent) = self.lock_file.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CoreError::Storage(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)
            .map_err(|e| {
                CoreError::Storage(format!("opening {}: {e}", self.lock_file.display()))
            })?;
        file.lock().map_err(|e| {
            CoreError::Storage(format!("locking {}: {e}", self.lock_file.display()))
        })?;
        Ok(WriteLock {
            _thread: thread,
            _process: file,
        })
    }

    fn read_map(&self) -> Result<Map<String, Value>, CoreError> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            CoreError::Storage(format!("reading {}: {e}", self.path.display()))
        })?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(CoreError::Storage(format!(
                "{} does not contain a JSON object",
                self.path.display()
            ))),
            Err(e) => Err(CoreError::Storage(format!(
                "parsing {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CoreError::Storage(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let body = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)
            .map_err(|e| CoreError::Storage(format!("writing {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            CoreError::Storage(format!("replacing {}: {e}", self.path.display()))
        })
    }
}

impl ExtensionStorage for JsonFileStorage {
    fn get_all(&self) -> Result<Map<String, Value>, CoreError> {
        let _guard = self.guard()?;
        self.read_map()
    }

    fn set(&self, items: Map<String, Value>) -> Result<(), CoreError> {
        let _lock = self.write_lock()?;
        let mut map = self.read_map()?;
        map.extend(items);
        self.write_map(&map)
    }

    fn clear(&self) -> Result<(), CoreError> {
        let _lock = self.write_lock()?;
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| {
                CoreError::Storage(format!("removing {}: {e}", self.path.display()))
            })?;
        }
        Ok(())
    }
}

/// In-process extension storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<Map<String, Value>>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `items`.
    #[must_use]
    pub fn with_items(items: Map<String, Value>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, Map<String, Value>>, CoreError> {
        self.items
            .lock()
            .map_err(|e| CoreError::Storage(format!("storage lock poisoned: {e}")))
    }
}

impl ExtensionStorage for MemoryStorage {
    fn get_all(&self) -> Result<Map<String, Value>, CoreError> {
        Ok(self.guard()?.clone())
    }

    fn set(&self, items: Map<String, Value>) -> Result<(), CoreError> {
        self.guard()?.extend(items);
        Ok(())
    }

    fn clear(&self) -> Result<(), CoreError> {
        self.guard()?.clear();
        Ok(())
    }
}

/// A captured copy of a page's `localStorage`.
///
/// Loaded from the JSON object produced by dumping `localStorage` in the
/// browser, e.g. `copy(JSON.stringify(localStorage))` in the devtools console.
#[derive(Debug, Clone, Default)]
pub struct LocalStorageSnapshot {
    entries: Vec<(String, String)>,
}

impl LocalStorageSnapshot {
    /// Build a snapshot from key/value pairs, keeping their order.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse a snapshot from a JSON object.
    ///
    /// String values are kept verbatim; other values are re-serialized, since
    /// `localStorage` only ever holds strings.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object.
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        let map: Map<String, Value> = serde_json::from_str(text)
            .map_err(|e| CoreError::Serialization(format!("parsing localStorage export: {e}")))?;

        Ok(Self {
            entries: map
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect(),
        })
    }

    /// Read a snapshot from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON object.
    pub fn from_path(path: &Path) -> Result<Self, CoreError> {
        let text = fs::read_to_string(path)
            .map_err(|e| CoreError::Storage(format!("reading {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Number of entries in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PageStorage for LocalStorageSnapshot {
    fn length(&self) -> Result<usize, CoreError> {
        Ok(self.entries.len())
    }

    fn key(&self, index: usize) -> Result<Option<String>, CoreError> {
        Ok(self.entries.get(index).map(|(k, _)| k.clone()))
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn file_storage_merges_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = JsonFileStorage::new(dir.path().join("sub").join("storage.json"));

        assert!(storage.get_all().expect("empty read").is_empty());

        storage
            .set(object(json!({"a": 1, "b": {"secret": "x"}})))
            .expect("first write");
        storage.set(object(json!({"a": 2}))).expect("second write");

        assert_eq!(storage.get("a").expect("get"), Some(json!(2)));
        assert_eq!(storage.get("b").expect("get"), Some(json!({"secret": "x"})));

        storage.clear().expect("clear");
        assert!(storage.get_all().expect("read after clear").is_empty());
        assert!(!storage.path().exists());
    }

    #[test]
    fn separate_handles_on_one_file_keep_every_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");
        let lock_file = dir.path().join("state").join("storage.lock");

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let storage = JsonFileStorage::new(&path).with_lock_file(&lock_file);
                std::thread::spawn(move || {
                    for n in 0..10 {
                        let mut items = Map::new();
                        items.insert(format!("w{writer}-{n}"), json!(n));
                        storage.set(items).expect("write");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }

        let stored = JsonFileStorage::new(&path).get_all().expect("read");
        assert_eq!(stored.len(), 40);
        assert!(lock_file.exists());
    }

    #[test]
    fn lock_file_defaults_next_to_store() {
        let storage = JsonFileStorage::new("/tmp/emz/storage.json");
        assert_eq!(storage.lock_file(), Path::new("/tmp/emz/storage.lock"));
    }

    #[test]
    fn file_storage_rejects_non_object() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");
        fs::write(&path, "[1, 2]").expect("write");

        let err = JsonFileStorage::new(&path).get_all().expect_err("array is invalid");
        assert!(matches!(err, CoreError::Storage(_)));
    }

    #[test]
    fn memory_storage_set_overwrites() {
        let storage = MemoryStorage::with_items(object(json!({"k": "old"})));
        storage.set(object(json!({"k": "new"}))).expect("set");
        assert_eq!(storage.get("k").expect("get"), Some(json!("new")));
        assert_eq!(storage.get("missing").expect("get"), None);
    }

    #[test]
    fn snapshot_reserializes_structured_values() {
        let snapshot =
            LocalStorageSnapshot::from_json_str(r#"{"plain": "text", "obj": {"secret": "s"}}"#)
                .expect("parse");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get_item("plain").expect("get"), Some("text".to_string()));
        assert_eq!(
            snapshot.get_item("obj").expect("get"),
            Some(r#"{"secret":"s"}"#.to_string())
        );
        assert_eq!(snapshot.key(5).expect("key"), None);
    }

    #[test]
    fn snapshot_requires_object() {
        assert!(LocalStorageSnapshot::from_json_str("\"nope\"").is_err());
    }
}
