use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage key for the playback cursor of one lecture.
pub fn progress_key(lecture_id: &str) -> String {
    format!("lecture.progress.{lecture_id}")
}

/// Small durable key-value store for playback cursors. Callers treat failures as
/// non-fatal and carry on with in-memory state.
pub trait ProgressStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<usize>>;
    fn set(&self, key: &str, value: usize) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    values: Mutex<HashMap<String, usize>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self, key: &str) -> Result<Option<usize>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("progress store lock poisoned"))?;
        Ok(values.get(key).copied())
    }

    fn set(&self, key: &str, value: usize) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow::anyhow!("progress store lock poisoned"))?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow::anyhow!("progress store lock poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// Progress kept in a JSON object on disk. Every write replaces the file through a
/// temporary sibling so a crash never leaves it half written.
#[derive(Debug)]
pub struct FileProgressStore {
    path: PathBuf,
    values: Mutex<HashMap<String, usize>>,
}

impl FileProgressStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("progress file {} is not valid JSON", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read progress file {}", path.display()));
            }
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, usize>)) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("progress store lock poisoned"))?;
        apply(&mut values);
        let serialized = serde_json::to_string_pretty(&*values)?;
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, serialized)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl ProgressStore for FileProgressStore {
    fn get(&self, key: &str) -> Result<Option<usize>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("progress store lock poisoned"))?;
        Ok(values.get(key).copied())
    }

    fn set(&self, key: &str, value: usize) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), value);
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_is_namespaced_per_lecture() {
        assert_eq!(progress_key("bio-101"), "lecture.progress.bio-101");
    }

    #[test]
    fn memory_store_round_trips_and_deletes() {
        let store = MemoryProgressStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", 4).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(4));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let store = FileProgressStore::open(&path).unwrap();
        store.set(&progress_key("a"), 2).unwrap();
        store.set(&progress_key("b"), 7).unwrap();
        store.delete(&progress_key("b")).unwrap();
        drop(store);

        let reopened = FileProgressStore::open(&path).unwrap();
        assert_eq!(reopened.get(&progress_key("a")).unwrap(), Some(2));
        assert_eq!(reopened.get(&progress_key("b")).unwrap(), None);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "{oops").unwrap();

        let error = FileProgressStore::open(&path).unwrap_err();
        assert!(error.to_string().contains("not valid JSON"));
    }
}
