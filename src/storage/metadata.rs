//! Opaque pattern metadata side-file.
//!
//! A JSON map `{id → {key → value}}` kept next to the index. The store
//! treats values as opaque strings; the file is rewritten atomically
//! (tmp + rename) on flush.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::Result;

pub type MetadataMap = HashMap<String, String>;

pub struct MetadataStore {
    path: PathBuf,
    inner: RwLock<HashMap<String, MetadataMap>>,
}

impl MetadataStore {
    /// Load the side-file, treating a missing file as empty.
    pub fn load(path: &Path) -> Result<Self> {
        let inner = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(inner),
        })
    }

    pub fn get(&self, id: &str) -> Option<MetadataMap> {
        self.inner.read().unwrap().get(id).cloned()
    }

    pub fn put(&self, id: &str, meta: MetadataMap) {
        self.inner.write().unwrap().insert(id.to_string(), meta);
    }

    /// Remove an entry; absent keys are a no-op (metadata is optional).
    pub fn remove(&self, id: &str) {
        self.inner.write().unwrap().remove(id);
    }

    /// Rebind metadata from one id to another (the replace path).
    pub fn rename(&self, old_id: &str, new_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(meta) = inner.remove(old_id) {
            inner.insert(new_id.to_string(), meta);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize under the read lock and atomically replace the file.
    pub fn flush(&self) -> Result<()> {
        let json = {
            let inner = self.inner.read().unwrap();
            serde_json::to_string_pretty(&*inner)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(pairs: &[(&str, &str)]) -> MetadataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::load(&dir.path().join("pattern-meta.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::load(&dir.path().join("pattern-meta.json")).unwrap();
        store.put("id-1", meta(&[("label", "alpha")]));

        assert_eq!(store.get("id-1").unwrap()["label"], "alpha");
        store.remove("id-1");
        assert!(store.get("id-1").is_none());
        // Removing again is fine.
        store.remove("id-1");
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata").join("pattern-meta.json");
        {
            let store = MetadataStore::load(&path).unwrap();
            store.put("id-1", meta(&[("a", "1"), ("b", "2")]));
            store.flush().unwrap();
        }
        let store = MetadataStore::load(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("id-1").unwrap()["b"], "2");
    }

    #[test]
    fn test_rename_moves_entry() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::load(&dir.path().join("pattern-meta.json")).unwrap();
        store.put("old", meta(&[("k", "v")]));
        store.rename("old", "new");
        assert!(store.get("old").is_none());
        assert_eq!(store.get("new").unwrap()["k"], "v");
    }
}
