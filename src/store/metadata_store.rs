use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{load_json, save_json, StoreError};
use crate::storage::StorageManager;

pub const METADATA_MAP_FILE: &str = "METADATA_MAP.json";

/// Provenance of a block, reported alongside search hits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: u32,
    pub key: String,
    pub file_path: String,
    pub document_name: String,
}

/// Block ID -> [`Metadata`].
pub struct MetadataStore {
    storage: Arc<dyn StorageManager>,
    entries: BTreeMap<u32, Metadata>,
}

impl MetadataStore {
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        Self {
            storage,
            entries: BTreeMap::new(),
        }
    }

    /// Insert entries. Entries with an empty file path or key, or whose ID is
    /// already present, are skipped.
    ///
    /// # Returns
    /// Number of entries stored.
    pub fn add_items(&mut self, items: &[Metadata]) -> usize {
        let mut added = 0;

        for item in items {
            if item.file_path.is_empty() {
                log::warn!("skipping metadata {} with empty file path", item.id);
                continue;
            }
            if item.key.is_empty() {
                log::warn!("skipping metadata {} with empty key", item.id);
                continue;
            }
            if self.entries.contains_key(&item.id) {
                log::warn!("metadata {} ({}) already exists, skipping", item.id, item.key);
                continue;
            }
            self.entries.insert(item.id, item.clone());
            added += 1;
        }

        added
    }

    pub fn delete_item(&mut self, id: u32) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if !removed {
            log::warn!("metadata {id} not found, nothing to delete");
        }
        removed
    }

    /// Replace the entry for `id`. Unknown IDs are left alone.
    #[allow(dead_code)]
    pub fn update_item(&mut self, id: u32, mut data: Metadata) -> bool {
        if !self.entries.contains_key(&id) {
            log::warn!("metadata {id} not found, nothing to update");
            return false;
        }
        data.id = id;
        self.entries.remove(&id);
        self.add_items(&[data]) == 1
    }

    pub fn search(&self, id: u32) -> Result<&Metadata, StoreError> {
        self.entries.get(&id).ok_or(StoreError::NotFound {
            store: "metadata store",
            id,
        })
    }

    /// Point every entry recorded under `old_path` at `new_path`.
    ///
    /// # Returns
    /// Number of entries rewritten.
    pub fn rename_file_path(&mut self, old_path: &str, new_path: &str) -> usize {
        let mut renamed = 0;
        for entry in self.entries.values_mut() {
            if entry.file_path == old_path {
                entry.file_path = new_path.to_string();
                renamed += 1;
            }
        }
        renamed
    }

    pub fn ids(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn save_maps(&self) -> Result<(), StoreError> {
        save_json(self.storage.as_ref(), METADATA_MAP_FILE, &self.entries)
    }

    pub fn load_maps(&mut self) {
        self.entries = load_json(self.storage.as_ref(), METADATA_MAP_FILE);
        log::debug!("loaded {} metadata entries", self.entries.len());
    }

    pub fn reset_store(&mut self) -> Result<(), StoreError> {
        self.entries.clear();
        self.storage.remove(METADATA_MAP_FILE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    fn meta(id: u32, path: &str) -> Metadata {
        Metadata {
            id,
            key: format!("Heading {id} of {path}"),
            file_path: path.to_string(),
            document_name: path.to_string(),
        }
    }

    fn create_store() -> (MetadataStore, Arc<dyn StorageManager>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        (MetadataStore::new(storage.clone()), storage, tmp)
    }

    #[test]
    fn test_add_rejects_invalid_and_duplicates() {
        let (mut store, _, _tmp) = create_store();
        let mut no_path = meta(2, "a.md");
        no_path.file_path.clear();
        let mut no_key = meta(3, "a.md");
        no_key.key.clear();

        let added = store.add_items(&[meta(1, "a.md"), no_path, no_key, meta(1, "b.md")]);
        assert_eq!(added, 1);
        assert_eq!(store.search(1).unwrap().file_path, "a.md");
    }

    #[test]
    fn test_search_missing_is_typed_error() {
        let (store, _, _tmp) = create_store();
        assert!(matches!(
            store.search(42),
            Err(StoreError::NotFound { id: 42, .. })
        ));
    }

    #[test]
    fn test_update_item() {
        let (mut store, _, _tmp) = create_store();
        store.add_items(&[meta(1, "a.md")]);

        assert!(store.update_item(1, meta(99, "b.md")));
        let updated = store.search(1).unwrap();
        assert_eq!(updated.id, 1);
        assert_eq!(updated.file_path, "b.md");
        assert!(store.search(99).is_err());

        assert!(!store.update_item(5, meta(5, "c.md")));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_delete_item() {
        let (mut store, _, _tmp) = create_store();
        store.add_items(&[meta(1, "a.md")]);
        assert!(store.delete_item(1));
        assert!(!store.delete_item(1));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_rename_file_path() {
        let (mut store, _, _tmp) = create_store();
        store.add_items(&[meta(1, "a.md"), meta(2, "a.md"), meta(3, "b.md")]);
        assert_eq!(store.rename_file_path("a.md", "c.md"), 2);
        assert_eq!(store.search(1).unwrap().file_path, "c.md");
        assert_eq!(store.search(3).unwrap().file_path, "b.md");
    }

    #[test]
    fn test_roundtrip_uses_camel_case() {
        let (mut store, storage, _tmp) = create_store();
        store.add_items(&[meta(1, "a.md"), meta(2, "b.md")]);
        store.save_maps().unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&storage.read(METADATA_MAP_FILE).unwrap()).unwrap();
        assert_eq!(raw["1"]["filePath"], "a.md");
        assert_eq!(raw["2"]["documentName"], "b.md");

        let mut loaded = MetadataStore::new(storage);
        loaded.load_maps();
        assert_eq!(loaded.entries, store.entries);
    }

    #[test]
    fn test_reset_store() {
        let (mut store, storage, _tmp) = create_store();
        store.add_items(&[meta(1, "a.md")]);
        store.save_maps().unwrap();
        store.reset_store().unwrap();
        assert_eq!(store.count(), 0);
        assert!(!storage.exists(METADATA_MAP_FILE));
    }
}
