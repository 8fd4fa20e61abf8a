use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{load_json, save_json, StoreError};
use crate::segment::Block;
use crate::storage::StorageManager;

pub const BLOCK_MAP_FILE: &str = "BLOCK_MAP.json";
pub const FILE_BLOCKS_FILE: &str = "FILE_BLOCKS_MAP.json";

/// Block text keyed by block ID, plus the reverse index from file path to
/// the IDs that file owns.
///
/// Every ID in a file's set is present in the block map, and no file entry
/// has an empty set.
pub struct BlockStore {
    storage: Arc<dyn StorageManager>,
    blocks: BTreeMap<u32, Block>,
    file_blocks: BTreeMap<String, BTreeSet<u32>>,
}

impl BlockStore {
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        Self {
            storage,
            blocks: BTreeMap::new(),
            file_blocks: BTreeMap::new(),
        }
    }

    /// Insert blocks, replacing any block with the same ID.
    ///
    /// Blocks with an empty key or empty text are skipped. When `file_path`
    /// is given, the IDs of the inserted blocks are merged into its set.
    ///
    /// # Returns
    /// Number of blocks stored.
    pub fn add_items(&mut self, blocks: &[Block], file_path: Option<&str>) -> usize {
        let mut added = Vec::with_capacity(blocks.len());

        for block in blocks {
            if block.key.is_empty() {
                log::warn!("skipping block {} with empty key", block.id);
                continue;
            }
            if block.text.is_empty() {
                log::warn!("skipping block {} ({}) with empty text", block.id, block.key);
                continue;
            }
            self.blocks.insert(block.id, block.clone());
            added.push(block.id);
        }

        if let Some(path) = file_path {
            if !added.is_empty() {
                self.file_blocks
                    .entry(path.to_string())
                    .or_default()
                    .extend(added.iter().copied());
            }
        }

        added.len()
    }

    /// Remove a block and drop its ID from every file set.
    pub fn delete_item(&mut self, id: u32) -> bool {
        let removed = self.blocks.remove(&id).is_some();

        let mut found_in_file = false;
        self.file_blocks.retain(|_, ids| {
            found_in_file |= ids.remove(&id);
            !ids.is_empty()
        });

        if !removed && !found_in_file {
            log::warn!("block {id} not found, nothing to delete");
        }
        removed || found_in_file
    }

    pub fn search(&self, id: u32) -> Result<&Block, StoreError> {
        self.blocks.get(&id).ok_or(StoreError::NotFound {
            store: "block store",
            id,
        })
    }

    pub fn get_file_block_ids(&self, file_path: &str) -> Vec<u32> {
        self.file_blocks
            .get(file_path)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove every block owned by `file_path` and the path entry itself.
    ///
    /// # Returns
    /// IDs that were owned by the file.
    pub fn delete_file_blocks(&mut self, file_path: &str) -> Vec<u32> {
        let ids = self.get_file_block_ids(file_path);
        for id in &ids {
            self.delete_item(*id);
        }
        self.file_blocks.remove(file_path);
        ids
    }

    /// Move the ID set of `old_path` to `new_path`, merging with any set the
    /// new path already has. Block contents are untouched.
    pub fn rename_file_path(&mut self, old_path: &str, new_path: &str) -> bool {
        let Some(ids) = self.file_blocks.remove(old_path) else {
            log::warn!("cannot rename {old_path}: path is not indexed");
            return false;
        };
        self.file_blocks
            .entry(new_path.to_string())
            .or_default()
            .extend(ids);
        true
    }

    pub fn has_file(&self, file_path: &str) -> bool {
        self.file_blocks.contains_key(file_path)
    }

    pub fn get_all_file_paths(&self) -> Vec<String> {
        self.file_blocks.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.blocks.len()
    }

    pub fn save_maps(&self) -> Result<(), StoreError> {
        save_json(self.storage.as_ref(), BLOCK_MAP_FILE, &self.blocks)?;
        save_json(self.storage.as_ref(), FILE_BLOCKS_FILE, &self.file_blocks)?;
        Ok(())
    }

    /// Replace in-memory state with what is on disk. Missing or corrupt files
    /// load as empty maps.
    pub fn load_maps(&mut self) {
        self.blocks = load_json(self.storage.as_ref(), BLOCK_MAP_FILE);
        self.file_blocks = load_json(self.storage.as_ref(), FILE_BLOCKS_FILE);
        self.file_blocks.retain(|_, ids| !ids.is_empty());
        log::debug!(
            "loaded {} blocks across {} files",
            self.blocks.len(),
            self.file_blocks.len()
        );
    }

    pub fn reset_store(&mut self) -> Result<(), StoreError> {
        self.blocks.clear();
        self.file_blocks.clear();
        self.storage.remove(BLOCK_MAP_FILE)?;
        self.storage.remove(FILE_BLOCKS_FILE)?;
        Ok(())
    }
}
