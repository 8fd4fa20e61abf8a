//! Orchestrator over the block store, metadata store and vector index.
//!
//! `Database` is the only writer spanning stores. Every mutation is recorded
//! in the journal, and [`Database::save_data`] commits the stores in a fixed
//! order (vectors, metadata, blocks) behind that journal so an interrupted
//! commit is rolled forward on the next [`Database::initialize`].

use std::sync::Arc;

use serde::Serialize;

use super::block_store::BlockStore;
use super::journal::{CommitStage, Journal, JournalError, JournalOp};
use super::metadata_store::{Metadata, MetadataStore};
use super::vector_index::{EmbeddedVector, IndexError, VectorIndex};
use super::StoreError;
use crate::segment::{Block, DocumentBlocks};
use crate::storage::StorageManager;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
}

/// A similarity hit joined with its metadata and block.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: u32,
    pub score: f32,
    pub metadata: Metadata,
    pub block: Block,
}

/// Counters reported by `status`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DatabaseStatus {
    pub files: usize,
    pub blocks: usize,
    pub metadata: usize,
    pub vectors: usize,
    pub tombstones: usize,
    pub dimensions: usize,
    pub max_elements: usize,
    pub needs_compaction: bool,
    pub pending_ops: usize,
}

pub struct Database {
    blocks: BlockStore,
    metadata: MetadataStore,
    vectors: VectorIndex,
    journal: Journal,
}

impl Database {
    pub fn new(
        blocks: BlockStore,
        metadata: MetadataStore,
        vectors: VectorIndex,
        journal: Journal,
    ) -> Self {
        Self {
            blocks,
            metadata,
            vectors,
            journal,
        }
    }

    /// Wire every sub-store to `storage` and initialize them.
    pub fn open(
        storage: Arc<dyn StorageManager>,
        index_name: &str,
        dimensions: usize,
        max_elements: usize,
    ) -> Result<Self, DatabaseError> {
        let mut db = Self::new(
            BlockStore::new(storage.clone()),
            MetadataStore::new(storage.clone()),
            VectorIndex::new(storage.clone()),
            Journal::new(storage),
        );
        db.initialize(index_name, dimensions, max_elements)?;
        Ok(db)
    }

    /// Load every sub-store, then roll forward an interrupted commit.
    pub fn initialize(
        &mut self,
        index_name: &str,
        dimensions: usize,
        max_elements: usize,
    ) -> Result<(), DatabaseError> {
        self.blocks.load_maps();
        self.metadata.load_maps();
        self.vectors.initialize(index_name, dimensions, max_elements)?;

        if let Some(record) = self.journal.recover()? {
            log::warn!(
                "found unfinished commit from {} ({} ops, stages done: {:?}), replaying",
                record.started_at,
                record.ops.len(),
                record.committed
            );
            for op in record.ops {
                self.apply(&op)?;
                self.journal.record(op);
            }
            self.save_data()?;
        }

        Ok(())
    }

    /// Add a segmented document and its embeddings.
    ///
    /// `vectors[i]` must carry the ID of `doc.blocks[i]`; pairs that do not
    /// line up are skipped. Verified pairs go to the block store, the
    /// metadata store and the vector index, in that order.
    ///
    /// # Returns
    /// Number of verified pairs.
    pub fn add_items(
        &mut self,
        doc: &DocumentBlocks,
        vectors: &[EmbeddedVector],
    ) -> Result<usize, DatabaseError> {
        let (blocks, vectors) = Self::verify_pairs(doc, vectors);
        if blocks.is_empty() {
            log::info!("nothing to add for {}", doc.file_path);
            return Ok(0);
        }

        self.insert_verified(&doc.file_path, &doc.document_name, &blocks, &vectors)?;
        self.journal.record(JournalOp::Upsert {
            file_path: doc.file_path.clone(),
            document_name: doc.document_name.clone(),
            blocks: blocks.clone(),
            vectors,
        });
        Ok(blocks.len())
    }

    fn verify_pairs(
        doc: &DocumentBlocks,
        vectors: &[EmbeddedVector],
    ) -> (Vec<Block>, Vec<EmbeddedVector>) {
        if doc.blocks.len() != vectors.len() {
            log::warn!(
                "{}: {} blocks but {} vectors, extra entries are ignored",
                doc.file_path,
                doc.blocks.len(),
                vectors.len()
            );
        }

        doc.blocks
            .iter()
            .zip(vectors.iter())
            .enumerate()
            .filter_map(|(i, (block, vector))| {
                if block.id == vector.id {
                    Some((block.clone(), vector.clone()))
                } else {
                    log::warn!(
                        "{}: position {i} has block {} but vector {}, skipping",
                        doc.file_path,
                        block.id,
                        vector.id
                    );
                    None
                }
            })
            .unzip()
    }

    fn insert_verified(
        &mut self,
        file_path: &str,
        document_name: &str,
        blocks: &[Block],
        vectors: &[EmbeddedVector],
    ) -> Result<(), DatabaseError> {
        self.vectors.ensure_capacity(vectors.len())?;

        let metadata: Vec<Metadata> = blocks
            .iter()
            .map(|block| Metadata {
                id: block.id,
                key: block.key.clone(),
                file_path: file_path.to_string(),
                document_name: document_name.to_string(),
            })
            .collect();

        self.blocks.add_items(blocks, Some(file_path));
        self.metadata.add_items(&metadata);
        self.vectors.add_items(vectors)?;
        Ok(())
    }

    /// Remove `id` from every store. Returns whether any store held it.
    #[allow(dead_code)]
    pub fn delete_item(&mut self, id: u32) -> bool {
        let removed = self.remove_everywhere(id);
        self.journal.record(JournalOp::Delete { id });
        removed
    }

    fn remove_everywhere(&mut self, id: u32) -> bool {
        let in_blocks = self.blocks.delete_item(id);
        let in_metadata = self.metadata.delete_item(id);
        let in_vectors = self.vectors.delete_item(id);
        in_blocks || in_metadata || in_vectors
    }

    /// Delete every ID in `vectors`, then add the document.
    #[allow(dead_code)]
    pub fn update_item(
        &mut self,
        doc: &DocumentBlocks,
        vectors: &[EmbeddedVector],
    ) -> Result<usize, DatabaseError> {
        for vector in vectors {
            self.delete_item(vector.id);
        }
        self.add_items(doc, vectors)
    }

    /// Nearest blocks to `vector`, highest score first.
    ///
    /// Hits without metadata or block content are dropped.
    pub fn search(&mut self, vector: &[f32], k: usize) -> Result<Vec<SearchResult>, DatabaseError> {
        let hits = self.vectors.search(vector, k)?;

        let results = hits
            .into_iter()
            .filter_map(|hit| {
                let metadata = match self.metadata.search(hit.id) {
                    Ok(metadata) => metadata.clone(),
                    Err(e) => {
                        log::warn!("dropping hit {}: {e}", hit.id);
                        return None;
                    }
                };
                let block = match self.blocks.search(hit.id) {
                    Ok(block) => block.clone(),
                    Err(e) => {
                        log::warn!("dropping hit {}: {e}", hit.id);
                        return None;
                    }
                };
                Some(SearchResult {
                    id: hit.id,
                    score: hit.score,
                    metadata,
                    block,
                })
            })
            .collect();

        Ok(results)
    }

    pub fn get_vector_by_id(&self, id: u32) -> Result<&[f32], DatabaseError> {
        Ok(self.vectors.get_vector_by_id(id)?)
    }

    pub fn get_file_block_ids(&self, file_path: &str) -> Vec<u32> {
        self.blocks.get_file_block_ids(file_path)
    }

    /// Remove every block `file_path` owns from all stores.
    ///
    /// # Returns
    /// The removed IDs.
    pub fn delete_file_blocks(&mut self, file_path: &str) -> Vec<u32> {
        let ids = self.delete_file_everywhere(file_path);
        self.journal.record(JournalOp::DeleteFile {
            file_path: file_path.to_string(),
        });
        ids
    }

    fn delete_file_everywhere(&mut self, file_path: &str) -> Vec<u32> {
        let ids = self.blocks.get_file_block_ids(file_path);
        for id in &ids {
            self.remove_everywhere(*id);
        }
        self.blocks.delete_file_blocks(file_path);
        ids
    }

    /// Move a file's blocks to a new path. Block keys and IDs still carry the
    /// old document name.
    pub fn rename_file_path(&mut self, old_path: &str, new_path: &str) -> bool {
        let renamed = self.rename_everywhere(old_path, new_path);
        if renamed {
            self.journal.record(JournalOp::Rename {
                from: old_path.to_string(),
                to: new_path.to_string(),
            });
        }
        renamed
    }

    fn rename_everywhere(&mut self, old_path: &str, new_path: &str) -> bool {
        if !self.blocks.rename_file_path(old_path, new_path) {
            return false;
        }
        self.metadata.rename_file_path(old_path, new_path);
        true
    }

    pub fn has_file(&self, file_path: &str) -> bool {
        self.blocks.has_file(file_path)
    }

    pub fn get_all_file_paths(&self) -> Vec<String> {
        self.blocks.get_all_file_paths()
    }

    /// Wipe every store, keeping the vector index's dimensions and capacity.
    pub fn reset_database(&mut self) -> Result<(), DatabaseError> {
        let dimensions = self.vectors.dimensions();
        let max_elements = self.vectors.max_elements();

        self.journal.discard()?;
        self.blocks.reset_store()?;
        self.metadata.reset_store()?;
        self.vectors.reset_index(max_elements, dimensions)?;

        log::info!("database reset");
        Ok(())
    }

    /// Persist every store.
    ///
    /// With pending operations the journal is written first and each store
    /// is marked as it finishes; the journal is removed once all three are
    /// saved.
    pub fn save_data(&mut self) -> Result<(), DatabaseError> {
        let journaled = self.journal.has_pending();
        if journaled {
            self.journal.begin()?;
        }

        self.vectors.save()?;
        if journaled {
            self.journal.mark(CommitStage::Vectors)?;
        }

        self.metadata.save_maps()?;
        if journaled {
            self.journal.mark(CommitStage::Metadata)?;
        }

        self.blocks.save_maps()?;
        if journaled {
            self.journal.mark(CommitStage::Blocks)?;
            let ops = self.journal.pending().len();
            self.journal.finish()?;
            log::debug!("committed {ops} journaled operations");
        }

        Ok(())
    }

    /// Rebuild the vector index without tombstones and commit every store.
    pub fn compact(&mut self) -> Result<usize, DatabaseError> {
        let reclaimed = self.vectors.compact();
        self.save_data()?;
        Ok(reclaimed)
    }

    pub fn status(&self) -> DatabaseStatus {
        DatabaseStatus {
            files: self.blocks.get_all_file_paths().len(),
            blocks: self.blocks.count(),
            metadata: self.metadata.count(),
            vectors: self.vectors.count(),
            tombstones: self.vectors.tombstone_count(),
            dimensions: self.vectors.dimensions(),
            max_elements: self.vectors.max_elements(),
            needs_compaction: self.vectors.needs_compaction(),
            pending_ops: self.journal.pending().len(),
        }
    }

    /// Apply a journaled operation in its idempotent form.
    fn apply(&mut self, op: &JournalOp) -> Result<(), DatabaseError> {
        match op {
            JournalOp::Upsert {
                file_path,
                document_name,
                blocks,
                vectors,
            } => {
                for block in blocks {
                    self.remove_everywhere(block.id);
                }
                self.insert_verified(file_path, document_name, blocks, vectors)?;
            }
            JournalOp::Delete { id } => {
                self.remove_everywhere(*id);
            }
            JournalOp::DeleteFile { file_path } => {
                self.delete_file_everywhere(file_path);
                self.metadata_cleanup(file_path);
            }
            JournalOp::Rename { from, to } => {
                if !self.rename_everywhere(from, to) {
                    // block store already committed the rename
                    self.metadata.rename_file_path(from, to);
                }
            }
        }
        Ok(())
    }

    /// Drop metadata still pointing at a file whose blocks are gone.
    fn metadata_cleanup(&mut self, file_path: &str) {
        let stale: Vec<u32> = self
            .metadata
            .ids()
            .into_iter()
            .filter(|id| {
                self.metadata
                    .search(*id)
                    .map(|m| m.file_path == file_path)
                    .unwrap_or(false)
            })
            .collect();
        for id in stale {
            self.metadata.delete_item(id);
            self.vectors.delete_item(id);
        }
    }
}
