//! Vector store over the HNSW graph.
//!
//! The graph cannot hand back a vector by label, so every live vector is also
//! kept in an ID -> vector map persisted as `ID_TO_VECTOR.json`, next to the
//! set of tombstoned IDs. After every load the live labels of the graph and
//! the key set of that map are reconciled so they are equal.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::ann::AnnGraph;
use super::index_file::{IndexFileError, IndexSnapshot};
use super::{load_json, save_json, StoreError, DEFAULT_DIMENSIONS, DEFAULT_INDEX_NAME, DEFAULT_MAX_ELEMENTS};
use crate::storage::StorageManager;

pub const ID_TO_VECTOR_FILE: &str = "ID_TO_VECTOR.json";

/// Tombstone share above which compaction is worth running.
const COMPACTION_THRESHOLD: f32 = 0.3;

/// Errors that can occur in vector index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector contains non-finite values")]
    NonFiniteVector,

    #[error("Index capacity {capacity} exceeded: {requested} entries requested")]
    CapacityExceeded { capacity: usize, requested: usize },

    #[error("vector index: id {0} not found")]
    NotFound(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index file error: {0}")]
    File(#[from] IndexFileError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// An embedding keyed by block ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedVector {
    pub id: u32,
    pub vector: Vec<f32>,
}

/// A nearest-neighbor hit.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorHit {
    pub id: u32,
    /// 1 - cosine distance, clamped to [0, 1]
    pub score: f32,
}

/// Outcome of comparing the graph's live labels with the vector map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// IDs that were in the map but not live in the graph; dropped from the
    /// map and tombstoned.
    pub map_only: Vec<u32>,
    /// Labels live in the graph without a map entry; tombstoned in the graph.
    pub index_only: Vec<u32>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.map_only.is_empty() && self.index_only.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VectorMapFile {
    #[serde(default)]
    id_to_vector: BTreeMap<u32, Vec<f32>>,
    #[serde(default)]
    deleted_ids: BTreeSet<u32>,
}

pub struct VectorIndex {
    storage: Arc<dyn StorageManager>,
    index_name: String,
    graph: AnnGraph,
    id_to_vector: BTreeMap<u32, Vec<f32>>,
    deleted_ids: BTreeSet<u32>,
    /// Serializes writers of the index file and the vector map.
    save_lock: Mutex<()>,
}

impl VectorIndex {
    /// Create an empty, unsaved index with default settings.
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        Self {
            storage,
            index_name: DEFAULT_INDEX_NAME.to_string(),
            graph: AnnGraph::new(DEFAULT_DIMENSIONS, DEFAULT_MAX_ELEMENTS),
            id_to_vector: BTreeMap::new(),
            deleted_ids: BTreeSet::new(),
            save_lock: Mutex::new(()),
        }
    }

    /// Load the index stored under `index_name`, or start an empty one.
    ///
    /// An index file that is corrupt, from a newer format or built for other
    /// dimensions is replaced by an empty index. Read failures are returned.
    /// The vector map is loaded afterwards and reconciled with the graph.
    pub fn initialize(
        &mut self,
        index_name: &str,
        dimensions: usize,
        max_elements: usize,
    ) -> Result<ReconcileReport, IndexError> {
        self.index_name = index_name.to_string();
        self.graph = self.load_graph(dimensions, max_elements)?;

        self.load_maps();

        let report = self.reconcile();
        if !report.is_consistent() {
            log::warn!(
                "reconciled vector index: {} map-only ids tombstoned, {} index-only labels tombstoned",
                report.map_only.len(),
                report.index_only.len()
            );
        }
        log::info!(
            "vector index {} ready: {} live vectors, {} tombstones, capacity {}",
            self.index_name,
            self.graph.len(),
            self.graph.deleted_count(),
            self.graph.max_elements()
        );
        Ok(report)
    }

    fn load_graph(&self, dimensions: usize, max_elements: usize) -> Result<AnnGraph, IndexError> {
        if !self.storage.exists(&self.index_name) {
            log::info!("no index file {}, creating a new index", self.index_name);
            return Ok(AnnGraph::new(dimensions, max_elements));
        }

        let bytes = self.storage.read(&self.index_name)?;
        let snapshot = match IndexSnapshot::decode(&bytes, dimensions) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("index file {} is unusable ({e}), creating a new index", self.index_name);
                return Ok(AnnGraph::new(dimensions, max_elements));
            }
        };

        let snapshot = IndexSnapshot {
            max_elements: snapshot.max_elements.max(max_elements),
            ..snapshot
        };
        AnnGraph::from_snapshot(&snapshot)
    }

    /// Validate and insert vectors.
    ///
    /// Vectors that are empty, have the wrong dimensionality, contain
    /// non-finite values, have zero norm, or whose ID is already live are
    /// skipped with a warning. A tombstoned ID is reusable. Capacity is
    /// checked for the whole batch before anything is inserted; when only
    /// tombstones stand in the way the graph is compacted first.
    ///
    /// # Returns
    /// Number of vectors inserted.
    pub fn add_items(&mut self, vectors: &[EmbeddedVector]) -> Result<usize, IndexError> {
        let mut seen = HashSet::new();
        let valid: Vec<&EmbeddedVector> = vectors
            .iter()
            .filter(|v| match self.validate(v) {
                Ok(()) if seen.insert(v.id) => true,
                Ok(()) => {
                    log::warn!("skipping vector {}: duplicated within batch", v.id);
                    false
                }
                Err(reason) => {
                    log::warn!("skipping vector {}: {reason}", v.id);
                    false
                }
            })
            .collect();

        if valid.is_empty() {
            log::info!("no valid vectors to add");
            return Ok(0);
        }

        self.ensure_capacity(valid.len())?;

        for item in &valid {
            if self.deleted_ids.remove(&item.id) {
                log::debug!("reusing tombstoned id {}", item.id);
            }
            self.graph.insert(item.id, item.vector.clone())?;
            self.id_to_vector.insert(item.id, item.vector.clone());
        }

        log::debug!("added {} vectors", valid.len());
        Ok(valid.len())
    }

    fn validate(&self, item: &EmbeddedVector) -> Result<(), String> {
        let expected = self.graph.dimensions();
        if item.vector.is_empty() {
            return Err("empty vector".to_string());
        }
        if item.vector.len() != expected {
            return Err(format!(
                "expected {expected} dimensions, got {}",
                item.vector.len()
            ));
        }
        if item.vector.iter().any(|v| !v.is_finite()) {
            return Err("vector contains NaN or infinite values".to_string());
        }
        if item.vector.iter().all(|v| *v == 0.0) {
            return Err("zero-norm vector".to_string());
        }
        if self.id_to_vector.contains_key(&item.id) && !self.deleted_ids.contains(&item.id) {
            return Err("id is already active".to_string());
        }
        Ok(())
    }

    /// Make room for `additional` inserts, compacting if that is enough.
    pub fn ensure_capacity(&mut self, additional: usize) -> Result<(), IndexError> {
        let capacity = self.graph.max_elements();
        if self.graph.slot_count() + additional <= capacity {
            return Ok(());
        }
        if self.graph.len() + additional > capacity {
            return Err(IndexError::CapacityExceeded {
                capacity,
                requested: self.graph.len() + additional,
            });
        }
        let reclaimed = self.graph.compact();
        log::info!("compacted vector index before insert, reclaimed {reclaimed} slots");
        Ok(())
    }

    /// Nearest live vectors to `query`, highest score first, at most `k`.
    pub fn search(&mut self, query: &[f32], k: usize) -> Result<Vec<VectorHit>, IndexError> {
        let expected = self.graph.dimensions();
        if query.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                got: query.len(),
            });
        }
        if query.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFiniteVector);
        }

        let hits = self
            .graph
            .search(query, k)
            .into_iter()
            .map(|(id, distance)| VectorHit {
                id,
                score: (1.0 - distance).clamp(0.0, 1.0),
            })
            .collect();
        Ok(hits)
    }

    /// Tombstone `id` in the graph and drop it from the vector map.
    ///
    /// A graph that has no live slot for a mapped ID is logged; the map is
    /// cleaned up regardless.
    pub fn delete_item(&mut self, id: u32) -> bool {
        let mapped = self.id_to_vector.contains_key(&id);
        let live = self.graph.contains(id);

        if !mapped && !live {
            log::warn!("vector {id} not found, nothing to delete");
            return false;
        }

        if !self.graph.mark_deleted(id) {
            log::warn!("vector {id} had no live slot in the index, cleaning maps only");
        }
        self.id_to_vector.remove(&id);
        self.deleted_ids.insert(id);
        true
    }

    pub fn get_vector_by_id(&self, id: u32) -> Result<&[f32], IndexError> {
        self.id_to_vector
            .get(&id)
            .map(|v| v.as_slice())
            .ok_or(IndexError::NotFound(id))
    }

    /// Write the index file, then the vector map.
    pub fn save(&self) -> Result<(), IndexError> {
        let _guard = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());

        let bytes = self.graph.snapshot().encode();
        self.storage.write(&self.index_name, &bytes)?;
        self.save_maps()?;

        log::debug!(
            "saved vector index {} ({} slots)",
            self.index_name,
            self.graph.slot_count()
        );
        Ok(())
    }

    fn save_maps(&self) -> Result<(), StoreError> {
        let file = VectorMapFile {
            id_to_vector: self.id_to_vector.clone(),
            deleted_ids: self.deleted_ids.clone(),
        };
        save_json(self.storage.as_ref(), ID_TO_VECTOR_FILE, &file)
    }

    /// Replace the vector map with what is on disk. Missing or corrupt files
    /// load as empty.
    pub fn load_maps(&mut self) {
        let file: VectorMapFile = load_json(self.storage.as_ref(), ID_TO_VECTOR_FILE);
        self.id_to_vector = file.id_to_vector;
        self.deleted_ids = file.deleted_ids;
    }

    /// Clear the vector map and persist the empty map.
    pub fn reset_map(&mut self) -> Result<(), IndexError> {
        let _guard = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.id_to_vector.clear();
        self.deleted_ids.clear();
        self.save_maps()?;
        Ok(())
    }

    /// Replace the graph with an empty one, clear the map and persist both.
    pub fn reset_index(&mut self, max_elements: usize, dimensions: usize) -> Result<(), IndexError> {
        self.graph = AnnGraph::new(dimensions, max_elements);
        self.reset_map()?;
        self.save()
    }

    /// Make the graph's live labels equal the vector map's keys.
    pub fn reconcile(&mut self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mapped: Vec<u32> = self.id_to_vector.keys().copied().collect();
        for id in mapped {
            let usable = self.graph.contains(id)
                && self
                    .id_to_vector
                    .get(&id)
                    .map(|v| v.len() == self.graph.dimensions())
                    .unwrap_or(false);
            if !usable {
                self.graph.mark_deleted(id);
                self.id_to_vector.remove(&id);
                self.deleted_ids.insert(id);
                report.map_only.push(id);
            }
        }

        let mut live = self.graph.live_labels();
        live.sort_unstable();
        for label in live {
            if !self.id_to_vector.contains_key(&label) {
                self.graph.mark_deleted(label);
                self.deleted_ids.insert(label);
                report.index_only.push(label);
            }
        }

        report
    }

    /// Rebuild the graph without tombstoned slots.
    pub fn compact(&mut self) -> usize {
        self.graph.compact()
    }

    pub fn needs_compaction(&self) -> bool {
        let slots = self.graph.slot_count();
        slots > 0 && self.graph.deleted_count() as f32 / slots as f32 > COMPACTION_THRESHOLD
    }

    /// Number of live vectors.
    pub fn count(&self) -> usize {
        self.graph.len()
    }

    pub fn map_len(&self) -> usize {
        self.id_to_vector.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.graph.deleted_count()
    }

    pub fn deleted_ids(&self) -> &BTreeSet<u32> {
        &self.deleted_ids
    }

    pub fn contains(&self, id: u32) -> bool {
        self.id_to_vector.contains_key(&id)
    }

    pub fn dimensions(&self) -> usize {
        self.graph.dimensions()
    }

    pub fn max_elements(&self) -> usize {
        self.graph.max_elements()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    fn create_index(dims: usize, max: usize) -> (VectorIndex, Arc<dyn StorageManager>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        let mut index = VectorIndex::new(storage.clone());
        index.initialize("testIndex", dims, max).unwrap();
        (index, storage, tmp)
    }

    fn ev(id: u32, vector: Vec<f32>) -> EmbeddedVector {
        EmbeddedVector { id, vector }
    }

    fn five_vectors() -> Vec<EmbeddedVector> {
        vec![
            ev(1, vec![1.0, 0.0, 0.0]),
            ev(2, vec![0.0, 1.0, 0.0]),
            ev(3, vec![0.0, 0.0, 1.0]),
            ev(4, vec![0.9, 0.0, 0.0]),
            ev(5, vec![0.0, 0.9, 0.0]),
        ]
    }

    #[test]
    fn test_add_five_vectors() {
        let (mut index, _, _tmp) = create_index(3, 100);
        assert_eq!(index.add_items(&five_vectors()).unwrap(), 5);
        assert_eq!(index.count(), 5);
        assert_eq!(index.map_len(), 5);
    }

    #[test]
    fn test_add_rejects_invalid_vectors() {
        let (mut index, _, _tmp) = create_index(3, 100);
        index.add_items(&[ev(1, vec![1.0, 0.0, 0.0])]).unwrap();

        let batch = vec![
            ev(10, vec![]),
            ev(11, vec![1.0, 0.0]),
            ev(12, vec![1.0, f32::NAN, 0.0]),
            ev(1, vec![0.0, 1.0, 0.0]),
            ev(13, vec![0.0, 0.0, 1.0]),
        ];
        assert_eq!(index.add_items(&batch).unwrap(), 1);
        assert_eq!(index.count(), 2);
        assert_eq!(index.get_vector_by_id(1).unwrap(), &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_add_nothing_valid_is_noop() {
        let (mut index, _, _tmp) = create_index(3, 100);
        assert_eq!(index.add_items(&[ev(1, vec![0.0, 0.0, 0.0])]).unwrap(), 0);
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn test_deleted_id_can_be_reused() {
        let (mut index, _, _tmp) = create_index(3, 100);
        index.add_items(&[ev(1, vec![1.0, 0.0, 0.0])]).unwrap();

        assert!(index.delete_item(1));
        assert!(index.deleted_ids().contains(&1));
        assert!(index.get_vector_by_id(1).is_err());

        assert_eq!(index.add_items(&[ev(1, vec![0.0, 1.0, 0.0])]).unwrap(), 1);
        assert!(!index.deleted_ids().contains(&1));
        assert_eq!(index.get_vector_by_id(1).unwrap(), &[0.0, 1.0, 0.0]);

        let hits = index.search(&[0.0, 1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, 1);
        assert!(hits[0].score > 0.99);
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let (mut index, _, _tmp) = create_index(3, 100);
        assert!(!index.delete_item(99));
    }

    #[test]
    fn test_search_ordering_and_bounds() {
        let (mut index, _, _tmp) = create_index(3, 100);
        index.add_items(&five_vectors()).unwrap();
        index.delete_item(4);

        let hits = index.search(&[1.0, 0.2, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 4);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        assert!(hits.iter().all(|h| h.id != 4));
        assert_eq!(hits[0].id, 1);

        assert_eq!(index.search(&[1.0, 0.2, 0.0], 2).unwrap().len(), 2);
        assert!(index.search(&[1.0, 0.2, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_scores_are_clamped_for_opposite_vectors() {
        let (mut index, _, _tmp) = create_index(2, 10);
        index.add_items(&[ev(1, vec![-1.0, 0.0])]).unwrap();
        let hits = index.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].score, 0.0);
    }

    #[test]
    fn test_search_rejects_bad_query() {
        let (mut index, _, _tmp) = create_index(3, 10);
        assert!(matches!(
            index.search(&[1.0], 1),
            Err(IndexError::DimensionMismatch { expected: 3, got: 1 })
        ));
        assert!(matches!(
            index.search(&[f32::NAN, 0.0, 0.0], 1),
            Err(IndexError::NonFiniteVector)
        ));
    }

    #[test]
    fn test_capacity_compacts_then_fails() {
        let (mut index, _, _tmp) = create_index(2, 2);
        index.add_items(&[ev(1, vec![1.0, 0.0]), ev(2, vec![0.0, 1.0])]).unwrap();
        index.delete_item(1);

        assert_eq!(index.add_items(&[ev(3, vec![1.0, 1.0])]).unwrap(), 1);
        assert_eq!(index.tombstone_count(), 0);
        assert_eq!(index.count(), 2);

        assert!(matches!(
            index.add_items(&[ev(4, vec![1.0, -1.0])]),
            Err(IndexError::CapacityExceeded { capacity: 2, .. })
        ));
        assert!(!index.contains(4));
    }

    #[test]
    fn test_save_and_initialize_roundtrip() {
        let (mut index, storage, _tmp) = create_index(3, 100);
        index.add_items(&five_vectors()).unwrap();
        index.delete_item(2);
        index.save().unwrap();

        let mut loaded = VectorIndex::new(storage);
        let report = loaded.initialize("testIndex", 3, 100).unwrap();
        assert!(report.is_consistent());
        assert_eq!(loaded.count(), 4);
        assert_eq!(loaded.map_len(), 4);
        assert!(loaded.deleted_ids().contains(&2));
        assert_eq!(loaded.get_vector_by_id(5).unwrap(), &[0.0, 0.9, 0.0]);

        let hits = loaded.search(&[0.0, 1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, 5);
    }

    #[test]
    fn test_reconcile_repairs_both_directions() {
        let (mut index, storage, _tmp) = create_index(3, 100);
        index.add_items(&five_vectors()).unwrap();
        index.save().unwrap();

        // map gains an id the graph never saw, loses one the graph has
        let mut raw: serde_json::Value =
            serde_json::from_slice(&storage.read(ID_TO_VECTOR_FILE).unwrap()).unwrap();
        raw["idToVector"]["77"] = serde_json::json!([0.5, 0.5, 0.0]);
        raw["idToVector"].as_object_mut().unwrap().remove("3");
        storage
            .write(ID_TO_VECTOR_FILE, &serde_json::to_vec(&raw).unwrap())
            .unwrap();

        let mut loaded = VectorIndex::new(storage);
        let report = loaded.initialize("testIndex", 3, 100).unwrap();
        assert_eq!(report.map_only, vec![77]);
        assert_eq!(report.index_only, vec![3]);
        assert_eq!(loaded.count(), 4);
        assert_eq!(loaded.map_len(), 4);
        assert!(loaded.deleted_ids().contains(&77));
        assert!(loaded.deleted_ids().contains(&3));
        assert!(loaded.search(&[0.0, 0.0, 1.0], 5).unwrap().iter().all(|h| h.id != 3));
    }

    #[test]
    fn test_corrupt_index_file_starts_fresh() {
        let (mut index, storage, _tmp) = create_index(3, 100);
        index.add_items(&five_vectors()).unwrap();
        index.save().unwrap();
        storage.write("testIndex", b"garbage").unwrap();

        let mut loaded = VectorIndex::new(storage);
        let report = loaded.initialize("testIndex", 3, 100).unwrap();
        assert_eq!(loaded.count(), 0);
        assert_eq!(loaded.map_len(), 0);
        assert_eq!(report.map_only.len(), 5);
    }

    #[test]
    fn test_reset_index_persists_empty_state() {
        let (mut index, storage, _tmp) = create_index(3, 100);
        index.add_items(&five_vectors()).unwrap();
        index.save().unwrap();

        index.reset_index(50, 4).unwrap();
        assert_eq!(index.count(), 0);
        assert_eq!(index.dimensions(), 4);

        let mut loaded = VectorIndex::new(storage);
        loaded.initialize("testIndex", 4, 50).unwrap();
        assert_eq!(loaded.count(), 0);
        assert_eq!(loaded.map_len(), 0);
        assert!(loaded.deleted_ids().is_empty());
    }


    #[test]
    fn test_needs_compaction() {
        let (mut index, _, _tmp) = create_index(3, 10);
        index.add_items(&five_vectors()).unwrap();
        assert!(!index.needs_compaction());
        index.delete_item(1);
        index.delete_item(2);
        assert!(index.needs_compaction());
        assert_eq!(index.compact(), 2);
        assert!(!index.needs_compaction());
    }
}
