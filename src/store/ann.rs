// rust-cv/hnsw graph with label bookkeeping and tombstones

use std::collections::{HashMap, HashSet};

use hnsw::{Hnsw, Params, Searcher};
use rand::rngs::StdRng;
use space::{Metric, Neighbor};

use super::index_file::{IndexEntry, IndexSnapshot};
use super::vector_index::IndexError;

/// Candidate list size while building the graph.
const EF_CONSTRUCTION: usize = 150;

/// Lower bound on the candidate list size while searching.
/// Queries use max(wanted * 2, MIN_EF_SEARCH).
const MIN_EF_SEARCH: usize = 32;

/// Cosine distance lives in [0, 2] and is stored as u32 scaled by this.
const DISTANCE_SCALE: f32 = u32::MAX as f32 / 2.0;

/// 1 - cosine similarity, scaled to u32.
pub(crate) struct CosineDistance;

impl Metric<Box<[f32]>> for CosineDistance {
    type Unit = u32;

    fn distance(&self, a: &Box<[f32]>, b: &Box<[f32]>) -> u32 {
        match cosine_distance(a, b) {
            Some(distance) => (distance.clamp(0.0, 2.0) * DISTANCE_SCALE) as u32,
            None => u32::MAX,
        }
    }
}

/// Cosine distance of two vectors, `None` when either has zero norm.
fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    let dot: f32 = a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|y| y * y).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return None;
    }
    Some(1.0 - dot / (mag_a * mag_b))
}

/// HNSW graph over labelled vectors.
///
/// The graph never forgets a slot: deleting a label only tombstones its slot,
/// and tombstoned slots still count against `max_elements` until
/// [`AnnGraph::compact`] rebuilds the graph from live slots.
///
/// Parameters are fixed: M = 16, M0 = 32, ef_construction = 150 and a
/// `StdRng` seeded with its default seed, so replaying the same inserts
/// reproduces the same graph.
pub(crate) struct AnnGraph {
    hnsw: Hnsw<CosineDistance, Box<[f32]>, StdRng, 16, 32>,
    searcher: Searcher<u32>,
    /// slot -> label
    labels: Vec<u32>,
    /// live label -> slot
    live: HashMap<u32, usize>,
    /// tombstoned slots
    dead: HashSet<usize>,
    dimensions: usize,
    max_elements: usize,
}

impl AnnGraph {
    pub fn new(dimensions: usize, max_elements: usize) -> Self {
        Self {
            hnsw: Hnsw::new_params(
                CosineDistance,
                Params::new().ef_construction(EF_CONSTRUCTION),
            ),
            searcher: Searcher::default(),
            labels: Vec::new(),
            live: HashMap::new(),
            dead: HashSet::new(),
            dimensions,
            max_elements,
        }
    }

    /// Rebuild a graph by replaying a snapshot's inserts in slot order.
    pub fn from_snapshot(snapshot: &IndexSnapshot) -> Result<Self, IndexError> {
        let capacity = snapshot.max_elements.max(snapshot.entries.len());
        let mut graph = Self::new(snapshot.dimensions, capacity);

        for entry in &snapshot.entries {
            let slot = graph.insert(entry.label, entry.vector.clone())?;
            if entry.deleted {
                graph.tombstone_slot(slot);
            }
        }

        Ok(graph)
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        let entries = self
            .labels
            .iter()
            .enumerate()
            .map(|(slot, label)| IndexEntry {
                label: *label,
                deleted: self.dead.contains(&slot),
                vector: self.hnsw.feature(slot).to_vec(),
            })
            .collect();

        IndexSnapshot {
            dimensions: self.dimensions,
            max_elements: self.max_elements,
            entries,
        }
    }

    /// Insert a vector under `label`. A live slot with the same label is
    /// tombstoned first.
    ///
    /// # Returns
    /// The slot the vector was stored in.
    pub fn insert(&mut self, label: u32, vector: Vec<f32>) -> Result<usize, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        if self.labels.len() >= self.max_elements {
            return Err(IndexError::CapacityExceeded {
                capacity: self.max_elements,
                requested: self.labels.len() + 1,
            });
        }

        if let Some(old_slot) = self.live.remove(&label) {
            self.dead.insert(old_slot);
        }

        let slot = self
            .hnsw
            .insert(vector.into_boxed_slice(), &mut self.searcher);
        debug_assert_eq!(slot, self.labels.len());

        self.labels.push(label);
        self.live.insert(label, slot);
        Ok(slot)
    }

    /// Tombstone the live slot of `label`. Returns false if the label has no
    /// live slot.
    pub fn mark_deleted(&mut self, label: u32) -> bool {
        match self.live.remove(&label) {
            Some(slot) => {
                self.dead.insert(slot);
                true
            }
            None => false,
        }
    }

    fn tombstone_slot(&mut self, slot: usize) {
        if let Some(label) = self.labels.get(slot) {
            if self.live.get(label) == Some(&slot) {
                self.live.remove(label);
            }
            self.dead.insert(slot);
        }
    }

    pub fn contains(&self, label: u32) -> bool {
        self.live.contains_key(&label)
    }

    pub fn live_labels(&self) -> Vec<u32> {
        self.live.keys().copied().collect()
    }

    /// Number of live (non-tombstoned) labels.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn slot_count(&self) -> usize {
        self.labels.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.dead.len()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Search the k nearest live labels.
    ///
    /// # Returns
    /// (label, cosine distance) pairs, nearest first, at most `k` long.
    pub fn search(&mut self, query: &[f32], k: usize) -> Vec<(u32, f32)> {
        if k == 0 || self.live.is_empty() {
            return Vec::new();
        }

        // over-fetch so tombstoned slots cannot crowd out live ones
        let wanted = (k + self.dead.len()).min(self.labels.len());
        let ef_search = std::cmp::max(wanted * 2, MIN_EF_SEARCH);
        let mut neighbors = vec![
            Neighbor {
                index: !0,
                distance: !0
            };
            wanted
        ];

        let query = query.to_vec().into_boxed_slice();
        self.hnsw
            .nearest(&query, ef_search, &mut self.searcher, &mut neighbors);

        let mut hits: Vec<(u32, f32)> = neighbors
            .into_iter()
            .filter(|n| n.index != !0)
            .filter(|n| !self.dead.contains(&n.index))
            .map(|n| (self.labels[n.index], n.distance as f32 / DISTANCE_SCALE))
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits.truncate(k);
        hits
    }

    /// Rebuild the graph from live slots only, dropping tombstones.
    ///
    /// # Returns
    /// Number of slots reclaimed.
    pub fn compact(&mut self) -> usize {
        let reclaimed = self.dead.len();
        if reclaimed == 0 {
            return 0;
        }

        let live_entries: Vec<(u32, Vec<f32>)> = self
            .labels
            .iter()
            .enumerate()
            .filter(|(slot, _)| !self.dead.contains(slot))
            .map(|(slot, label)| (*label, self.hnsw.feature(slot).to_vec()))
            .collect();

        let mut rebuilt = Self::new(self.dimensions, self.max_elements);
        for (label, vector) in live_entries {
            // live count never exceeds the old slot count, so capacity holds
            if let Err(e) = rebuilt.insert(label, vector) {
                log::error!("compaction dropped label {label}: {e}");
            }
        }

        *self = rebuilt;
        reclaimed
    }
}
