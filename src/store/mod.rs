//! Persisted block database.
//!
//! # Architecture
//!
//! - `block_store`: block ID -> block text, plus the file path -> block IDs index
//! - `metadata_store`: block ID -> provenance (key, file path, document name)
//! - `ann`: HNSW graph with tombstones over the stored vectors
//! - `index_file`: binary persistence for the HNSW graph
//! - `vector_index`: validated vector store wrapping the graph and the ID -> vector map
//! - `journal`: pending cross-store operations and staged commit bookkeeping
//! - `database`: the orchestrator keeping all of the above consistent

mod ann;
pub(crate) mod block_store;
mod database;
mod index_file;
pub(crate) mod journal;
pub(crate) mod metadata_store;
pub(crate) mod vector_index;

pub use database::{Database, DatabaseError, DatabaseStatus, SearchResult};
pub use vector_index::{EmbeddedVector, IndexError};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::StorageManager;

/// Default name of the binary HNSW index file.
pub const DEFAULT_INDEX_NAME: &str = "indexFile";
/// Default embedding dimensionality.
pub const DEFAULT_DIMENSIONS: usize = 1536;
/// Default capacity of the HNSW graph.
pub const DEFAULT_MAX_ELEMENTS: usize = 10_000;

/// Errors shared by the JSON-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{store}: id {id} not found")]
    NotFound { store: &'static str, id: u32 },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Read a JSON document, substituting the default value when the file is
/// missing or unreadable.
pub(crate) fn load_json<T>(storage: &dyn StorageManager, name: &str) -> T
where
    T: DeserializeOwned + Default,
{
    if !storage.exists(name) {
        log::debug!("{name} does not exist, starting empty");
        return T::default();
    }

    let bytes = match storage.read(name) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("failed to read {name}, starting empty: {e}");
            return T::default();
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("{name} is malformed, starting empty: {e}");
            T::default()
        }
    }
}

pub(crate) fn save_json<T>(storage: &dyn StorageManager, name: &str, value: &T) -> Result<(), StoreError>
where
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    storage.write(name, &bytes)?;
    Ok(())
}
