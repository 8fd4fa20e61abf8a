//! Write-ahead journal for cross-store commits.
//!
//! Mutations of the database are recorded here in memory. A commit writes the
//! pending operations to `JOURNAL.json`, saves the stores one at a time while
//! recording each finished stage, and deletes the journal at the end. A
//! journal found at startup belongs to an interrupted commit and is replayed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::vector_index::EmbeddedVector;
use crate::segment::Block;
use crate::storage::StorageManager;

pub const JOURNAL_FILE: &str = "JOURNAL.json";

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("No commit in progress")]
    NotStarted,
}

/// A replayable database mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum JournalOp {
    #[serde(rename_all = "camelCase")]
    Upsert {
        file_path: String,
        document_name: String,
        blocks: Vec<Block>,
        vectors: Vec<EmbeddedVector>,
    },
    Delete {
        id: u32,
    },
    #[serde(rename_all = "camelCase")]
    DeleteFile {
        file_path: String,
    },
    Rename {
        from: String,
        to: String,
    },
}

/// Stores in commit order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStage {
    Vectors,
    Metadata,
    Blocks,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub started_at: DateTime<Utc>,
    pub ops: Vec<JournalOp>,
    #[serde(default)]
    pub committed: Vec<CommitStage>,
}

pub struct Journal {
    storage: Arc<dyn StorageManager>,
    pending: Vec<JournalOp>,
    in_flight: Option<JournalRecord>,
}

impl Journal {
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        Self {
            storage,
            pending: Vec::new(),
            in_flight: None,
        }
    }

    pub fn record(&mut self, op: JournalOp) {
        self.pending.push(op);
    }

    pub fn pending(&self) -> &[JournalOp] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Persist the pending operations before any store is written.
    pub fn begin(&mut self) -> Result<(), JournalError> {
        let record = JournalRecord {
            started_at: Utc::now(),
            ops: self.pending.clone(),
            committed: Vec::new(),
        };
        self.write(&record)?;
        self.in_flight = Some(record);
        Ok(())
    }

    /// Record that `stage` has been saved.
    pub fn mark(&mut self, stage: CommitStage) -> Result<(), JournalError> {
        let mut record = self.in_flight.take().ok_or(JournalError::NotStarted)?;
        record.committed.push(stage);
        let written = self.write(&record);
        self.in_flight = Some(record);
        written
    }

    /// Every store is saved: drop the journal file and the pending operations.
    pub fn finish(&mut self) -> Result<(), JournalError> {
        self.storage.remove(JOURNAL_FILE)?;
        self.in_flight = None;
        self.pending.clear();
        Ok(())
    }

    /// Read the journal of an interrupted commit, if any.
    ///
    /// A journal that cannot be parsed was never completely written, so no
    /// store was touched by its commit; it is discarded.
    pub fn recover(&mut self) -> Result<Option<JournalRecord>, JournalError> {
        if !self.storage.exists(JOURNAL_FILE) {
            return Ok(None);
        }

        let bytes = self.storage.read(JOURNAL_FILE)?;
        match serde_json::from_slice::<JournalRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                log::warn!("discarding unreadable journal: {e}");
                self.storage.remove(JOURNAL_FILE)?;
                Ok(None)
            }
        }
    }

    /// Forget every pending operation and any journal on disk.
    pub fn discard(&mut self) -> Result<(), JournalError> {
        self.pending.clear();
        self.in_flight = None;
        self.storage.remove(JOURNAL_FILE)?;
        Ok(())
    }

    fn write(&self, record: &JournalRecord) -> Result<(), JournalError> {
        let bytes = serde_json::to_vec(record)?;
        self.storage.write(JOURNAL_FILE, &bytes)?;
        Ok(())
    }
}
