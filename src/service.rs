//! Document indexing and related-block search.
//!
//! `DocumentService` ties the vault on disk, the embedding service and the
//! block database together:
//! - documents are segmented, embedded and written through the database
//! - vault-wide indexing runs in sequential batches of concurrent documents
//! - related blocks are looked up from a clicked heading

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use indicatif::ProgressBar;
use serde::Serialize;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::config::Config;
use crate::embeddings::{embed_blocks, Embedder, EmbeddingError};
use crate::hash;
use crate::segment::{clicked_heading_key, segment, HeadingLevel};
use crate::store::{Database, DatabaseError, DatabaseStatus, IndexError, SearchResult};
use crate::tagging::{normalize_tags, TagOptions, TagSuggestion, Tagger, TaggingError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Tagging error: {0}")]
    Tagging(#[from] TaggingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Block \"{key}\" ({id}) is not indexed")]
    BlockNotIndexed { key: String, id: u32 },

    #[error("Embedder produces {got}-dimensional vectors but the index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid document path: {0}")]
    InvalidPath(String),
}

/// Outcome of indexing a set of documents.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IndexReport {
    pub indexed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub blocks: usize,
}

/// Hands out increasing tickets so only the newest search's outcome is used.
#[derive(Debug, Default)]
pub struct SearchSequencer {
    latest: AtomicU64,
}

impl SearchSequencer {
    pub fn issue(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_latest(&self, ticket: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket
    }
}

/// File name used in block keys, e.g. `notes/today.md` -> `today.md`.
pub fn document_name(file_path: &str) -> Result<String, ServiceError> {
    Path::new(file_path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ServiceError::InvalidPath(file_path.to_string()))
}

pub struct DocumentService {
    db: Mutex<Database>,
    embedder: Arc<dyn Embedder>,
    tagger: Option<Arc<dyn Tagger>>,
    vault_root: PathBuf,
    heading_level: HeadingLevel,
    batch_size: usize,
    top_k: usize,
    sequencer: SearchSequencer,
}

impl DocumentService {
    /// # Arguments
    /// * `db` - An initialized database
    /// * `embedder` - Must produce vectors of the database's dimensionality
    /// * `vault_root` - Directory document paths are relative to
    /// * `config` - Heading marker, batch size and default top-k
    pub fn new(
        db: Database,
        embedder: Arc<dyn Embedder>,
        vault_root: impl Into<PathBuf>,
        config: &Config,
    ) -> Result<Self, ServiceError> {
        let expected = db.status().dimensions;
        if embedder.dimensions() != expected {
            return Err(ServiceError::DimensionMismatch {
                expected,
                got: embedder.dimensions(),
            });
        }

        Ok(Self {
            db: Mutex::new(db),
            embedder,
            tagger: None,
            vault_root: vault_root.into(),
            heading_level: config.heading_level(),
            batch_size: config.batch_size.max(1),
            top_k: config.top_k,
            sequencer: SearchSequencer::default(),
        })
    }

    #[allow(dead_code)]
    pub fn with_tagger(mut self, tagger: Arc<dyn Tagger>) -> Self {
        self.tagger = Some(tagger);
        self
    }

    /// Markdown files under the vault, as sorted vault-relative paths.
    pub fn scan_vault(&self) -> Vec<String> {
        let mut paths: Vec<String> = WalkDir::new(&self.vault_root)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "md"))
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.vault_root)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        paths.sort();
        paths
    }

    /// Segment, embed and store one document, replacing whatever the path
    /// held before. Not saved; call [`DocumentService::save`].
    ///
    /// # Returns
    /// Number of blocks stored.
    #[tracing::instrument(skip(self))]
    pub async fn index_document(&self, file_path: &str) -> Result<usize, ServiceError> {
        let name = document_name(file_path)?;
        let text = tokio::fs::read_to_string(self.vault_root.join(file_path)).await?;
        let doc = segment(file_path, &name, &text, self.heading_level);

        // no lock is held while waiting on the embedding service
        let vectors = embed_blocks(self.embedder.as_ref(), &doc).await?;

        let mut db = self.db.lock().await;
        let removed = db.delete_file_blocks(file_path);
        let added = db.add_items(&doc, &vectors)?;
        log::debug!(
            "indexed {file_path}: {added} blocks ({} previous removed)",
            removed.len()
        );
        Ok(added)
    }

    /// Index documents in sequential batches; documents inside a batch run
    /// concurrently. The database is saved after every batch. A failing
    /// document is reported and does not stop the others.
    pub async fn index_vault(
        &self,
        paths: &[String],
        progress: &ProgressBar,
    ) -> Result<IndexReport, ServiceError> {
        let mut report = IndexReport::default();
        progress.set_length(paths.len() as u64);

        for batch in paths.chunks(self.batch_size) {
            let outcomes = join_all(batch.iter().map(|path| self.index_document(path))).await;

            for (path, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(blocks) => {
                        report.blocks += blocks;
                        report.indexed.push(path.clone());
                    }
                    Err(e) => {
                        log::warn!("failed to index {path}: {e}");
                        report.failed.push((path.clone(), e.to_string()));
                    }
                }
                progress.inc(1);
            }

            self.save().await?;
        }

        log::info!(
            "indexed {} documents ({} blocks), {} failed",
            report.indexed.len(),
            report.blocks,
            report.failed.len()
        );
        Ok(report)
    }

    /// Drop a document's blocks from every store and save.
    pub async fn remove_document(&self, file_path: &str) -> Result<Vec<u32>, ServiceError> {
        let mut db = self.db.lock().await;
        let removed = db.delete_file_blocks(file_path);
        db.save_data()?;
        Ok(removed)
    }

    /// Follow a moved document.
    ///
    /// Block keys embed the document name, so when the name changes the
    /// document is re-indexed under its new path to recompute them. A move
    /// that keeps the name only moves the path entry.
    pub async fn rename_document(&self, old_path: &str, new_path: &str) -> Result<bool, ServiceError> {
        let renamed = {
            let mut db = self.db.lock().await;
            db.rename_file_path(old_path, new_path)
        };
        if !renamed {
            return Ok(false);
        }

        if document_name(old_path)? != document_name(new_path)? {
            match self.index_document(new_path).await {
                Ok(blocks) => log::info!("re-indexed {new_path} after rename ({blocks} blocks)"),
                Err(e) => log::warn!("renamed {old_path} to {new_path} but re-indexing failed: {e}"),
            }
        }

        self.save().await?;
        Ok(true)
    }

    /// Blocks related to the block that starts at `heading_text` in
    /// `document_name`, highest score first.
    ///
    /// # Arguments
    /// * `document_name` - File name of the document holding the heading
    /// * `heading_text` - Heading line as displayed, with or without its marker
    /// * `heading_marker` - Marker to strip, defaults to the configured one
    /// * `top_k` - Result count, defaults to the configured one
    pub async fn search_similar_blocks(
        &self,
        document_name: &str,
        heading_text: &str,
        heading_marker: Option<&str>,
        top_k: Option<usize>,
    ) -> Result<Vec<SearchResult>, ServiceError> {
        let marker = heading_marker
            .map(str::to_string)
            .unwrap_or_else(|| self.heading_level.marker());
        let key = clicked_heading_key(document_name, heading_text, &marker);
        let id = hash::block_id(&key);

        let mut db = self.db.lock().await;
        let vector = match db.get_vector_by_id(id) {
            Ok(vector) => vector.to_vec(),
            Err(DatabaseError::Index(IndexError::NotFound(_))) => {
                return Err(ServiceError::BlockNotIndexed { key, id })
            }
            Err(e) => return Err(e.into()),
        };

        Ok(db.search(&vector, top_k.unwrap_or(self.top_k))?)
    }

    /// Like [`DocumentService::search_similar_blocks`], but yields `None`
    /// when a newer search was started before this one finished.
    pub async fn search_latest(
        &self,
        document_name: &str,
        heading_text: &str,
        heading_marker: Option<&str>,
        top_k: Option<usize>,
    ) -> Option<Result<Vec<SearchResult>, ServiceError>> {
        let ticket = self.sequencer.issue();
        let outcome = self
            .search_similar_blocks(document_name, heading_text, heading_marker, top_k)
            .await;

        if self.sequencer.is_latest(ticket) {
            Some(outcome)
        } else {
            log::debug!("dropping stale search result #{ticket}");
            None
        }
    }

    /// Ask the tagging service for tags of a vault document.
    #[allow(dead_code)]
    pub async fn suggest_tags(
        &self,
        file_path: &str,
        options: &TagOptions,
    ) -> Result<TagSuggestion, ServiceError> {
        let tagger = self.tagger.as_ref().ok_or(TaggingError::NotConfigured)?;
        let name = document_name(file_path)?;
        let content = tokio::fs::read_to_string(self.vault_root.join(file_path)).await?;

        let suggestion = tagger.generate_tags(&content, &name, options).await?;
        Ok(TagSuggestion {
            tags: normalize_tags(&suggestion.tags, options.max_tags),
            confidence: suggestion.confidence,
        })
    }

    pub async fn save(&self) -> Result<(), ServiceError> {
        self.db.lock().await.save_data()?;
        Ok(())
    }

    pub async fn status(&self) -> DatabaseStatus {
        self.db.lock().await.status()
    }

    pub async fn compact(&self) -> Result<usize, ServiceError> {
        Ok(self.db.lock().await.compact()?)
    }

    pub async fn reset(&self) -> Result<(), ServiceError> {
        self.db.lock().await.reset_database()?;
        Ok(())
    }

    pub async fn is_indexed(&self, file_path: &str) -> bool {
        self.db.lock().await.has_file(file_path)
    }

    pub async fn indexed_files(&self) -> Vec<String> {
        self.db.lock().await.get_all_file_paths()
    }

    pub async fn file_block_ids(&self, file_path: &str) -> Vec<u32> {
        self.db.lock().await.get_file_block_ids(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{create_service, seed_vault, FakeEmbedder};

    #[test]
    fn test_sequencer_only_latest_wins() {
        let sequencer = SearchSequencer::default();
        let first = sequencer.issue();
        assert!(sequencer.is_latest(first));

        let second = sequencer.issue();
        assert!(second > first);
        assert!(!sequencer.is_latest(first));
        assert!(sequencer.is_latest(second));
    }

    #[test]
    fn test_document_name() {
        assert_eq!(document_name("notes/daily/today.md").unwrap(), "today.md");
        assert_eq!(document_name("today.md").unwrap(), "today.md");
        assert!(matches!(
            document_name(".."),
            Err(ServiceError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_superseded_search_is_dropped() {
        let vault = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        seed_vault(vault.path());
        let service = create_service(vault.path(), data.path(), FakeEmbedder::default());
        service.index_document("rust.md").await.unwrap();

        // hold the database so both searches are in flight at once
        let guard = service.db.lock().await;
        let mut first = Box::pin(service.search_latest("rust.md", "### Ownership", None, None));
        let mut second = Box::pin(service.search_latest("rust.md", "### Traits", None, None));
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(futures::poll!(second.as_mut()).is_pending());
        drop(guard);

        let (first, second) = tokio::join!(first, second);
        assert!(first.is_none());
        let results = second.unwrap().unwrap();
        assert_eq!(results[0].block.key, "Traits of rust.md");
    }
}
