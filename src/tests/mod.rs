
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::embeddings::{Embedder, EmbeddingError};
use crate::service::DocumentService;
use crate::storage::{BackendLocal, StorageManager};
use crate::store::Database;
use crate::tagging::{TagOptions, TagSuggestion, Tagger, TaggingError};

pub(crate) const TEST_DIMENSIONS: usize = 3;
pub(crate) const TEST_INDEX: &str = "testIndex";

/// Embeds text by counting topic words, so related blocks land close together.
#[derive(Default)]
pub(crate) struct FakeEmbedder {
    pub calls: AtomicUsize,
    pub fail_on: Option<String>,
}

impl FakeEmbedder {
    pub fn failing_on(word: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on: Some(word.to_string()),
        }
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let text = text.to_lowercase();
        ["rust", "garden", "cook"]
            .iter()
            .map(|topic| 0.05 + text.matches(topic).count() as f32)
            .collect()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(word) = &self.fail_on {
            if texts.iter().any(|t| t.contains(word.as_str())) {
                return Err(EmbeddingError::Api {
                    status: 500,
                    body: format!("refusing to embed {word}"),
                });
            }
        }

        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }

    fn dimensions(&self) -> usize {
        TEST_DIMENSIONS
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

pub(crate) struct FakeTagger {
    pub tags: Vec<String>,
}

#[async_trait]
impl Tagger for FakeTagger {
    async fn generate_tags(
        &self,
        _content: &str,
        _document_name: &str,
        _options: &TagOptions,
    ) -> Result<TagSuggestion, TaggingError> {
        Ok(TagSuggestion {
            tags: self.tags.clone(),
            confidence: Some(0.8),
        })
    }
}

pub(crate) fn open_database(data_dir: &Path, max_elements: usize) -> Database {
    let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(data_dir).unwrap());
    Database::open(storage, TEST_INDEX, TEST_DIMENSIONS, max_elements).unwrap()
}

pub(crate) fn write_doc(vault: &Path, rel_path: &str, text: &str) {
    let path = vault.join(rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, text).unwrap();
}

/// A vault with three documents about rust, gardening and cooking.
pub(crate) fn seed_vault(vault: &Path) {
    write_doc(
        vault,
        "rust.md",
        "### Ownership\nrust borrow rules in rust\n### Traits\nrust traits",
    );
    write_doc(
        vault,
        "notes/garden.md",
        "intro to the garden and what to cook\n### Tomatoes\ngarden tomatoes grow\n### Rust fungus\ngarden rust disease",
    );
    write_doc(vault, "cooking.md", "cook pasta, then cook sauce");
}

pub(crate) fn create_service(vault: &Path, data_dir: &Path, embedder: FakeEmbedder) -> DocumentService {
    let mut config = Config::default();
    config.dimensions = TEST_DIMENSIONS;
    config.batch_size = 2;

    let db = open_database(data_dir, 100);
    DocumentService::new(db, Arc::new(embedder), vault, &config).unwrap()
}
