//! Tag suggestion contract.
//!
//! Tag generation itself lives outside this crate; callers plug in a
//! [`Tagger`] and get normalized tags back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_TAGS: usize = 10;
const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, thiserror::Error)]
pub enum TaggingError {
    #[allow(dead_code)]
    #[error("Tagging service error: {0}")]
    Service(String),

    #[error("No tagging service configured")]
    NotConfigured,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagOptions {
    pub max_tags: usize,
    pub language: String,
}

impl Default for TagOptions {
    fn default() -> Self {
        Self {
            max_tags: DEFAULT_MAX_TAGS,
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagSuggestion {
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[async_trait]
pub trait Tagger: Send + Sync {
    async fn generate_tags(
        &self,
        content: &str,
        document_name: &str,
        options: &TagOptions,
    ) -> Result<TagSuggestion, TaggingError>;
}

/// Lowercase, trim and hyphenate tags, dropping empties and duplicates.
/// At most `max_tags` tags are kept (0 keeps all), in first-seen order.
pub fn normalize_tags(tags: &[String], max_tags: usize) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();

    for tag in tags {
        let tag = tag
            .trim()
            .trim_start_matches('#')
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
            .to_lowercase();

        if tag.is_empty() || normalized.contains(&tag) {
            continue;
        }
        normalized.push(tag);
        if normalized.len() == max_tags {
            break;
        }
    }

    normalized
}
