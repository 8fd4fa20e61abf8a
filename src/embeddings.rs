//! Embedding generation.
//!
//! - `Embedder`: the contract the indexing pipeline depends on
//! - `OpenAiEmbedder`: client for OpenAI-compatible `/embeddings` endpoints
//! - `embed_blocks`: turns a segmented document into block-keyed vectors

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;
use crate::segment::DocumentBlocks;
use crate::store::EmbeddedVector;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Expected {expected} embeddings, got {got}")]
    CountMismatch { expected: usize, got: usize },

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding {0} contains non-finite values")]
    NonFinite(usize),

    #[error("Invalid embedding configuration: {0}")]
    Config(String),
}

/// Trait for embedding providers
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Get the embedding dimension
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Check count, dimensionality and finiteness of a batch of embeddings.
pub fn validate_embeddings(
    embeddings: &[Vec<f32>],
    expected_count: usize,
    dimensions: usize,
) -> Result<(), EmbeddingError> {
    if embeddings.len() != expected_count {
        return Err(EmbeddingError::CountMismatch {
            expected: expected_count,
            got: embeddings.len(),
        });
    }

    for (i, embedding) in embeddings.iter().enumerate() {
        if embedding.len() != dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimensions,
                got: embedding.len(),
            });
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite(i));
        }
    }

    Ok(())
}

/// Embed every block of `doc` in one request.
///
/// # Returns
/// Vectors positionally matching `doc.blocks`, each carrying its block's ID.
pub async fn embed_blocks(
    embedder: &dyn Embedder,
    doc: &DocumentBlocks,
) -> Result<Vec<EmbeddedVector>, EmbeddingError> {
    if doc.blocks.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = doc.blocks.iter().map(|b| b.text.clone()).collect();
    let embeddings = embedder.embed(texts).await?;
    validate_embeddings(&embeddings, doc.blocks.len(), embedder.dimensions())?;

    Ok(doc
        .blocks
        .iter()
        .zip(embeddings)
        .map(|(block, vector)| EmbeddedVector {
            id: block.id,
            vector,
        })
        .collect())
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible embeddings API.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    /// Build a client from config. The API key is read from the environment
    /// variable named by `api_key_env`; without it requests are sent
    /// unauthenticated.
    pub fn new(config: &EmbeddingConfig, dimensions: usize) -> Result<Self, EmbeddingError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            log::warn!(
                "{} is not set, embedding requests are sent without authorization",
                config.api_key_env
            );
        }
        Self::with_api_key(config, dimensions, api_key)
    }

    pub fn with_api_key(
        config: &EmbeddingConfig,
        dimensions: usize,
        api_key: Option<String>,
    ) -> Result<Self, EmbeddingError> {
        if dimensions == 0 {
            return Err(EmbeddingError::Config("dimensions must be greater than 0".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let expected = texts.len();
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        log::debug!("requesting {expected} embeddings from {}", self.endpoint);
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|d| d.index);
        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();

        validate_embeddings(&embeddings, expected, self.dimensions)?;
        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{segment, HeadingLevel};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> EmbeddingConfig {
        EmbeddingConfig {
            model: "test-model".to_string(),
            base_url: format!("{}/v1/", server.uri()),
            api_key_env: "NOTEBLOCKS_TEST_UNUSED_KEY".to_string(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_embed_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "input": ["first", "second"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder =
            OpenAiEmbedder::with_api_key(&config_for(&server), 2, Some("secret".into())).unwrap();
        let vectors = embedder
            .embed(vec!["first".into(), "second".into()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(embedder.model_name(), "test-model");
    }

    #[tokio::test]
    async fn test_api_error_is_propagated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::with_api_key(&config_for(&server), 2, None).unwrap();
        let err = embedder.embed(vec!["x".into()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Api { status: 429, .. }));
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0, 0.0]}]
            })))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::with_api_key(&config_for(&server), 2, None).unwrap();
        let err = embedder.embed(vec!["x".into()]).await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch { expected: 2, got: 3 }
        ));
    }

    #[tokio::test]
    async fn test_missing_embeddings_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0]}]
            })))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::with_api_key(&config_for(&server), 2, None).unwrap();
        let err = embedder
            .embed(vec!["a".into(), "b".into()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::CountMismatch { expected: 2, got: 1 }
        ));
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::with_api_key(&config_for(&server), 2, None).unwrap();
        assert!(embedder.embed(vec![]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embed_blocks_keeps_block_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 0, "embedding": [1.0, 0.0]},
                    {"index": 1, "embedding": [0.0, 1.0]}
                ]
            })))
            .mount(&server)
            .await;

        let doc = segment(
            "a.md",
            "a.md",
            "### One\nfirst\n### Two\nsecond",
            HeadingLevel::default(),
        );
        let embedder = OpenAiEmbedder::with_api_key(&config_for(&server), 2, None).unwrap();
        let vectors = embed_blocks(&embedder, &doc).await.unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].id, doc.blocks[0].id);
        assert_eq!(vectors[1].id, doc.blocks[1].id);
        assert_eq!(vectors[1].vector, vec![0.0, 1.0]);
    }

    #[test]
    fn test_validate_embeddings_rejects_nan() {
        let err = validate_embeddings(&[vec![1.0, f32::NAN]], 1, 2).unwrap_err();
        assert!(matches!(err, EmbeddingError::NonFinite(0)));
    }
}
