//! Embedding providers for the knowledge base.
//!
//! Two implementations sit behind [`EmbeddingProvider`]:
//!
//! - [`HttpEmbeddingProvider`] calls an OpenAI-compatible `/embeddings`
//!   endpoint.
//! - [`DeterministicEmbeddingProvider`] produces stable hash-derived
//!   vectors with no external service. It is the fallback when no endpoint
//!   is configured or the endpoint keeps failing, keeping retrieval
//!   functional (keyword scoring plus coarse semantic clustering).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Abstraction over embedding generation. Implementations must be
/// `Send + Sync` for use from concurrent indexing tasks.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generates an L2-normalized embedding for one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The dimensionality of the output vectors.
    fn dimension(&self) -> usize;

    /// Provider name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Deterministic hash-derived embeddings.
///
/// Consistent across runs and platforms; semantically coarse. Word hashes
/// scatter weight across a fixed number of dimensions, position-discounted
/// so early tokens dominate, then the vector is L2-normalized.
pub struct DeterministicEmbeddingProvider {
    dimension: usize,
}

impl DeterministicEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingProvider for DeterministicEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embedding = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();

        for (i, word) in lowered.split_whitespace().enumerate() {
            let hash = fold_hash(word);
            let slot_a = (hash % self.dimension as u64) as usize;
            let slot_b = ((hash >> 17) % self.dimension as u64) as usize;

            let position_weight = 1.0 / (1.0 + i as f32 * 0.05);
            embedding[slot_a] += position_weight;
            embedding[slot_b] -= position_weight * 0.4;
        }

        normalize(&mut embedding);
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "deterministic"
    }
}

/// HTTP client for an OpenAI-compatible embeddings endpoint.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig, dimension: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("embedding client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::EmbeddingFailed(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("unparseable response: {e}")))?;

        let mut embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::EmbeddingFailed("response carried no embedding".into()))?;

        normalize(&mut embedding);
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Default dimensionality of the deterministic provider.
pub const DEFAULT_DIMENSION: usize = 256;

/// Selects the embedding provider for this run: HTTP when an endpoint is
/// configured, deterministic otherwise.
pub fn create_embedding_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    if config.base_url.is_empty() {
        info!("no embedding endpoint configured, using deterministic embeddings");
        Ok(Arc::new(DeterministicEmbeddingProvider::new(
            DEFAULT_DIMENSION,
        )))
    } else {
        info!(endpoint = %config.base_url, model = %config.model, "using HTTP embeddings");
        Ok(Arc::new(HttpEmbeddingProvider::new(
            config,
            DEFAULT_DIMENSION,
        )?))
    }
}

fn fold_hash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// L2-normalizes a vector in place. A zero vector stays zero.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
