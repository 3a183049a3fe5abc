//! Embedding backend contract and implementations.
//!
//! Defines the [`Embedder`] trait and the closed [`EmbeddingBackend`] enum
//! the selector builds:
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `POST /embeddings` endpoint in batches, retrying with backoff.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: runs models locally via fastembed (feature `local-embeddings`).
//!
//! Also provides the vector utilities shared by the stores:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding
//! - [`check_vectors`]: count/length/finiteness validation of provider output
//!
//! # Retry Strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{RagError, RagResult};

/// Contract every embedding backend satisfies.
///
/// `embed` returns one vector per input text, in input order, each of
/// length [`dims`](Embedder::dims).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-ada-002"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>>;
}

/// Connection and model settings for one embedding backend, as resolved by the selector.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSettings {
    pub model: String,
    pub dims: usize,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

/// Closed set of embedding backends.
pub enum EmbeddingBackend {
    OpenAi(OpenAiEmbedder),
    Ollama(OllamaEmbedder),
    #[cfg(feature = "local-embeddings")]
    Local(LocalEmbedder),
}

#[async_trait]
impl Embedder for EmbeddingBackend {
    fn model_name(&self) -> &str {
        match self {
            EmbeddingBackend::OpenAi(e) => e.model_name(),
            EmbeddingBackend::Ollama(e) => e.model_name(),
            #[cfg(feature = "local-embeddings")]
            EmbeddingBackend::Local(e) => e.model_name(),
        }
    }

    fn dims(&self) -> usize {
        match self {
            EmbeddingBackend::OpenAi(e) => e.dims(),
            EmbeddingBackend::Ollama(e) => e.dims(),
            #[cfg(feature = "local-embeddings")]
            EmbeddingBackend::Local(e) => e.dims(),
        }
    }

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        match self {
            EmbeddingBackend::OpenAi(e) => e.embed(texts).await,
            EmbeddingBackend::Ollama(e) => e.embed(texts).await,
            #[cfg(feature = "local-embeddings")]
            EmbeddingBackend::Local(e) => e.embed(texts).await,
        }
    }
}

/// Validate provider output: one finite vector of length `dims` per input.
pub fn check_vectors(vectors: &[Vec<f32>], expected: usize, dims: usize) -> RagResult<()> {
    if vectors.len() != expected {
        return Err(RagError::EmbeddingFailure(format!(
            "expected {} vectors, got {}",
            expected,
            vectors.len()
        )));
    }
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dims {
            return Err(RagError::EmbeddingFailure(format!(
                "vector {} has {} dimensions, expected {}",
                i,
                v.len(),
                dims
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(RagError::EmbeddingFailure(format!(
                "vector {} contains NaN or infinite values",
                i
            )));
        }
    }
    Ok(())
}

fn http_client(timeout_secs: u64) -> RagResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::connection("embedding", e))
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

/// POST `body` to `url` with the shared retry policy and return the JSON reply.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    provider: &str,
) -> RagResult<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff(attempt)).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        RagError::EmbeddingFailure(format!("{} returned invalid JSON: {}", provider, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = RagError::EmbeddingFailure(format!(
                    "{} API error {}: {}",
                    provider, status, body_text
                ));

                // Rate limited or server error; retry
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(provider, %status, attempt, "embedding request failed, retrying");
                    last_err = Some(err);
                    continue;
                }

                return Err(err);
            }
            Err(e) => {
                tracing::warn!(provider, attempt, error = %e, "embedding request did not complete");
                last_err = Some(RagError::EmbeddingFailure(format!(
                    "{} connection error: {}",
                    provider, e
                )));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        RagError::EmbeddingFailure(format!("{} embedding failed after retries", provider))
    }))
}

/// Read a JSON array of numbers strictly; any non-numeric entry is an error.
fn parse_vector(value: &serde_json::Value, what: &str) -> RagResult<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| RagError::EmbeddingFailure(format!("{}: embedding is not an array", what)))?
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                RagError::EmbeddingFailure(format!("{}: non-numeric embedding value {}", what, v))
            })
        })
        .collect()
}

// ============ OpenAI ============

/// Embedding backend for the OpenAI embeddings API (or any compatible server).
pub struct OpenAiEmbedder {
    settings: EmbeddingSettings,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(settings: EmbeddingSettings) -> RagResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RagError::connection("openai", "api_key is empty"))?;
        let client = http_client(settings.timeout_secs)?;
        Ok(Self {
            settings,
            api_key,
            client,
        })
    }

    fn endpoint(&self) -> String {
        let base = self
            .settings
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        format!("{}/embeddings", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.settings.model
    }

    fn dims(&self) -> usize {
        self.settings.dims
    }

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.settings.batch_size.max(1)) {
            // newlines degrade ada-002 quality
            let inputs: Vec<String> = batch.iter().map(|t| t.replace('\n', " ")).collect();
            let body = serde_json::json!({
                "model": self.settings.model,
                "input": inputs,
            });
            let json = post_with_retry(
                &self.client,
                &self.endpoint(),
                Some(&self.api_key),
                &body,
                self.settings.max_retries,
                "OpenAI",
            )
            .await?;
            out.extend(parse_openai_response(&json)?);
        }
        Ok(out)
    }
}

/// Parse the OpenAI embeddings response, ordering by `index` when present.
fn parse_openai_response(json: &serde_json::Value) -> RagResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::EmbeddingFailure("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| RagError::EmbeddingFailure("Invalid OpenAI response: missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embedding backend using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
/// Requires an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    settings: EmbeddingSettings,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(settings: EmbeddingSettings) -> RagResult<Self> {
        let client = http_client(settings.timeout_secs)?;
        Ok(Self { settings, client })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.settings.model
    }

    fn dims(&self) -> usize {
        self.settings.dims
    }

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let url = self
            .settings
            .base_url
            .as_deref()
            .unwrap_or("http://localhost:11434");
        let endpoint = format!("{}/api/embed", url.trim_end_matches('/'));

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.settings.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": self.settings.model,
                "input": batch,
            });
            let json = post_with_retry(
                &self.client,
                &endpoint,
                None,
                &body,
                self.settings.max_retries,
                "Ollama",
            )
            .await?;
            out.extend(parse_ollama_response(&json)?);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> RagResult<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            RagError::EmbeddingFailure("Invalid Ollama response: missing embeddings array".into())
        })?;

    embeddings
        .iter()
        .map(|e| parse_vector(e, "Ollama"))
        .collect()
}

// ============ Local (fastembed) ============

/// Embedding backend for local inference via fastembed.
///
/// Models are downloaded on first use from Hugging Face and cached.
/// After initial download, no network calls are needed.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    settings: EmbeddingSettings,
    model: fastembed::EmbeddingModel,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(settings: EmbeddingSettings) -> RagResult<Self> {
        let model = config_to_fastembed_model(&settings.model)?;
        Ok(Self { settings, model })
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> RagResult<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        other => Err(RagError::connection(
            "local",
            format!(
                "unknown local embedding model '{}'. Supported: all-minilm-l6-v2, \
                 bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small, multilingual-e5-base",
                other
            ),
        )),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.settings.model
    }

    fn dims(&self) -> usize {
        self.settings.dims
    }

    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let batch_size = self.settings.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model).with_show_download_progress(false),
            )
            .map_err(|e| {
                RagError::EmbeddingFailure(format!("failed to initialize local model: {}", e))
            })?;

            model
                .embed(texts, Some(batch_size))
                .map_err(|e| RagError::EmbeddingFailure(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| RagError::EmbeddingFailure(format!("local embedding task panicked: {}", e)))?
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use assistant_rag::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn settings(base_url: String, dims: usize) -> EmbeddingSettings {
        EmbeddingSettings {
            model: "text-embedding-ada-002".into(),
            dims,
            base_url: Some(base_url),
            api_key: Some("sk-test".into()),
            batch_size: 2,
            max_retries: 0,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_mismatched() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_check_vectors() {
        assert!(check_vectors(&[vec![0.1, 0.2]], 1, 2).is_ok());
        assert!(matches!(
            check_vectors(&[vec![0.1]], 1, 2),
            Err(RagError::EmbeddingFailure(_))
        ));
        assert!(check_vectors(&[vec![f32::NAN, 0.2]], 1, 2).is_err());
        assert!(check_vectors(&[], 1, 2).is_err());
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        let json = json!({ "data": [ { "embedding": [0.1, "x"] } ] });
        assert!(matches!(
            parse_openai_response(&json),
            Err(RagError::EmbeddingFailure(_))
        ));
    }

    #[test]
    fn test_openai_requires_key() {
        let mut s = settings("http://localhost".into(), 2);
        s.api_key = None;
        assert!(matches!(
            OpenAiEmbedder::new(s),
            Err(RagError::BackendConnectionError { .. })
        ));
    }

    #[tokio::test]
    async fn test_openai_embed_batches_requests() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/embeddings");
            then.status(200).json_body(json!({
                "data": [
                    { "index": 0, "embedding": [1.0, 0.0] },
                    { "index": 1, "embedding": [0.0, 1.0] }
                ]
            }));
        });

        let embedder = OpenAiEmbedder::new(settings(server.base_url(), 2)).unwrap();
        let texts: Vec<String> = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        let vecs = embedder.embed(&texts).await.unwrap();
        assert_eq!(vecs.len(), 4);
        mock.assert_calls(2);
    }

    #[tokio::test]
    async fn test_openai_client_error_is_embedding_failure() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/embeddings");
            then.status(401).body("bad key");
        });

        let embedder = OpenAiEmbedder::new(settings(server.base_url(), 2)).unwrap();
        let err = embedder.embed(&["a".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_ollama_embed() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(200)
                .json_body(json!({ "embeddings": [[0.5, 0.5, 0.0]] }));
        });

        let mut s = settings(server.base_url(), 3);
        s.api_key = None;
        let embedder = OllamaEmbedder::new(s).unwrap();
        let vecs = embedder.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(vecs, vec![vec![0.5, 0.5, 0.0]]);
    }
}
