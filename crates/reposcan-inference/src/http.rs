//! HTTP client for the batch embedding server.
//!
//! The server accepts `POST {base_url}/embed_batch` with
//! `{"texts": [...], "model_type": "sentence_transformer"}` and answers with
//! one vector per text, in input order.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use reposcan_core::{defaults, EmbeddingBackend, Error, Result, Vector};

/// Model family requested from the server.
const MODEL_TYPE: &str = "sentence_transformer";

/// Connection settings for [`HttpEmbeddingBackend`].
#[derive(Debug, Clone)]
pub struct HttpEmbeddingConfig {
    /// Server base URL, without a trailing slash.
    pub base_url: String,
    /// Model identity recorded alongside cached vectors.
    pub model: String,
    /// Vector dimension the model produces.
    pub dimension: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpEmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::EMBED_SERVER_URL.to_string(),
            model: defaults::EMBED_MODEL.to_string(),
            dimension: defaults::EMBED_DIMENSION,
            timeout: Duration::from_secs(defaults::EMBED_TIMEOUT_SECS),
        }
    }
}

impl HttpEmbeddingConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `EMBED_SERVER_URL` | `http://127.0.0.1:8000` |
    /// | `EMBED_MODEL` | `all-MiniLM-L6-v2` |
    /// | `EMBED_DIMENSION` | `384` |
    /// | `EMBED_TIMEOUT_SECS` | `30` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_url = std::env::var("EMBED_SERVER_URL").unwrap_or(defaults.base_url);
        let model = std::env::var("EMBED_MODEL").unwrap_or(defaults.model);
        let dimension = std::env::var("EMBED_DIMENSION")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.dimension);
        let timeout = std::env::var("EMBED_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        Self {
            base_url,
            model,
            dimension,
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.model = model.into();
        self.dimension = dimension;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct EmbedBatchRequest<'a> {
    texts: &'a [String],
    model_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedBatchResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    model: Option<String>,
}

/// Embedding backend that calls the batch embedding server over HTTP.
pub struct HttpEmbeddingBackend {
    client: Client,
    config: HttpEmbeddingConfig,
}

impl HttpEmbeddingBackend {
    /// Create a backend with explicit configuration.
    pub fn new(config: HttpEmbeddingConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(Error::Config("embedding dimension must be positive".into()));
        }

        let base_url = config.base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;

        info!(
            subsystem = "inference",
            component = "http",
            op = "init",
            url = %base_url,
            model = %config.model,
            dimension = config.dimension,
            timeout_secs = config.timeout.as_secs(),
            "Initializing embedding backend"
        );

        Ok(Self {
            client,
            config: HttpEmbeddingConfig { base_url, ..config },
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(HttpEmbeddingConfig::from_env())
    }

    /// Active configuration.
    pub fn config(&self) -> &HttpEmbeddingConfig {
        &self.config
    }

    /// Probe `GET {base_url}/health`.
    pub async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.config.base_url))
            .send()
            .await
            .map_err(|e| request_error(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::InferenceUnavailable(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }
}

/// Map transport errors onto the retryable inference failures.
fn request_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::InferenceTimeout(e.to_string())
    } else {
        Error::InferenceUnavailable(e.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> Error {
    // 404 means the endpoint or model is missing on this server.
    if status.is_server_error() || status == StatusCode::NOT_FOUND {
        Error::InferenceUnavailable(format!("server returned {status}: {body}"))
    } else {
        Error::Embedding(format!("server returned {status}: {body}"))
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    #[instrument(skip(self, texts), fields(subsystem = "inference", component = "http", op = "embed_texts", model = %self.config.model, input_count = texts.len()))]
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let start = Instant::now();
        let response = self
            .client
            .post(format!("{}/embed_batch", self.config.base_url))
            .timeout(self.config.timeout)
            .json(&EmbedBatchRequest {
                texts,
                model_type: MODEL_TYPE,
            })
            .send()
            .await
            .map_err(|e| request_error(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let result: EmbedBatchResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                Error::InferenceTimeout(e.to_string())
            } else {
                Error::Embedding(format!("Failed to parse response: {e}"))
            }
        })?;

        if result.embeddings.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, server returned {}",
                texts.len(),
                result.embeddings.len()
            )));
        }
        if let Some(bad) = result
            .embeddings
            .iter()
            .find(|v| v.len() != self.config.dimension)
        {
            return Err(Error::DimensionMismatch {
                model: result.model.unwrap_or_else(|| self.config.model.clone()),
                expected: self.config.dimension,
                actual: bad.len(),
            });
        }

        let vectors: Vec<Vector> = result.embeddings.into_iter().map(Vector::from).collect();
        let elapsed = start.elapsed().as_millis() as u64;

        debug!(
            result_count = vectors.len(),
            duration_ms = elapsed,
            "Embedding complete"
        );
        if elapsed > defaults::EMBED_SLOW_MS {
            warn!(
                duration_ms = elapsed,
                input_count = texts.len(),
                slow = true,
                "Slow embedding operation"
            );
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
