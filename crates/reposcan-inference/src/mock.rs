//! Mock embedding backend for deterministic testing.
//!
//! ```rust,ignore
//! use reposcan_inference::mock::{MockEmbeddingBackend, MockFailure};
//!
//! let backend = MockEmbeddingBackend::new().with_dimension(384);
//! let down = MockEmbeddingBackend::new().with_failure(MockFailure::Unavailable);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use reposcan_core::{defaults, EmbeddingBackend, Error, Result, Vector};

/// Failure a mock backend can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Fail with `Error::InferenceUnavailable`.
    Unavailable,
    /// Fail with `Error::InferenceTimeout`.
    Timeout,
    /// Return one vector fewer than requested.
    ShortResponse,
}

#[derive(Debug, Clone)]
struct MockConfig {
    model: String,
    dimension: usize,
    failure: Option<MockFailure>,
    latency: Duration,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            model: "mock-embed".to_string(),
            dimension: defaults::EMBED_DIMENSION,
            failure: None,
            latency: Duration::ZERO,
        }
    }
}

/// Deterministic embedding backend.
#[derive(Clone)]
pub struct MockEmbeddingBackend {
    config: Arc<MockConfig>,
    /// Remaining calls that fail before the backend recovers.
    fail_next: Arc<AtomicUsize>,
    call_log: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Default for MockEmbeddingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbeddingBackend {
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            fail_next: Arc::new(AtomicUsize::new(0)),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the embedding dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        Arc::make_mut(&mut self.config).dimension = dimension;
        self
    }

    /// Set the reported model identity.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).model = model.into();
        self
    }

    /// Fail every call the given way.
    pub fn with_failure(mut self, failure: MockFailure) -> Self {
        Arc::make_mut(&mut self.config).failure = Some(failure);
        self
    }

    /// Fail the next `calls` calls as unavailable, then recover.
    pub fn with_transient_failures(self, calls: usize) -> Self {
        self.fail_next.store(calls, Ordering::SeqCst);
        self
    }

    /// Set simulated latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        Arc::make_mut(&mut self.config).latency = latency;
        self
    }

    /// Inputs of every call made so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.call_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.call_log.lock().map(|log| log.len()).unwrap_or(0)
    }

    /// Deterministic unit vector for `text`.
    pub fn generate(text: &str, dimension: usize) -> Vec<f32> {
        let mut vec = vec![0.0f32; dimension];
        if dimension == 0 {
            return vec;
        }
        for (i, c) in text.chars().enumerate() {
            let idx = (c as usize + i) % dimension;
            vec[idx] += 0.1;
        }
        // Empty input still maps to a non-zero vector.
        if text.is_empty() {
            vec[0] = 1.0;
        }

        let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            vec.iter_mut().for_each(|x| *x /= magnitude);
        }
        vec
    }

    fn take_transient_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if let Ok(mut log) = self.call_log.lock() {
            log.push(texts.to_vec());
        }
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        if self.take_transient_failure() {
            return Err(Error::InferenceUnavailable("mock transient failure".into()));
        }
        match self.config.failure {
            Some(MockFailure::Unavailable) => {
                return Err(Error::InferenceUnavailable("mock backend down".into()))
            }
            Some(MockFailure::Timeout) => {
                return Err(Error::InferenceTimeout("mock backend timed out".into()))
            }
            _ => {}
        }

        let mut vectors: Vec<Vector> = texts
            .iter()
            .map(|t| Vector::from(Self::generate(t, self.config.dimension)))
            .collect();
        if self.config.failure == Some(MockFailure::ShortResponse) {
            vectors.pop();
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

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_mock_embed_dimension_and_order() {
        let backend = MockEmbeddingBackend::new().with_dimension(16);
        let input = texts(&["alpha", "beta", ""]);

        let vectors = backend.embed_texts(&input).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.as_slice().len() == 16));
        assert_eq!(
            vectors[1].as_slice(),
            MockEmbeddingBackend::generate("beta", 16).as_slice()
        );
        assert_eq!(backend.calls(), vec![input]);
    }

    #[tokio::test]
    async fn test_mock_deterministic() {
        let backend = MockEmbeddingBackend::new();
        let a = backend.embed_texts(&texts(&["same"])).await.unwrap();
        let b = backend.embed_texts(&texts(&["same"])).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_failure_modes() {
        let down = MockEmbeddingBackend::new().with_failure(MockFailure::Unavailable);
        assert!(matches!(
            down.embed_texts(&texts(&["x"])).await,
            Err(Error::InferenceUnavailable(_))
        ));

        let slow = MockEmbeddingBackend::new().with_failure(MockFailure::Timeout);
        assert!(matches!(
            slow.embed_texts(&texts(&["x"])).await,
            Err(Error::InferenceTimeout(_))
        ));

        let short = MockEmbeddingBackend::new().with_failure(MockFailure::ShortResponse);
        assert_eq!(short.embed_texts(&texts(&["x", "y"])).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_transient_failures_recover() {
        let backend = MockEmbeddingBackend::new().with_transient_failures(2);
        assert!(backend.embed_texts(&texts(&["x"])).await.is_err());
        assert!(backend.embed_texts(&texts(&["x"])).await.is_err());
        assert!(backend.embed_texts(&texts(&["x"])).await.is_ok());
    }

    #[test]
    fn test_generate_is_unit_length() {
        let v = MockEmbeddingBackend::generate("octo/cat", 384);
        let magnitude: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }
}
