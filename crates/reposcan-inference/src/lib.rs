//! # reposcan-inference
//!
//! Embedding inference backends for the reposcan analysis pipeline.
//!
//! This crate provides:
//! - [`HttpEmbeddingBackend`], a client for the batch embedding server
//! - A deterministic mock backend (feature `mock`)
//!
//! # Example
//!
//! ```rust,no_run
//! use reposcan_inference::HttpEmbeddingBackend;
//! use reposcan_core::EmbeddingBackend;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = HttpEmbeddingBackend::from_env().unwrap();
//!     let texts = vec!["octo/cat A tiny cat".to_string()];
//!     let embeddings = backend.embed_texts(&texts).await.unwrap();
//!     assert_eq!(embeddings.len(), 1);
//! }
//! ```

pub mod http;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use http::{HttpEmbeddingBackend, HttpEmbeddingConfig};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockEmbeddingBackend, MockFailure};
