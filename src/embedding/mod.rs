//! Embedding providers.
//!
//! A provider is one of two variants with a uniform capability set: a
//! remote OpenAI-compatible HTTP backend, or the null provider that is
//! never available and yields no vectors. Callers treat `available()` as
//! a hint and tolerate failure on every call; searchers degrade to
//! keyword-only ranking and indexers store chunks unembedded for later
//! repair.

mod remote;

pub use remote::RemoteEmbedder;

use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::{KeeperError, Result};

/// Embedding provider variants
#[derive(Clone)]
pub enum EmbeddingProvider {
    /// Always unavailable; every embed yields nothing
    Null,
    /// HTTP-backed provider with background availability probing
    Remote(Arc<RemoteEmbedder>),
}

impl EmbeddingProvider {
    /// Build a provider from configuration.
    ///
    /// A missing base URL selects the null provider. The remote variant
    /// starts its availability probe immediately.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        match config.base_url {
            Some(_) => EmbeddingProvider::Remote(RemoteEmbedder::spawn(config.clone())),
            None => EmbeddingProvider::Null,
        }
    }

    /// Stable identifier for stats and logging
    pub fn id(&self) -> &'static str {
        match self {
            EmbeddingProvider::Null => "null",
            EmbeddingProvider::Remote(_) => "remote",
        }
    }

    /// Model identifier stored alongside embeddings
    pub fn model(&self) -> String {
        match self {
            EmbeddingProvider::Null => String::new(),
            EmbeddingProvider::Remote(remote) => remote.model().to_string(),
        }
    }

    /// Embedding dimensionality, 0 until probed
    pub fn dimensions(&self) -> usize {
        match self {
            EmbeddingProvider::Null => 0,
            EmbeddingProvider::Remote(remote) => remote.dimensions(),
        }
    }

    /// Availability hint; callers must still tolerate embed failures
    pub fn available(&self) -> bool {
        match self {
            EmbeddingProvider::Null => false,
            EmbeddingProvider::Remote(remote) => remote.available(),
        }
    }

    /// Embed a single query string.
    ///
    /// Fails with `Unavailable` when the provider is not ready and
    /// `Remote`/`Http` on transport or API failure.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        match self {
            EmbeddingProvider::Null => Err(KeeperError::Unavailable(
                "null embedding provider".to_string(),
            )),
            EmbeddingProvider::Remote(remote) => remote.embed_query(text).await,
        }
    }

    /// Embed a batch of texts.
    ///
    /// Never fails in aggregate: the result always has one slot per input
    /// in input order, with failed items as `None`.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        match self {
            EmbeddingProvider::Null => vec![None; texts.len()],
            EmbeddingProvider::Remote(remote) => remote.embed_batch(texts).await,
        }
    }

    /// Register a one-shot callback fired when the provider transitions
    /// to available. If already available, the callback fires immediately
    /// on a background task. The null provider never fires.
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) {
        match self {
            EmbeddingProvider::Null => {}
            EmbeddingProvider::Remote(remote) => remote.on_ready(callback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_provider_contract() {
        let provider = EmbeddingProvider::Null;
        assert!(!provider.available());
        assert_eq!(provider.id(), "null");
        assert_eq!(provider.dimensions(), 0);

        let err = provider.embed_query("hello").await.unwrap_err();
        assert!(matches!(err, KeeperError::Unavailable(_)));

        let batch = provider
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await;
        assert_eq!(batch, vec![None, None]);
    }

    #[test]
    fn test_from_config_without_url_is_null() {
        let provider = EmbeddingProvider::from_config(&EmbeddingConfig::default());
        assert!(matches!(provider, EmbeddingProvider::Null));
    }
}
