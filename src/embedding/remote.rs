//! HTTP-backed embedding provider for OpenAI-compatible endpoints.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{KeeperError, Result};

/// Timeout for the one-shot availability probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum inputs per embeddings request
const MAX_BATCH: usize = 2048;

type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Remote embedding client.
///
/// On construction a single background probe embeds a trivial input; on
/// success the provider records its dimensionality, marks itself
/// available, and fires the registered ready callback exactly once.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: AtomicUsize,
    available: AtomicBool,
    ready_callback: Mutex<Option<ReadyCallback>>,
}

impl RemoteEmbedder {
    /// Create the embedder and start its availability probe.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: EmbeddingConfig) -> Arc<Self> {
        let base_url = config
            .base_url
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();

        let embedder = Arc::new(Self {
            client,
            base_url,
            api_key: config.api_key,
            model: config.model,
            dimensions: AtomicUsize::new(0),
            available: AtomicBool::new(false),
            ready_callback: Mutex::new(None),
        });

        let probe = embedder.clone();
        tokio::spawn(async move { probe.probe().await });

        embedder
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::Acquire)
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Register the one-shot ready callback.
    ///
    /// Fires on a background task immediately if the provider is already
    /// available; otherwise fires when the probe succeeds.
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) {
        let mut slot = self.ready_callback.lock();
        if self.available() {
            drop(slot);
            tokio::spawn(async move { callback() });
        } else {
            *slot = Some(Box::new(callback));
        }
    }

    /// Embed a single query string
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if !self.available() {
            return Err(KeeperError::Unavailable(format!(
                "embedding provider not ready: {}",
                self.base_url
            )));
        }

        let mut vectors = self.request_embeddings(&[text]).await?;
        vectors
            .pop()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| KeeperError::Remote("empty embedding response".to_string()))
    }

    /// Embed a batch of texts, one output slot per input in order.
    ///
    /// Request failures surface as `None` items rather than an error so a
    /// partial provider outage degrades instead of aborting indexing.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        if texts.is_empty() {
            return Vec::new();
        }
        if !self.available() {
            return vec![None; texts.len()];
        }

        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());

        for batch in texts.chunks(MAX_BATCH) {
            let refs: Vec<&str> = batch.iter().map(String::as_str).collect();
            match self.request_embeddings(&refs).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    results.extend(
                        vectors
                            .into_iter()
                            .map(|v| if v.is_empty() { None } else { Some(v) }),
                    );
                }
                Ok(vectors) => {
                    warn!(
                        expected = batch.len(),
                        got = vectors.len(),
                        "embedding batch length mismatch"
                    );
                    results.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
                Err(e) => {
                    warn!("embedding batch failed: {e}");
                    results.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
            }
        }

        results
    }

    /// One-shot availability probe: embed a trivial input and record the
    /// model's dimensionality on success.
    async fn probe(self: Arc<Self>) {
        let result = tokio::time::timeout(PROBE_TIMEOUT, self.request_embeddings(&["ping"])).await;

        match result {
            Ok(Ok(vectors)) => {
                let dims = vectors.first().map(Vec::len).unwrap_or(0);
                if dims == 0 {
                    warn!("embedding probe returned no vector, provider stays unavailable");
                    return;
                }
                self.dimensions.store(dims, Ordering::Release);
                self.mark_available();
                debug!(model = %self.model, dims, "embedding provider ready");
            }
            Ok(Err(e)) => warn!("embedding probe failed: {e}"),
            Err(_) => warn!("embedding probe timed out after {PROBE_TIMEOUT:?}"),
        }
    }

    fn mark_available(&self) {
        self.available.store(true, Ordering::Release);
        let callback = self.ready_callback.lock().take();
        if let Some(callback) = callback {
            tokio::spawn(async move { callback() });
        }
    }

    async fn request_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&serde_json::json!({
                "input": texts,
                "model": self.model,
            }));

        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(KeeperError::Remote(format!(
                "embeddings API error {status}: {body}"
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let items = data["data"]
            .as_array()
            .ok_or_else(|| KeeperError::Remote("invalid embeddings response".to_string()))?;

        let vectors = items
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        Ok(vectors)
    }
}
