//! Embedding sidecar client.
//!
//! The embedding provider is an external HTTP service; this module holds the
//! trait the store blends through plus the production reqwest client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Produces vector embeddings for a batch of texts.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// HTTP client for the embedding sidecar.
pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbeddingClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(MemoryError::Embedding(format!(
                "embedding service returned {}",
                resp.status()
            )));
        }

        let body: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(format!("bad embedding payload: {e}")))?;

        if body.embeddings.len() != texts.len() {
            return Err(MemoryError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.embeddings.len()
            )));
        }
        Ok(body.embeddings)
    }
}

/// Backfill indexer: embed items that are still missing vectors, in small
/// batches per pass, until `shutdown` broadcasts true. Embedding failures
/// leave the backlog in place for the next pass.
pub async fn run_backfill(
    store: std::sync::Arc<crate::store::MemoryStore>,
    client: std::sync::Arc<dyn EmbeddingClient>,
    cfg: dotclaw_core::config::EmbeddingsConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    if !cfg.enabled {
        return;
    }
    tracing::info!(interval_ms = cfg.interval_ms, "embedding backfill started");
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(cfg.interval_ms.max(1_000)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = backfill_pass(&store, client.as_ref(), cfg.max_backlog).await {
                    tracing::warn!("embedding backfill pass failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("embedding backfill shutting down");
                    break;
                }
            }
        }
    }
}

async fn backfill_pass(
    store: &crate::store::MemoryStore,
    client: &dyn EmbeddingClient,
    max_backlog: usize,
) -> Result<usize> {
    let pending = store.missing_embeddings(max_backlog)?;
    if pending.is_empty() {
        return Ok(0);
    }
    let texts: Vec<String> = pending.iter().map(|(_, content)| content.clone()).collect();
    let vectors = client.embed(&texts).await?;
    let mut indexed = 0usize;
    for ((id, _), vector) in pending.iter().zip(vectors.iter()) {
        store.set_embedding(id, vector)?;
        indexed += 1;
    }
    tracing::debug!(indexed, "embedding backlog drained");
    Ok(indexed)
}

/// Cosine similarity in [-1, 1]; 0.0 for mismatched or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
