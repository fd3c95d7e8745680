//! Top-k retrieval: embed a query, search the index, attach metadata.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use tally_core::error::{Result, TallyError};
use tally_core::types::RetrievalResult;

use crate::corpus::Corpus;
use crate::embedding::DynEmbeddingService;
use crate::pipeline::DEFAULT_EMBED_TIMEOUT;

/// Read-only view of a [`Corpus`] for similarity queries.
pub struct Retriever {
    corpus: Arc<Corpus>,
    embedder: Arc<dyn DynEmbeddingService>,
    embed_timeout: Duration,
}

impl Retriever {
    pub fn new(corpus: Arc<Corpus>, embedder: Arc<dyn DynEmbeddingService>) -> Self {
        Self {
            corpus,
            embedder,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
        }
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn corpus(&self) -> &Arc<Corpus> {
        &self.corpus
    }

    /// Up to `k` results ordered by descending score, ties by ascending id.
    ///
    /// An empty corpus or `k == 0` returns an empty list. Ids without a
    /// metadata entry are dropped, so fewer than `k` results may come back
    /// even when the index holds more vectors.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let texts = [query.to_string()];
        let mut embeddings =
            tokio::time::timeout(self.embed_timeout, self.embedder.embed_boxed(&texts))
                .await
                .map_err(|_| {
                    TallyError::ExternalCall(format!(
                        "query embedding timed out after {:?}",
                        self.embed_timeout
                    ))
                })??;
        let query_vector = embeddings
            .pop()
            .ok_or_else(|| TallyError::ExternalCall("embedder returned no vector".to_string()))?;

        // Search and metadata lookup see the same snapshot.
        let state = self.corpus.read()?;
        if state.index.is_empty() {
            return Ok(Vec::new());
        }
        let neighbors = state.index.search(&query_vector, k)?;
        let ids: Vec<_> = neighbors.iter().map(|n| n.vector_id).collect();
        let mut entries = state.metadata.get_by_ids(&ids);
        drop(state);

        let mut results = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            match entries.remove(&neighbor.vector_id) {
                Some(entry) => results.push(RetrievalResult {
                    vector_id: neighbor.vector_id,
                    metadata: entry.metadata,
                    score: neighbor.score,
                }),
                None => warn!(
                    vector_id = neighbor.vector_id,
                    "No metadata for vector; skipping"
                ),
            }
        }

        debug!(k, returned = results.len(), "Retrieval complete");
        Ok(results)
    }
}
