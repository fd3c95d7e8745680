//! Answer assembly: retrieve, format context, delegate to a generator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;

use tally_core::error::{Result, TallyError};
use tally_core::types::RetrievalResult;
use tally_storage::AuditLog;

use crate::generator::Generator;
use crate::pipeline::AUDIT_AGENT;
use crate::search::Retriever;

pub const DEFAULT_GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// One line per result, in ranked order.
pub fn build_context(results: &[RetrievalResult]) -> String {
    results
        .iter()
        .map(RetrievalResult::describe)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!("Context:\n{}\n\nQuestion: {}\nAnswer:", context, question)
}

/// Retrieval followed by generation. Never mutates the corpus.
pub struct RagPipeline {
    retriever: Retriever,
    audit: Arc<dyn AuditLog>,
    generate_timeout: Duration,
}

impl RagPipeline {
    pub fn new(retriever: Retriever, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            retriever,
            audit,
            generate_timeout: DEFAULT_GENERATE_TIMEOUT,
        }
    }

    pub fn with_generate_timeout(mut self, timeout: Duration) -> Self {
        self.generate_timeout = timeout;
        self
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub async fn retrieve_and_answer(
        &self,
        query: &str,
        generator: &dyn Generator,
        k: usize,
    ) -> Result<(String, Vec<RetrievalResult>)> {
        let results = self.retriever.retrieve(query, k).await?;
        let context = build_context(&results);
        let prompt = build_prompt(&context, query);

        let answer = tokio::time::timeout(
            self.generate_timeout,
            generator.generate(&context, query, Some(&prompt)),
        )
        .await
        .map_err(|_| {
            TallyError::ExternalCall(format!(
                "generation timed out after {:?}",
                self.generate_timeout
            ))
        })??;

        info!(top_k = k, results = results.len(), "Answered query");
        self.audit.log(
            AUDIT_AGENT,
            "Retrieved and answered",
            &json!({ "query": query, "top_k": k }),
        );
        Ok((answer, results))
    }
}
