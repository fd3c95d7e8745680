//! Indexing pipeline.
//!
//! Turns a batch of documents into embeddings and appends them to the
//! vector index and metadata store under consecutive ids:
//! 1. Embed all texts in one call (bounded by a timeout)
//! 2. Insert vectors, obtaining `[start_id, end_id]`
//! 3. Append one metadata entry per document with the same ids
//! 4. Persist both stores

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use tally_core::error::{Result, TallyError};
use tally_core::types::{Document, IndexSummary, LabeledTransaction, MetadataEntry};
use tally_storage::AuditLog;

use crate::corpus::Corpus;
use crate::embedding::DynEmbeddingService;
use crate::index::validate_batch;

/// Agent name recorded in the audit log for indexing and retrieval.
pub const AUDIT_AGENT: &str = "RAG";

/// Default bound on a single embedding call.
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// A batch that made it into memory, and the outcome of saving it.
struct Committed {
    summary: IndexSummary,
    persisted: Result<()>,
}

/// Writes documents into a [`Corpus`].
pub struct IndexingPipeline {
    corpus: Arc<Corpus>,
    embedder: Arc<dyn DynEmbeddingService>,
    audit: Arc<dyn AuditLog>,
    embed_timeout: Duration,
}

impl IndexingPipeline {
    pub fn new(
        corpus: Arc<Corpus>,
        embedder: Arc<dyn DynEmbeddingService>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            corpus,
            embedder,
            audit,
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

    /// Index a batch of documents.
    ///
    /// Returns `Ok(None)` for an empty batch. On a persistence failure the
    /// error is returned but the in-memory insert is kept; a later
    /// [`Corpus::persist`] or successful batch makes it durable.
    pub async fn index_documents(&self, documents: Vec<Document>) -> Result<Option<IndexSummary>> {
        let Some(committed) = self.commit(documents).await? else {
            return Ok(None);
        };
        committed.persisted?;

        let summary = committed.summary;
        self.audit.log(
            AUDIT_AGENT,
            "Indexed documents",
            &json!({
                "start_id": summary.start_id,
                "end_id": summary.end_id,
                "count": summary.count,
            }),
        );
        Ok(Some(summary))
    }

    /// Index a JSON array of labeled transactions, one document per row.
    pub async fn index_labeled_file(&self, path: &Path) -> Result<Option<IndexSummary>> {
        self.index_file(path, 0).await
    }

    /// Like [`IndexingPipeline::index_labeled_file`], but a failed save of
    /// the inserted rows is retried once before giving up.
    pub async fn index_labeled_file_with_retry(&self, path: &Path) -> Result<Option<IndexSummary>> {
        self.index_file(path, 1).await
    }

    async fn index_file(&self, path: &Path, retries: usize) -> Result<Option<IndexSummary>> {
        let content = std::fs::read_to_string(path)?;
        let rows: Vec<LabeledTransaction> = serde_json::from_str(&content)?;
        let doc_id = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let documents: Vec<Document> = rows
            .iter()
            .enumerate()
            .map(|(row_index, row)| row.to_document(&doc_id, row_index))
            .collect();

        let Some(committed) = self.commit(documents).await? else {
            debug!(file = %path.display(), "No rows to index");
            return Ok(None);
        };

        let mut persisted = committed.persisted;
        let mut attempt = 0;
        while let Err(e) = &persisted {
            if attempt == retries || !e.is_retryable_persistence() {
                break;
            }
            attempt += 1;
            warn!(file = %path.display(), attempt, error = %e, "Retrying persist");
            persisted = self.corpus.persist().await;
        }
        persisted?;

        let summary = committed.summary;
        self.audit.log(
            AUDIT_AGENT,
            "Indexed file",
            &json!({
                "file": path.display().to_string(),
                "rows_indexed": summary.count,
            }),
        );
        Ok(Some(summary))
    }

    /// Insert a batch into both stores and try to save them.
    ///
    /// Only failures before the insert are returned as `Err`; a failed save
    /// is reported in [`Committed::persisted`] alongside the assigned ids.
    async fn commit(&self, documents: Vec<Document>) -> Result<Option<Committed>> {
        if documents.is_empty() {
            return Ok(None);
        }

        // Held until persistence finishes; nothing else may append or save
        // meanwhile.
        let writer = self.corpus.lock_writer().await;

        let sizes = self.corpus.sizes()?;
        if !sizes.aligned() {
            return Err(TallyError::IdAlignment {
                expected: sizes.vectors as u64,
                actual: sizes.metadata as u64,
            });
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let embeddings = self.embed(&texts).await?;

        // No await between here and the end of the block: the insert into
        // both stores cannot be interrupted halfway.
        let range = {
            let mut state = self.corpus.write()?;
            let bound = state.index.dimension();
            let dimension = bound
                .or_else(|| embeddings.first().map(Vec::len))
                .unwrap_or(0);
            // A rejected batch must not bind a fresh index.
            validate_batch(&embeddings, dimension)?;
            if bound.is_none() {
                state.index.create(dimension)?;
            }
            let range = state.index.add(&embeddings)?;

            let indexed_at = Utc::now();
            let entries = documents
                .into_iter()
                .zip(range.ids())
                .map(|(doc, vector_id)| MetadataEntry {
                    vector_id,
                    metadata: doc.metadata,
                    indexed_at,
                })
                .collect();
            state.metadata.append(entries)?;
            range
        };

        let persisted = self.corpus.persist_with(&writer);
        match &persisted {
            Ok(()) => info!(
                start_id = range.start,
                end_id = range.end,
                count = range.count(),
                "Indexed batch"
            ),
            Err(e) => warn!(
                start_id = range.start,
                end_id = range.end,
                error = %e,
                "Batch inserted in memory but not persisted"
            ),
        }

        Ok(Some(Committed {
            summary: range.into(),
            persisted,
        }))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embeddings = tokio::time::timeout(self.embed_timeout, self.embedder.embed_boxed(texts))
            .await
            .map_err(|_| {
                TallyError::ExternalCall(format!(
                    "embedding timed out after {:?}",
                    self.embed_timeout
                ))
            })??;

        if embeddings.len() != texts.len() {
            return Err(TallyError::ExternalCall(format!(
                "embedder returned {} vectors for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingService, MockEmbedding};
    use crate::index::{FlatIndex, VectorIndex};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tally_core::types::{IdRange, Metadata, Neighbor};
    use tally_storage::{JsonlMetadataStore, NoopAuditLog};

    /// Records every audit call.
    #[derive(Default)]
    struct RecordingAudit {
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl AuditLog for RecordingAudit {
        fn log(&self, _agent: &str, action: &str, details: &Value) {
            self.calls
                .lock()
                .unwrap()
                .push((action.to_string(), details.clone()));
        }
    }

    /// Never answers within any reasonable timeout.
    struct StalledEmbedding;

    impl EmbeddingService for StalledEmbedding {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        fn dimensions(&self) -> usize {
            4
        }
    }

    fn open_corpus(dir: &Path) -> Arc<Corpus> {
        Arc::new(Corpus::open(&dir.join("vectors.idx"), &dir.join("metadata.jsonl")).unwrap())
    }

    fn doc(text: &str) -> Document {
        let mut metadata = Metadata::new();
        metadata.insert("description".into(), Value::String(text.to_string()));
        Document::new(text, metadata)
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = IndexingPipeline::new(
            open_corpus(dir.path()),
            Arc::new(MockEmbedding::with_dimensions(8)),
            Arc::new(NoopAuditLog),
        );
        assert_eq!(pipeline.index_documents(Vec::new()).await.unwrap(), None);
        assert!(!dir.path().join("vectors.idx").exists());
    }

    #[tokio::test]
    async fn test_batches_get_consecutive_ids_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(RecordingAudit::default());
        let pipeline = IndexingPipeline::new(
            open_corpus(dir.path()),
            Arc::new(MockEmbedding::with_dimensions(8)),
            audit.clone(),
        );

        let first = pipeline
            .index_documents(vec![doc("ATM withdrawal"), doc("Salary credit")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!((first.start_id, first.end_id, first.count), (0, 1, 2));

        let second = pipeline
            .index_documents(vec![doc("Amazon purchase")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!((second.start_id, second.end_id, second.count), (2, 2, 1));

        let reopened = Corpus::open(
            &dir.path().join("vectors.idx"),
            &dir.path().join("metadata.jsonl"),
        )
        .unwrap();
        let sizes = reopened.sizes().unwrap();
        assert_eq!(sizes.vectors, 3);
        assert_eq!(sizes.metadata, 3);
        assert_eq!(sizes.dimension, Some(8));

        let calls = audit.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "Indexed documents");
        assert_eq!(calls[1].1["count"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_embedding_timeout_leaves_corpus_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = open_corpus(dir.path());
        let pipeline = IndexingPipeline::new(
            corpus.clone(),
            Arc::new(StalledEmbedding),
            Arc::new(NoopAuditLog),
        )
        .with_embed_timeout(Duration::from_millis(20));

        let err = pipeline
            .index_documents(vec![doc("Rent")])
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::ExternalCall(_)));
        assert_eq!(corpus.sizes().unwrap().vectors, 0);
        assert_eq!(corpus.sizes().unwrap().metadata, 0);
    }

    #[tokio::test]
    async fn test_dimension_change_is_rejected_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = open_corpus(dir.path());

        IndexingPipeline::new(
            corpus.clone(),
            Arc::new(MockEmbedding::with_dimensions(8)),
            Arc::new(NoopAuditLog),
        )
        .index_documents(vec![doc("Coffee")])
        .await
        .unwrap();

        let err = IndexingPipeline::new(
            corpus.clone(),
            Arc::new(MockEmbedding::with_dimensions(16)),
            Arc::new(NoopAuditLog),
        )
        .index_documents(vec![doc("Tea")])
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            TallyError::DimensionMismatch {
                expected: 8,
                actual: 16
            }
        ));
        let sizes = corpus.sizes().unwrap();
        assert_eq!((sizes.vectors, sizes.metadata), (1, 1));
    }

    #[tokio::test]
    async fn test_misaligned_corpus_refuses_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = FlatIndex::with_dimension(8).unwrap();
        index.add(&[vec![1.0; 8]]).unwrap();
        let corpus = Arc::new(Corpus::new(
            Box::new(index),
            Box::new(JsonlMetadataStore::new(dir.path().join("metadata.jsonl"))),
            dir.path().join("vectors.idx"),
        ));

        let pipeline = IndexingPipeline::new(
            corpus.clone(),
            Arc::new(MockEmbedding::with_dimensions(8)),
            Arc::new(NoopAuditLog),
        );
        let err = pipeline
            .index_documents(vec![doc("Fuel")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TallyError::IdAlignment {
                expected: 1,
                actual: 0
            }
        ));
        assert_eq!(corpus.sizes().unwrap().vectors, 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_and_retry_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("vectors.idx");
        std::fs::create_dir_all(index_path.join("blocker")).unwrap();

        let corpus = Arc::new(Corpus::new(
            Box::new(FlatIndex::new()),
            Box::new(JsonlMetadataStore::new(dir.path().join("metadata.jsonl"))),
            &index_path,
        ));
        let audit = Arc::new(RecordingAudit::default());
        let pipeline = IndexingPipeline::new(
            corpus.clone(),
            Arc::new(MockEmbedding::with_dimensions(8)),
            audit.clone(),
        );

        let err = pipeline
            .index_documents(vec![doc("Electricity bill")])
            .await
            .unwrap_err();
        assert!(err.is_retryable_persistence());
        assert_eq!(corpus.sizes().unwrap().vectors, 1);
        assert_eq!(corpus.sizes().unwrap().metadata, 1);
        assert!(audit.calls.lock().unwrap().is_empty());

        std::fs::remove_dir_all(&index_path).unwrap();
        corpus.persist().await.unwrap();

        let reopened = Corpus::open(&index_path, &dir.path().join("metadata.jsonl")).unwrap();
        assert_eq!(reopened.sizes().unwrap().vectors, 1);
        assert_eq!(reopened.sizes().unwrap().metadata, 1);
    }

    #[tokio::test]
    async fn test_index_labeled_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("march_labeled.json");
        std::fs::write(
            &file,
            r#"[
                {"DATE": "01/03/2024", "DESCRIPTION": "ATM withdrawal", "DEBIT": 200, "CATEGORY": "Cash"},
                {"DATE": "02/03/2024", "DESCRIPTION": "Salary credit", "CREDIT": "50000", "CATEGORY": "Income"}
            ]"#,
        )
        .unwrap();

        let audit = Arc::new(RecordingAudit::default());
        let corpus = open_corpus(dir.path());
        let pipeline = IndexingPipeline::new(
            corpus.clone(),
            Arc::new(MockEmbedding::with_dimensions(8)),
            audit.clone(),
        );

        let summary = pipeline.index_labeled_file(&file).await.unwrap().unwrap();
        assert_eq!(summary.count, 2);

        let state = corpus.read().unwrap();
        let found = state.metadata.get_by_ids(&[1]);
        assert_eq!(found[&1].metadata["doc_id"], serde_json::json!("march_labeled.json"));
        assert_eq!(found[&1].metadata["row_index"], serde_json::json!(1));
        assert_eq!(found[&1].metadata["category"], serde_json::json!("Income"));
        drop(state);

        let calls = audit.calls.lock().unwrap();
        assert_eq!(calls[0].0, "Indexed file");
        assert_eq!(calls[0].1["rows_indexed"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_index_labeled_file_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("empty.json");
        std::fs::write(&file, "[]").unwrap();

        let pipeline = IndexingPipeline::new(
            open_corpus(dir.path()),
            Arc::new(MockEmbedding::with_dimensions(8)),
            Arc::new(NoopAuditLog),
        );
        assert_eq!(pipeline.index_labeled_file(&file).await.unwrap(), None);
    }

    /// Flat index whose first `failures` saves fail.
    struct FlakySaveIndex {
        inner: FlatIndex,
        failures: AtomicUsize,
    }

    impl FlakySaveIndex {
        fn new(failures: usize) -> Self {
            Self {
                inner: FlatIndex::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    impl VectorIndex for FlakySaveIndex {
        fn dimension(&self) -> Option<usize> {
            self.inner.dimension()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn create(&mut self, dimension: usize) -> Result<()> {
            self.inner.create(dimension)
        }

        fn add(&mut self, vectors: &[Vec<f32>]) -> Result<IdRange> {
            self.inner.add(vectors)
        }

        fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
            self.inner.search(query, k)
        }

        fn save(&self, path: &Path) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TallyError::Persistence("disk full".to_string()));
            }
            self.inner.save(path)
        }
    }

    /// Returns a NaN vector for every text.
    struct NanEmbedding;

    impl EmbeddingService for NanEmbedding {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![f32::NAN, 0.0, 0.0]).collect())
        }

        fn dimensions(&self) -> usize {
            3
        }
    }

    fn write_labeled_file(dir: &Path) -> std::path::PathBuf {
        let file = dir.join("april_labeled.json");
        std::fs::write(
            &file,
            r#"[
                {"DATE": "01/04/2024", "DESCRIPTION": "Rent", "DEBIT": 1200, "CATEGORY": "Housing"},
                {"DATE": "03/04/2024", "DESCRIPTION": "Groceries", "DEBIT": 85.5, "CATEGORY": "Food"}
            ]"#,
        )
        .unwrap();
        file
    }

    fn flaky_corpus(dir: &Path, failures: usize) -> Arc<Corpus> {
        Arc::new(Corpus::new(
            Box::new(FlakySaveIndex::new(failures)),
            Box::new(JsonlMetadataStore::new(dir.join("metadata.jsonl"))),
            dir.join("vectors.idx"),
        ))
    }

    #[tokio::test]
    async fn test_labeled_file_retry_keeps_summary_and_audits() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_labeled_file(dir.path());
        let audit = Arc::new(RecordingAudit::default());
        let pipeline = IndexingPipeline::new(
            flaky_corpus(dir.path(), 1),
            Arc::new(MockEmbedding::with_dimensions(8)),
            audit.clone(),
        );

        let summary = pipeline
            .index_labeled_file_with_retry(&file)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((summary.start_id, summary.end_id, summary.count), (0, 1, 2));

        let calls = audit.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "Indexed file");
        assert_eq!(calls[0].1["rows_indexed"], serde_json::json!(2));
        drop(calls);

        let reopened = open_corpus(dir.path());
        let sizes = reopened.sizes().unwrap();
        assert_eq!((sizes.vectors, sizes.metadata), (2, 2));
    }

    #[tokio::test]
    async fn test_labeled_file_retry_gives_up_after_one_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_labeled_file(dir.path());
        let audit = Arc::new(RecordingAudit::default());
        let corpus = flaky_corpus(dir.path(), 2);
        let pipeline = IndexingPipeline::new(
            corpus.clone(),
            Arc::new(MockEmbedding::with_dimensions(8)),
            audit.clone(),
        );

        let err = pipeline
            .index_labeled_file_with_retry(&file)
            .await
            .unwrap_err();
        assert!(err.is_retryable_persistence());
        assert!(audit.calls.lock().unwrap().is_empty());
        assert_eq!(corpus.sizes().unwrap().vectors, 2);

        // The third save succeeds and makes the batch durable.
        corpus.persist().await.unwrap();
        assert_eq!(open_corpus(dir.path()).sizes().unwrap().vectors, 2);
    }

    #[tokio::test]
    async fn test_labeled_file_without_retry_reports_failed_save() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_labeled_file(dir.path());
        let pipeline = IndexingPipeline::new(
            flaky_corpus(dir.path(), 1),
            Arc::new(MockEmbedding::with_dimensions(8)),
            Arc::new(NoopAuditLog),
        );

        let err = pipeline.index_labeled_file(&file).await.unwrap_err();
        assert!(err.is_retryable_persistence());
    }

    #[tokio::test]
    async fn test_rejected_first_batch_leaves_index_unbound() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = open_corpus(dir.path());

        let err = IndexingPipeline::new(corpus.clone(), Arc::new(NanEmbedding), Arc::new(NoopAuditLog))
            .index_documents(vec![doc("Broken row")])
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::InvalidInput(_)));
        assert_eq!(corpus.sizes().unwrap().dimension, None);

        let summary = IndexingPipeline::new(
            corpus.clone(),
            Arc::new(MockEmbedding::with_dimensions(8)),
            Arc::new(NoopAuditLog),
        )
        .index_documents(vec![doc("Insurance premium")])
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.start_id, 0);
        assert_eq!(corpus.sizes().unwrap().dimension, Some(8));
    }
}
