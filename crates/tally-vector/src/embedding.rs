//! Embedding service trait and implementations.
//!
//! - `OnnxEmbeddingService` runs a sentence-transformer ONNX export (the
//!   default deployment uses all-MiniLM-L6-v2) with a HuggingFace tokenizer.
//! - `MockEmbedding` provides deterministic hash-based vectors for testing.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use ort::session::Session;
use ort::value::TensorRef;
use tokenizers::Tokenizer;
use tracing::info;

use tally_core::error::TallyError;

/// Service turning texts into fixed-dimension vectors.
///
/// Implementations must be pure: the same text always yields the same
/// vector, whether it is embedded alone or as part of a larger batch.
pub trait EmbeddingService: Send + Sync {
    /// Embed every text, returning one vector per input in the same order.
    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, TallyError>> + Send;

    /// Dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;
}

/// Object-safe version of [`EmbeddingService`] for dynamic dispatch.
///
/// A blanket implementation is provided so that every `EmbeddingService`
/// automatically implements `DynEmbeddingService`.
pub trait DynEmbeddingService: Send + Sync {
    fn embed_boxed<'a>(
        &'a self,
        texts: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, TallyError>> + Send + 'a>>;

    fn dimensions(&self) -> usize;
}

impl<T: EmbeddingService> DynEmbeddingService for T {
    fn embed_boxed<'a>(
        &'a self,
        texts: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, TallyError>> + Send + 'a>> {
        Box::pin(self.embed(texts))
    }

    fn dimensions(&self) -> usize {
        EmbeddingService::dimensions(self)
    }
}

// ---------------------------------------------------------------------------
// OnnxEmbeddingService - real ONNX Runtime inference
// ---------------------------------------------------------------------------

/// ONNX Runtime-backed embedding service using a sentence-transformer model.
///
/// Expects a model directory containing `model.onnx` and `tokenizer.json`.
/// Texts are encoded one at a time and mean-pooled over the attention mask,
/// so batch composition never changes a text's vector.
pub struct OnnxEmbeddingService {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    dimensions: usize,
}

// ort::Session is Send + Sync internally (uses Arc<SharedSessionInner>).
unsafe impl Send for OnnxEmbeddingService {}
unsafe impl Sync for OnnxEmbeddingService {}

impl std::fmt::Debug for OnnxEmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEmbeddingService")
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl OnnxEmbeddingService {
    /// Load a sentence-transformer model from the given directory.
    pub fn from_directory(model_dir: &Path) -> Result<Self, TallyError> {
        Self::from_files(
            &model_dir.join("model.onnx"),
            &model_dir.join("tokenizer.json"),
        )
    }

    /// Load from explicit model and tokenizer file paths.
    pub fn from_files(model_path: &Path, tokenizer_path: &Path) -> Result<Self, TallyError> {
        if !model_path.exists() {
            return Err(TallyError::Config(format!(
                "ONNX model not found at {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(TallyError::Config(format!(
                "Tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| TallyError::Config(format!("ONNX session builder: {}", e)))?
            .with_intra_threads(1)
            .map_err(|e| TallyError::Config(format!("ONNX set threads: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| TallyError::Config(format!("ONNX load model: {}", e)))?;

        // Output is [batch, seq_len, hidden_dim]; MiniLM is 384 wide.
        let dimensions = session
            .outputs()
            .first()
            .and_then(|out| out.dtype().tensor_shape())
            .and_then(|shape| shape.last().copied())
            .map(|d| if d > 0 { d as usize } else { 384 })
            .unwrap_or(384);

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| TallyError::Config(format!("Failed to load tokenizer: {}", e)))?;

        info!(
            model = %model_path.display(),
            dimensions,
            "Loaded ONNX embedding model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            dimensions,
        })
    }

    /// Tokenize, run inference, and mean-pool the output for one text.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>, TallyError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| external(format!("Tokenization failed: {}", e)))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();
        let token_type_ids: Vec<i64> = encoding
            .get_type_ids()
            .iter()
            .map(|&t| t as i64)
            .collect();

        let seq_len = input_ids.len();

        let ids_array = ndarray::Array2::from_shape_vec((1, seq_len), input_ids)
            .map_err(|e| external(format!("input_ids array: {}", e)))?;
        let mask_array = ndarray::Array2::from_shape_vec((1, seq_len), attention_mask.clone())
            .map_err(|e| external(format!("attention_mask array: {}", e)))?;
        let type_array = ndarray::Array2::from_shape_vec((1, seq_len), token_type_ids)
            .map_err(|e| external(format!("token_type_ids array: {}", e)))?;

        let ids_ref = TensorRef::from_array_view(&ids_array)
            .map_err(|e| external(format!("TensorRef input_ids: {}", e)))?;
        let mask_ref = TensorRef::from_array_view(&mask_array)
            .map_err(|e| external(format!("TensorRef attention_mask: {}", e)))?;
        let type_ref = TensorRef::from_array_view(&type_array)
            .map_err(|e| external(format!("TensorRef token_type_ids: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| external(format!("Session lock poisoned: {}", e)))?;
        let outputs = session
            .run(ort::inputs![ids_ref, mask_ref, type_ref])
            .map_err(|e| external(format!("ONNX inference failed: {}", e)))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| external(format!("Extract embeddings: {}", e)))?;

        let shape_dims: Vec<i64> = shape.iter().copied().collect();
        let hidden_dim = match shape_dims.as_slice() {
            [_, .., last] => *last as usize,
            _ => {
                return Err(external(format!(
                    "Unexpected output shape: {:?}",
                    shape_dims
                )))
            }
        };

        let mut pooled = vec![0.0f32; hidden_dim];
        let mut count = 0.0f32;
        for (tok_idx, &mask_val) in attention_mask.iter().enumerate() {
            if mask_val > 0 {
                let offset = tok_idx * hidden_dim;
                for (dim, value) in pooled.iter_mut().enumerate() {
                    *value += data[offset + dim];
                }
                count += 1.0;
            }
        }
        if count > 0.0 {
            for val in &mut pooled {
                *val /= count;
            }
        }

        Ok(pooled)
    }
}

impl EmbeddingService for OnnxEmbeddingService {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TallyError> {
        // Inference is CPU-bound; run on a blocking thread.
        let svc = OnnxEmbeddingService {
            session: Arc::clone(&self.session),
            tokenizer: Arc::clone(&self.tokenizer),
            dimensions: self.dimensions,
        };
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            texts
                .iter()
                .map(|text| svc.embed_one(text))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| external(format!("Embedding task panicked: {}", e)))?
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn external(message: String) -> TallyError {
    TallyError::ExternalCall(message)
}

// ---------------------------------------------------------------------------
// MockEmbedding - deterministic hash-based vectors for testing
// ---------------------------------------------------------------------------

/// Mock embedding service returning deterministic vectors.
///
/// The output is derived from a hash of the input text, so identical inputs
/// always produce identical outputs.
#[derive(Debug, Clone)]
pub struct MockEmbedding {
    dimensions: usize,
}

impl Default for MockEmbedding {
    fn default() -> Self {
        Self { dimensions: 384 }
    }
}

impl MockEmbedding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn hash_to_vector(&self, text: &str) -> Vec<f32> {
        (0..self.dimensions)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                text.hash(&mut hasher);
                i.hash(&mut hasher);
                let h = hasher.finish();
                (((h as f64) / (u64::MAX as f64)) * 2.0 - 1.0) as f32
            })
            .collect()
    }
}

impl EmbeddingService for MockEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TallyError> {
        if texts.iter().any(|t| t.is_empty()) {
            return Err(external("Cannot embed empty text".to_string()));
        }
        Ok(texts.iter().map(|t| self.hash_to_vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
