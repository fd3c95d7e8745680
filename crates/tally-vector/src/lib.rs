//! Tally vector crate - flat cosine index, embedding services, indexing and
//! retrieval pipelines, and answer generation.
//!
//! A [`Corpus`] pairs a [`VectorIndex`] with a metadata store and keeps their
//! ids aligned. [`IndexingPipeline`] writes to it, [`Retriever`] reads from
//! it, and [`RagPipeline`] turns retrieved results into an answer.

pub mod corpus;
pub mod embedding;
pub mod generator;
pub mod index;
pub mod pipeline;
pub mod rag;
pub mod search;

pub use corpus::{Corpus, CorpusSizes};
pub use embedding::{DynEmbeddingService, EmbeddingService, MockEmbedding, OnnxEmbeddingService};
pub use generator::{ExtractiveGenerator, Generator, OpenAiGenerator};
pub use index::{FlatIndex, VectorIndex};
pub use pipeline::IndexingPipeline;
pub use rag::{build_context, build_prompt, RagPipeline};
pub use search::Retriever;
