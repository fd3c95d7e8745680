//! Tally binary - composition root.
//!
//! 1. Load configuration from TOML and apply CLI overrides
//! 2. Open the corpus (vector index + metadata) from the data directory
//! 3. Build the embedding service, generator and audit sink from config
//! 4. Run one subcommand and print its result as JSON

mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;

use tally_core::config::TallyConfig;
use tally_core::error::TallyError;
use tally_storage::{AuditLog, Database, SqliteAuditLog, TracingAuditLog};
use tally_vector::{
    Corpus, DynEmbeddingService, ExtractiveGenerator, Generator, IndexingPipeline, MockEmbedding,
    OnnxEmbeddingService, OpenAiGenerator, RagPipeline, Retriever,
};

use cli::{CliArgs, Command};

fn build_embedder(config: &TallyConfig) -> Result<Arc<dyn DynEmbeddingService>, TallyError> {
    match config.embedding.backend.as_str() {
        "mock" => {
            tracing::warn!(
                dimensions = config.embedding.dimensions,
                "Using mock embeddings; results are not semantically meaningful"
            );
            Ok(Arc::new(MockEmbedding::with_dimensions(
                config.embedding.dimensions,
            )))
        }
        "onnx" => {
            let model_dir = tally_core::config::expand_home(&config.embedding.model_dir);
            Ok(Arc::new(OnnxEmbeddingService::from_directory(&model_dir)?))
        }
        other => Err(TallyError::Config(format!(
            "unknown embedding backend '{}'",
            other
        ))),
    }
}

fn build_generator(config: &TallyConfig) -> Result<Box<dyn Generator>, TallyError> {
    match config.generator.backend.as_str() {
        "extractive" => Ok(Box::new(ExtractiveGenerator)),
        "openai" => Ok(Box::new(OpenAiGenerator::new(&config.generator)?)),
        other => Err(TallyError::Config(format!(
            "unknown generator backend '{}'",
            other
        ))),
    }
}

fn build_audit(config: &TallyConfig) -> Arc<dyn AuditLog> {
    if !config.audit.enabled {
        return Arc::new(TracingAuditLog);
    }
    let db_path = config.audit_db_path();
    match Database::new(&db_path) {
        Ok(db) => {
            tracing::info!(path = %db_path.display(), "Audit database opened");
            Arc::new(SqliteAuditLog::new(db))
        }
        Err(e) => {
            tracing::warn!(
                path = %db_path.display(),
                error = %e,
                "Audit database unavailable; logging actions to tracing only"
            );
            Arc::new(TracingAuditLog)
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<(), TallyError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_index(pipeline: &IndexingPipeline, files: &[PathBuf]) -> Result<(), TallyError> {
    for file in files {
        let summary = pipeline.index_labeled_file_with_retry(file).await?;
        let output = match summary {
            Some(s) => json!({
                "file": file.display().to_string(),
                "start": s.start_id,
                "end": s.end_id,
                "count": s.count,
            }),
            None => json!({ "file": file.display().to_string(), "count": 0 }),
        };
        print_json(&output)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config. A load failure is reported once tracing is up.
    let config_file = args.resolve_config_path();
    let loaded = TallyConfig::load(&config_file);
    let mut config = loaded.as_ref().cloned().unwrap_or_default();
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }

    // Tracing. Logs go to stderr so stdout stays parseable JSON.
    let filter = args.resolve_log_filter(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Tally v{}", env!("CARGO_PKG_VERSION"));
    match &loaded {
        Ok(_) => tracing::info!(path = %config_file.display(), "Configuration loaded"),
        Err(TallyError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %config_file.display(), "No configuration file; using defaults")
        }
        Err(e) => tracing::warn!(
            path = %config_file.display(),
            error = %e,
            "Failed to load configuration; using defaults"
        ),
    }

    // Storage.
    let data_dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let corpus = Arc::new(Corpus::open(&config.index_path(), &config.metadata_path())?);
    let embedder = build_embedder(&config)?;
    let audit = build_audit(&config);
    let embed_timeout = Duration::from_secs(config.embedding.timeout_secs);

    match args.command {
        Command::Index { files } => {
            let pipeline = IndexingPipeline::new(Arc::clone(&corpus), embedder, audit)
                .with_embed_timeout(embed_timeout);
            run_index(&pipeline, &files).await?;
        }
        Command::Search { query, k } => {
            let k = config.index.effective_top_k(k);
            let retriever = Retriever::new(corpus, embedder).with_embed_timeout(embed_timeout);
            let results = retriever.retrieve(&query, k).await?;
            print_json(&serde_json::to_value(&results)?)?;
        }
        Command::Ask { question, k } => {
            let k = config.index.effective_top_k(k);
            let generator = build_generator(&config)?;
            let rag = RagPipeline::new(
                Retriever::new(corpus, embedder).with_embed_timeout(embed_timeout),
                audit,
            )
            .with_generate_timeout(Duration::from_secs(config.generator.timeout_secs));
            let (answer, sources) = rag
                .retrieve_and_answer(&question, generator.as_ref(), k)
                .await?;
            print_json(&json!({ "answer": answer, "sources": sources }))?;
        }
        Command::Stats => {
            let sizes = corpus.sizes()?;
            print_json(&json!({
                "index_path": corpus.index_path().display().to_string(),
                "dimension": sizes.dimension,
                "vectors": sizes.vectors,
                "metadata": sizes.metadata,
                "aligned": sizes.aligned(),
            }))?;
        }
    }

    Ok(())
}
