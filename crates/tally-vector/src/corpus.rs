//! Shared state: the vector index and the metadata store, kept in step.
//!
//! Both stores sit behind one `RwLock`, so a reader always observes the two
//! at the same instant. Writers additionally serialize on an async mutex
//! for the whole embed-insert-persist sequence, which keeps id ranges from
//! overlapping.

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use tally_core::error::{Result, TallyError};
use tally_storage::{JsonlMetadataStore, MetadataStore};

use crate::index::{FlatIndex, VectorIndex};

/// Index and metadata as seen under one lock acquisition.
pub(crate) struct CorpusState {
    pub(crate) index: Box<dyn VectorIndex>,
    pub(crate) metadata: Box<dyn MetadataStore>,
}

/// Point-in-time sizes of both stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorpusSizes {
    pub dimension: Option<usize>,
    pub vectors: usize,
    pub metadata: usize,
}

impl CorpusSizes {
    /// True when every vector has exactly one metadata entry.
    pub fn aligned(&self) -> bool {
        self.vectors == self.metadata
    }
}

/// The vector index and metadata store of one deployment.
pub struct Corpus {
    state: RwLock<CorpusState>,
    writer: Mutex<()>,
    index_path: PathBuf,
}

impl Corpus {
    /// Wrap already constructed stores. `index_path` is where
    /// [`Corpus::persist`] saves the index.
    pub fn new(
        index: Box<dyn VectorIndex>,
        metadata: Box<dyn MetadataStore>,
        index_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state: RwLock::new(CorpusState { index, metadata }),
            writer: Mutex::new(()),
            index_path: index_path.into(),
        }
    }

    /// Load a flat index and a JSON-lines metadata store from disk.
    ///
    /// Missing files start empty. Differing counts are reported but left
    /// alone; the next indexing call will refuse to append until resolved.
    pub fn open(index_path: &Path, metadata_path: &Path) -> Result<Self> {
        let index = FlatIndex::load(index_path)?.unwrap_or_default();
        let metadata = JsonlMetadataStore::load(metadata_path)?;

        if index.len() != metadata.len() {
            warn!(
                vectors = index.len(),
                metadata = metadata.len(),
                "Vector index and metadata store disagree; ids without metadata will be skipped"
            );
        }
        info!(
            vectors = index.len(),
            dimension = index.dimension().unwrap_or(0),
            "Corpus opened"
        );

        Ok(Self::new(Box::new(index), Box::new(metadata), index_path))
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Sizes of both stores read under a single lock acquisition.
    pub fn sizes(&self) -> Result<CorpusSizes> {
        let state = self.read()?;
        Ok(CorpusSizes {
            dimension: state.index.dimension(),
            vectors: state.index.len(),
            metadata: state.metadata.len(),
        })
    }

    /// Write both stores to disk, index first.
    ///
    /// After a failed indexing persist, calling this again makes the
    /// in-memory state durable. Waits for any in-flight indexing call, so
    /// at most one save runs at a time.
    pub async fn persist(&self) -> Result<()> {
        let writer = self.lock_writer().await;
        self.persist_with(&writer)
    }

    /// Save while already holding the writer guard.
    pub(crate) fn persist_with(&self, _writer: &MutexGuard<'_, ()>) -> Result<()> {
        let state = self.read()?;
        state.index.save(&self.index_path)?;
        state.metadata.persist()?;
        info!(vectors = state.index.len(), "Corpus persisted");
        Ok(())
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, CorpusState>> {
        self.state
            .read()
            .map_err(|e| TallyError::Storage(format!("Corpus lock poisoned: {}", e)))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, CorpusState>> {
        self.state
            .write()
            .map_err(|e| TallyError::Storage(format!("Corpus lock poisoned: {}", e)))
    }

    /// Exclusive right to mutate the corpus. Held across the whole
    /// indexing sequence, including the embedding call.
    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }
}

impl std::fmt::Debug for Corpus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Corpus")
            .field("index_path", &self.index_path)
            .finish()
    }
}
