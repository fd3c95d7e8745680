//! Metadata store: the out-of-band side of the vector index.
//!
//! Entries are kept in insertion order and addressed by position, so the
//! id of every entry equals its index in the backing `Vec`. The on-disk
//! form is one JSON object per line.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use tally_core::error::{Result, TallyError};
use tally_core::types::{MetadataEntry, VectorId};

use crate::atomic::write_atomic;

/// Ordered, append-only mapping from vector id to metadata.
pub trait MetadataStore: Send + Sync {
    /// Number of entries. Ids `[0, len)` are present.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append entries whose ids continue contiguously from `len()`.
    ///
    /// Either every entry is appended or none is.
    fn append(&mut self, entries: Vec<MetadataEntry>) -> Result<()>;

    /// Look up entries by id. Unknown ids are absent from the result.
    fn get_by_ids(&self, ids: &[VectorId]) -> HashMap<VectorId, MetadataEntry>;

    /// Write the full entry sequence to durable storage.
    fn persist(&self) -> Result<()>;
}

/// [`MetadataStore`] backed by a JSON-lines file.
#[derive(Debug, Clone)]
pub struct JsonlMetadataStore {
    path: PathBuf,
    entries: Vec<MetadataEntry>,
}

impl JsonlMetadataStore {
    /// Create an empty store that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
        }
    }

    /// Load the store from `path`. A missing file yields an empty store.
    ///
    /// Fails with [`TallyError::IdAlignment`] if the stored ids are not the
    /// contiguous prefix `[0, N)`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "No metadata file, starting empty");
            return Ok(Self::new(path));
        }

        let reader = BufReader::new(std::fs::File::open(&path)?);
        let mut entries = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: MetadataEntry = serde_json::from_str(&line).map_err(|e| {
                TallyError::Serialization(format!(
                    "{} line {}: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            let expected = entries.len() as VectorId;
            if entry.vector_id != expected {
                return Err(TallyError::IdAlignment {
                    expected,
                    actual: entry.vector_id,
                });
            }
            entries.push(entry);
        }

        info!(path = %path.display(), entries = entries.len(), "Metadata store loaded");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries in id order.
    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }
}

impl MetadataStore for JsonlMetadataStore {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn append(&mut self, entries: Vec<MetadataEntry>) -> Result<()> {
        let base = self.entries.len() as VectorId;
        for (offset, entry) in entries.iter().enumerate() {
            let expected = base + offset as VectorId;
            if entry.vector_id != expected {
                return Err(TallyError::IdAlignment {
                    expected,
                    actual: entry.vector_id,
                });
            }
        }
        self.entries.extend(entries);
        Ok(())
    }

    fn get_by_ids(&self, ids: &[VectorId]) -> HashMap<VectorId, MetadataEntry> {
        ids.iter()
            .filter_map(|&id| {
                let pos = usize::try_from(id).ok()?;
                self.entries.get(pos).map(|entry| (id, entry.clone()))
            })
            .collect()
    }

    fn persist(&self) -> Result<()> {
        write_atomic(&self.path, |w| {
            for entry in &self.entries {
                serde_json::to_writer(&mut *w, entry)?;
                w.write_all(b"\n")?;
            }
            Ok(())
        })?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "Metadata persisted");
        Ok(())
    }
}
