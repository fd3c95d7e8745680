//! Vector index with exact cosine similarity search.
//!
//! Vectors are L2-normalized on the way in, so similarity is a plain inner
//! product. [`FlatIndex`] scans every stored vector per query (O(N·d)); the
//! [`VectorIndex`] trait keeps callers independent of that choice so a graph
//! or tree index can be swapped in later.
//!
//! A vector whose norm is zero cannot be normalized. It is stored as-is
//! (all zeros) and therefore scores 0 against every query; a zero query
//! likewise scores 0 against everything.

use std::cmp::Ordering;
use std::path::Path;

use tracing::{debug, info};

use tally_core::error::{Result, TallyError};
use tally_core::types::{IdRange, Neighbor, VectorId};
use tally_storage::write_atomic;

/// File magic for the flat index format.
const MAGIC: [u8; 4] = *b"TVIX";
/// Current on-disk format version.
const FORMAT_VERSION: u32 = 1;
/// magic + version + dimension + count.
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Append-only store of fixed-dimension vectors with top-k search.
pub trait VectorIndex: Send + Sync {
    /// Bound dimension, or `None` before [`VectorIndex::create`] / load.
    fn dimension(&self) -> Option<usize>;

    /// Number of stored vectors. The next assigned id equals this value.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind the index to `dimension`. Idempotent for the same dimension.
    fn create(&mut self, dimension: usize) -> Result<()>;

    /// Append vectors in order and return the ids assigned to them.
    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<IdRange>;

    /// Up to `k` nearest vectors by descending score, ties by ascending id.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// Write the full index to `path`.
    fn save(&self, path: &Path) -> Result<()>;
}

/// Brute-force inner-product index over normalized vectors.
#[derive(Debug, Clone, Default)]
pub struct FlatIndex {
    dimension: Option<usize>,
    /// Flattened rows: `len = count * dimension`.
    data: Vec<f32>,
}

impl FlatIndex {
    /// An index with no dimension yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty index bound to `dimension`.
    pub fn with_dimension(dimension: usize) -> Result<Self> {
        let mut index = Self::new();
        index.create(dimension)?;
        Ok(index)
    }

    /// Load an index from `path`. A missing file yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            debug!(path = %path.display(), "No index file");
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let index = Self::decode(&bytes)
            .map_err(|reason| TallyError::Persistence(format!("{}: {}", path.display(), reason)))?;
        info!(
            path = %path.display(),
            dimension = index.dimension.unwrap_or(0),
            vectors = index.len(),
            "Vector index loaded"
        );
        Ok(Some(index))
    }

    /// Stored (normalized) vector for `id`.
    pub fn vector(&self, id: VectorId) -> Option<&[f32]> {
        let d = self.dimension?;
        let start = usize::try_from(id).ok()?.checked_mul(d)?;
        self.data.get(start..start + d)
    }

    fn check_dimension(&self, actual: usize) -> Result<usize> {
        let expected = self.dimension.ok_or(TallyError::UninitializedIndex)?;
        if actual != expected {
            return Err(TallyError::DimensionMismatch { expected, actual });
        }
        Ok(expected)
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!("truncated header ({} bytes)", bytes.len()));
        }
        if bytes[0..4] != MAGIC {
            return Err("bad magic".to_string());
        }
        let version = u32::from_le_bytes(le_array(&bytes[4..8]));
        if version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", version));
        }
        let dimension = u32::from_le_bytes(le_array(&bytes[8..12])) as usize;
        let count = u64::from_le_bytes(le_array(&bytes[12..20])) as usize;

        let payload = &bytes[HEADER_LEN..];
        let expected_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| "header overflow".to_string())?;
        if payload.len() != expected_len {
            return Err(format!(
                "payload is {} bytes, header promises {}",
                payload.len(),
                expected_len
            ));
        }
        if dimension == 0 && count > 0 {
            return Err("vectors stored without a dimension".to_string());
        }

        let data = payload
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(le_array(chunk)))
            .collect();
        Ok(Self {
            dimension: (dimension > 0).then_some(dimension),
            data,
        })
    }
}

impl VectorIndex for FlatIndex {
    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn len(&self) -> usize {
        match self.dimension {
            Some(d) => self.data.len() / d,
            None => 0,
        }
    }

    fn create(&mut self, dimension: usize) -> Result<()> {
        if dimension == 0 {
            return Err(TallyError::InvalidInput(
                "vector dimension must be positive".to_string(),
            ));
        }
        match self.dimension {
            Some(existing) if existing != dimension => Err(TallyError::DimensionMismatch {
                expected: existing,
                actual: dimension,
            }),
            Some(_) => Ok(()),
            None => {
                self.dimension = Some(dimension);
                Ok(())
            }
        }
    }

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<IdRange> {
        if vectors.is_empty() {
            return Err(TallyError::InvalidInput("empty vector batch".to_string()));
        }
        // Validate the whole batch before touching storage.
        let dimension = self.dimension.ok_or(TallyError::UninitializedIndex)?;
        validate_batch(vectors, dimension)?;

        let start = self.len() as VectorId;
        self.data.reserve(vectors.iter().map(Vec::len).sum());
        for vector in vectors {
            let offset = self.data.len();
            self.data.extend_from_slice(vector);
            normalize(&mut self.data[offset..]);
        }

        Ok(IdRange {
            start,
            end: start + vectors.len() as VectorId - 1,
        })
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let d = self.check_dimension(query.len())?;
        ensure_finite(query)?;

        let mut query = query.to_vec();
        normalize(&mut query);

        let mut scored: Vec<Neighbor> = self
            .data
            .chunks_exact(d)
            .enumerate()
            .map(|(i, row)| Neighbor {
                vector_id: i as VectorId,
                score: similarity(&query, row),
            })
            .collect();

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, rank);
            scored.truncate(k);
        }
        scored.sort_unstable_by(rank);

        Ok(scored)
    }

    fn save(&self, path: &Path) -> Result<()> {
        let dimension = self.dimension.unwrap_or(0) as u32;
        let count = self.len() as u64;
        write_atomic(path, |w| {
            w.write_all(&MAGIC)?;
            w.write_all(&FORMAT_VERSION.to_le_bytes())?;
            w.write_all(&dimension.to_le_bytes())?;
            w.write_all(&count.to_le_bytes())?;
            for value in &self.data {
                w.write_all(&value.to_le_bytes())?;
            }
            Ok(())
        })?;
        debug!(path = %path.display(), vectors = count, "Vector index saved");
        Ok(())
    }
}

/// Descending score, then ascending id.
fn rank(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.vector_id.cmp(&b.vector_id))
}

/// Inner product clamped to [-1, 1]. `+ 0.0` folds -0.0 into 0.0 so that
/// zero scores tie on id.
fn similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot.clamp(-1.0, 1.0) + 0.0
}

/// Scale `v` to unit L2 norm in place. Only an all-zero vector is left
/// unchanged.
///
/// The norm is accumulated in f64: squares of any finite f32 neither
/// overflow nor underflow to zero there.
pub fn normalize(v: &mut [f32]) {
    let norm = v
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = (f64::from(*x) / norm) as f32;
        }
    }
}

/// Check that every vector has exactly `dimension` finite components.
pub fn validate_batch(vectors: &[Vec<f32>], dimension: usize) -> Result<()> {
    for vector in vectors {
        if vector.len() != dimension {
            return Err(TallyError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        ensure_finite(vector)?;
    }
    Ok(())
}

fn ensure_finite(v: &[f32]) -> Result<()> {
    if v.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(TallyError::InvalidInput(
            "vector contains NaN or infinite components".to_string(),
        ))
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
