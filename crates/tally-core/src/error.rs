use thiserror::Error;

/// Top-level error type for the Tally system.
///
/// The first five variants are the failure modes of the vector index,
/// metadata store and the two pipelines. The rest cover configuration,
/// SQLite and plain I/O.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TallyError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Id alignment error: expected next id {expected}, got {actual}")]
    IdAlignment { expected: u64, actual: u64 },

    #[error("Vector index has no dimension yet")]
    UninitializedIndex,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("External call failed: {0}")]
    ExternalCall(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TallyError {
    /// True when the in-memory state is ahead of disk and a later
    /// `persist` call can still make it durable.
    pub fn is_retryable_persistence(&self) -> bool {
        matches!(self, TallyError::Persistence(_))
    }
}

impl From<toml::de::Error> for TallyError {
    fn from(err: toml::de::Error) -> Self {
        TallyError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TallyError {
    fn from(err: toml::ser::Error) -> Self {
        TallyError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;
