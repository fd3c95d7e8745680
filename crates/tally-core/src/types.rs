use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Position of a vector in the index. Assigned densely from 0 in insertion order.
pub type VectorId = u64;

/// Free-form metadata attached to a document.
pub type Metadata = Map<String, Value>;

// =============================================================================
// Indexing
// =============================================================================

/// The indexing unit: one document becomes one vector and one metadata entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            text: text.into(),
            metadata,
        }
    }
}

/// Out-of-band metadata for one vector.
///
/// Unknown fields are ignored when reading, so newer writers may add fields
/// without breaking older readers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub vector_id: VectorId,
    #[serde(default)]
    pub metadata: Metadata,
    pub indexed_at: DateTime<Utc>,
}

/// Inclusive range of ids assigned by one insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: VectorId,
    pub end: VectorId,
}

impl IdRange {
    /// Number of ids in the range.
    pub fn count(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn ids(&self) -> impl Iterator<Item = VectorId> {
        self.start..=self.end
    }
}

/// Summary of a committed indexing batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub start_id: VectorId,
    pub end_id: VectorId,
    pub count: usize,
}

impl From<IdRange> for IndexSummary {
    fn from(range: IdRange) -> Self {
        Self {
            start_id: range.start,
            end_id: range.end,
            count: range.count(),
        }
    }
}

// =============================================================================
// Retrieval
// =============================================================================

/// A vector id with its similarity to the query.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub vector_id: VectorId,
    /// Inner product of unit vectors, in [-1, 1]. Higher is closer.
    pub score: f32,
}

/// A ranked retrieval hit joined with its metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub vector_id: VectorId,
    pub metadata: Metadata,
    pub score: f32,
}

impl RetrievalResult {
    /// One-line description used as generator context.
    pub fn describe(&self) -> String {
        format!(
            "{} (category: {})",
            metadata_str(&self.metadata, "description"),
            metadata_str(&self.metadata, "category")
        )
    }
}

/// Render a metadata value as plain text; strings are unquoted, missing is empty.
pub fn metadata_str(metadata: &Metadata, key: &str) -> String {
    match metadata.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

// =============================================================================
// Labeled transactions
// =============================================================================

/// A categorized bank-statement row as produced by the labeling stage.
///
/// Field names follow the upstream JSON (`DATE`, `DESCRIPTION`, ...). Values
/// may be strings or numbers and any of them may be missing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct LabeledTransaction {
    #[serde(default)]
    pub date: Value,
    #[serde(default)]
    pub description: Value,
    #[serde(default)]
    pub debit: Value,
    #[serde(default)]
    pub credit: Value,
    #[serde(default)]
    pub balance: Value,
    #[serde(default)]
    pub category: Value,
}

impl LabeledTransaction {
    /// Text that gets embedded for this row.
    pub fn embedding_text(&self) -> String {
        format!(
            "{} {} DEBIT:{} CREDIT:{} BALANCE:{} CATEGORY:{}",
            plain(&self.date),
            plain(&self.description),
            plain(&self.debit),
            plain(&self.credit),
            plain(&self.balance),
            plain(&self.category)
        )
    }

    /// Build the document for row `row_index` of the file named `doc_id`.
    pub fn to_document(&self, doc_id: &str, row_index: usize) -> Document {
        let mut metadata = Metadata::new();
        metadata.insert("doc_id".into(), Value::String(doc_id.to_string()));
        metadata.insert("row_index".into(), Value::from(row_index));
        metadata.insert("description".into(), Value::String(plain(&self.description)));
        metadata.insert("category".into(), Value::String(plain(&self.category)));
        Document::new(self.embedding_text(), metadata)
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
