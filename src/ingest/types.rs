// src/ingest/types.rs
use chrono::{DateTime, Utc};

/// One parsed feed entry, text normalized, not yet deduplicated or
/// classified.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RawItem {
    pub title: String,
    pub summary: String,
    pub link: String,
    /// Entry publish time; falls back to fetch time when the feed omits it
    /// or it fails to parse.
    pub published: DateTime<Utc>,
    pub source: String,
    /// Category terms the feed itself supplied (item `<category>` elements).
    pub source_terms: Vec<String>,
}

/// Fetch failure taxonomy.
///
/// Transient failures were already retried with backoff before being
/// surfaced; permanent failures (including unparseable bodies) skip retry
/// entirely and drive blacklist accounting.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transient fetch failure after {attempts} attempts: {reason}")]
    Transient { attempts: u32, reason: String },
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
    #[error("feed parse failure: {0}")]
    Parse(String),
}

impl FetchError {
    /// Permanent-class failures (permanent + parse) were never retried;
    /// transient ones exhausted their backoff budget first.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Permanent(_) | FetchError::Parse(_))
    }
}
