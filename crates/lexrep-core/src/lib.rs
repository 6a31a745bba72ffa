//! Core domain records for the legal-document replica.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lexrep-core";

/// Ingestion unit: one calendar year of a collection.
pub type Period = i32;

/// A named corpus of documents (one national series per locale).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub remote_id: Option<i64>,
    pub code: String,
    pub name: Option<String>,
    pub first_period: Option<Period>,
    pub last_period: Option<Period>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocType {
    pub remote_id: Option<i64>,
    pub code: String,
    pub name: Option<String>,
}

/// One legal instrument. `(collection, code)` is the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub remote_id: Option<i64>,
    pub collection: String,
    pub code: String,
    /// Human-readable citation, e.g. `40/1964 Sb.`
    pub citation: Option<String>,
    pub period: Option<Period>,
    pub number: Option<i64>,
    pub title: Option<String>,
    pub doc_type: Option<String>,
    pub declared_on: Option<NaiveDate>,
    pub published_on: Option<NaiveDate>,
    pub effective_from: Option<NaiveDate>,
    /// `None` means still in force.
    pub effective_till: Option<NaiveDate>,
    pub last_update: Option<String>,
    pub href: Option<String>,
    /// Structured content payload as delivered by the remote API.
    pub content: Option<JsonValue>,
    /// Raw markup of the main content region of the rendered page.
    pub raw_snapshot: Option<String>,
    pub tags: Option<Vec<String>>,
    pub ingested_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(collection: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            remote_id: None,
            collection: collection.into(),
            code: code.into(),
            citation: None,
            period: None,
            number: None,
            title: None,
            doc_type: None,
            declared_on: None,
            published_on: None,
            effective_from: None,
            effective_till: None,
            last_update: None,
            href: None,
            content: None,
            raw_snapshot: None,
            tags: None,
            ingested_at: None,
        }
    }

    pub fn is_in_force(&self) -> bool {
        self.effective_till.is_none()
    }

    pub fn has_full_content(&self) -> bool {
        self.content.is_some()
    }
}

/// Historical revision of a document's effective content. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub collection: String,
    pub document_code: String,
    pub version_number: i64,
    pub effective_from: Option<NaiveDate>,
    pub effective_till: Option<NaiveDate>,
    pub content: Option<JsonValue>,
}

/// Dated publication unit within a period. `(collection, period, number)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub remote_id: Option<i64>,
    pub collection: String,
    pub period: Period,
    pub number: i64,
    pub code: Option<String>,
    pub citation: Option<String>,
    pub published_on: Option<NaiveDate>,
    pub href: Option<String>,
    pub file: Option<String>,
}

/// A batch together with the documents released under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDraft {
    pub batch: Batch,
    pub documents: Vec<Document>,
}

/// Why a remote call produced no data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceFailure {
    Timeout { method: String },
    Transport { method: String, message: String },
    HttpStatus { method: String, status: u16 },
    Malformed { method: String, message: String },
}

impl SourceFailure {
    pub fn method(&self) -> &str {
        match self {
            SourceFailure::Timeout { method }
            | SourceFailure::Transport { method, .. }
            | SourceFailure::HttpStatus { method, .. }
            | SourceFailure::Malformed { method, .. } => method,
        }
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFailure::Timeout { method } => write!(f, "{method}: request timed out"),
            SourceFailure::Transport { method, message } => {
                write!(f, "{method}: transport error: {message}")
            }
            SourceFailure::HttpStatus { method, status } => write!(f, "{method}: http status {status}"),
            SourceFailure::Malformed { method, message } => {
                write!(f, "{method}: malformed response: {message}")
            }
        }
    }
}

/// Everything the remote source returned for one period.
///
/// An empty result is never an error by itself; `failure` tells a transport
/// problem apart from a genuine coverage gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodResult {
    pub collection: String,
    pub period: Period,
    pub batches: Vec<BatchDraft>,
    pub failure: Option<SourceFailure>,
}

impl PeriodResult {
    pub fn empty(collection: impl Into<String>, period: Period) -> Self {
        Self {
            collection: collection.into(),
            period,
            batches: Vec::new(),
            failure: None,
        }
    }

    pub fn failed(collection: impl Into<String>, period: Period, failure: SourceFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::empty(collection, period)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn document_count(&self) -> usize {
        self.batches.iter().map(|b| b.documents.len()).sum()
    }
}

/// Result of fetching one document page through the HTML fallback path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub url: String,
    pub title: String,
    pub plain_text: String,
    pub raw_markup: String,
    /// Keywords and breadcrumb labels found on the page.
    pub page_tags: Vec<String>,
    /// Absolute links to attached files (PDF, Word, Excel).
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl ScrapedPage {
    /// False when the main content marker was missing from the page.
    pub fn has_content(&self) -> bool {
        !self.raw_markup.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_collections: u64,
    pub total_doc_types: u64,
    pub total_documents: u64,
    pub total_batches: u64,
    pub with_full_content: u64,
    pub tagged_documents: u64,
    pub first_period: Option<Period>,
    pub last_period: Option<Period>,
    pub by_type: BTreeMap<String, u64>,
    pub by_period: BTreeMap<Period, u64>,
    pub by_collection: BTreeMap<String, u64>,
}

/// Listing row used by search and period listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub collection: String,
    pub code: String,
    pub citation: Option<String>,
    pub title: Option<String>,
    pub period: Option<Period>,
    pub number: Option<i64>,
    pub doc_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDetail {
    pub document: Document,
    pub fragment_count: usize,
    pub content_preview: Vec<String>,
}

/// Progress of a batch download job, as seen by pollers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub run_id: Option<Uuid>,
    pub running: bool,
    /// Stop was requested; the worker still holds the slot until it exits.
    pub stopping: bool,
    pub current: Option<String>,
    pub total: usize,
    pub completed: usize,
    pub errors: Vec<String>,
}

/// Number of entries in the `Fragments` array of a structured payload.
pub fn fragment_count(content: &JsonValue) -> usize {
    content
        .get("Fragments")
        .and_then(JsonValue::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

/// Text of the first `limit` fragments that carry content, each cut to `max_chars`.
pub fn content_preview(content: &JsonValue, limit: usize, max_chars: usize) -> Vec<String> {
    let Some(fragments) = content.get("Fragments").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    fragments
        .iter()
        .take(limit)
        .filter_map(|frag| frag.get("Content").and_then(JsonValue::as_str))
        .filter(|text| !text.is_empty())
        .map(|text| text.chars().take(max_chars).collect())
        .collect()
}
