//! Remote source contracts: the document API client and the HTML fallback fetcher.

use std::ops::RangeInclusive;

use async_trait::async_trait;
use chrono::NaiveDate;
use lexrep_core::{
    Collection, DocType, Document, DocumentVersion, Period, PeriodResult, ScrapedPage,
    SourceFailure,
};
use lexrep_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

mod api;
mod html;

pub use api::{
    batch_draft_from_api, document_from_api, unwrap_result_envelope, ApiClient, ApiClientConfig,
};
pub use html::{
    attachment_file_name, code_from_url, extract_document_links, parse_document_page,
    resolve_href, HtmlFetcher, HtmlFetcherConfig, ATTACHMENT_EXTENSIONS, MAIN_CONTENT_SELECTOR,
};

pub const CRATE_NAME: &str = "lexrep-adapters";

/// Encoding requested from the remote API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Json,
    Xml,
}

impl ResponseFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseFormat::Json => "json",
            ResponseFormat::Xml => "xml",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Structured remote source. Transport and decoding problems never escape as
/// errors: they come back as a `SourceFailure` value.
#[async_trait]
pub trait PeriodSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_period(&self, collection: &str, period: Period) -> PeriodResult;

    async fn collections(&self) -> Result<Vec<Collection>, SourceFailure>;

    async fn doc_types(&self) -> Result<Vec<DocType>, SourceFailure>;

    /// Structured payload of one document; `Ok(None)` when the source has none.
    async fn document_content(
        &self,
        collection: &str,
        code: &str,
    ) -> Result<Option<JsonValue>, SourceFailure>;

    async fn document_versions(
        &self,
        collection: &str,
        code: &str,
    ) -> Result<Vec<DocumentVersion>, SourceFailure>;

    async fn publish_list(
        &self,
        collection: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Document>, SourceFailure>;
}

/// Rendered-page source used when the structured source has no coverage.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn list_period_links(
        &self,
        collection: &str,
        period: Period,
    ) -> Result<Vec<String>, AdapterError>;

    /// A page without the main content marker is returned with empty
    /// content rather than as an error.
    async fn fetch_document(&self, url: &str) -> Result<ScrapedPage, AdapterError>;

    fn document_url(&self, collection: &str, code: &str) -> String;

    /// Raw bytes of a file linked from a document page.
    async fn fetch_attachment(&self, url: &str) -> Result<Vec<u8>, AdapterError>;

    /// Walk one listing page per period; a failing listing is logged and
    /// skipped. Links are de-duplicated keeping first-seen order.
    async fn list_document_links(
        &self,
        collection: &str,
        periods: RangeInclusive<Period>,
    ) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut links = Vec::new();
        for period in periods {
            match self.list_period_links(collection, period).await {
                Ok(found) => {
                    for link in found {
                        if seen.insert(link.clone()) {
                            links.push(link);
                        }
                    }
                }
                Err(err) => warn!(collection, period, error = %err, "listing page failed"),
            }
        }
        links
    }
}

pub(crate) fn json_i64(value: &JsonValue, key: &str) -> Option<i64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_string(value: &JsonValue, key: &str) -> Option<String> {
    let text = match value.get(key)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Dates arrive as `YYYY-MM-DD` optionally followed by a time part.
pub(crate) fn json_date(value: &JsonValue, key: &str) -> Option<NaiveDate> {
    let raw = json_string(value, key)?;
    let day = raw.get(..10).unwrap_or(&raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Remote lists come back either as an array or, for a single entry, as a bare object.
pub(crate) fn one_or_many(value: Option<&JsonValue>) -> Vec<&JsonValue> {
    match value {
        Some(JsonValue::Array(items)) => items.iter().collect(),
        Some(item @ JsonValue::Object(_)) => vec![item],
        _ => Vec::new(),
    }
}

/// Entries of a list payload that is either bare or nested under `key`.
pub(crate) fn list_under<'a>(value: &'a JsonValue, key: &str) -> Vec<&'a JsonValue> {
    match value.get(key) {
        Some(inner) => one_or_many(Some(inner)),
        None if value.is_array() => one_or_many(Some(value)),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_fields_accept_strings_and_numbers() {
        let v = json!({"Year": "1964", "Number": 40, "Code": 40, "Blank": "  "});
        assert_eq!(json_i64(&v, "Year"), Some(1964));
        assert_eq!(json_i64(&v, "Number"), Some(40));
        assert_eq!(json_string(&v, "Code").as_deref(), Some("40"));
        assert_eq!(json_string(&v, "Blank"), None);
        assert_eq!(json_i64(&v, "Missing"), None);
    }

    #[test]
    fn dates_ignore_time_suffix() {
        let v = json!({"A": "2012-03-22T00:00:00", "B": "2012-03-22", "C": "n/a"});
        let expected = NaiveDate::from_ymd_opt(2012, 3, 22);
        assert_eq!(json_date(&v, "A"), expected);
        assert_eq!(json_date(&v, "B"), expected);
        assert_eq!(json_date(&v, "C"), None);
    }

    #[test]
    fn single_object_is_treated_as_one_entry_list() {
        let single = json!({"Code": "a"});
        let many = json!([{"Code": "a"}, {"Code": "b"}]);
        assert_eq!(one_or_many(Some(&single)).len(), 1);
        assert_eq!(one_or_many(Some(&many)).len(), 2);
        assert!(one_or_many(Some(&JsonValue::Null)).is_empty());
        assert!(one_or_many(None).is_empty());

        assert_eq!(list_under(&json!({"Docs": single}), "Docs").len(), 1);
        assert_eq!(list_under(&many, "Docs").len(), 2);
        assert!(list_under(&json!({"Other": 1}), "Docs").is_empty());
    }
}
