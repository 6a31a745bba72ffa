use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use lexrep_core::{
    Batch, BatchDraft, Collection, DocType, Document, DocumentVersion, Period, PeriodResult,
    SourceFailure,
};
use lexrep_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{json_date, json_i64, json_string, list_under, one_or_many, PeriodSource, ResponseFormat};

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    /// Opaque access token, passed through as the `apikey` query parameter.
    pub api_key: String,
    pub http: HttpClientConfig,
}

/// Client for the `data.{format}/{Method}` endpoints of the document API.
#[derive(Debug)]
pub struct ApiClient {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
}

/// Strip one level of `{"Result": ...}` nesting; anything else passes through.
pub fn unwrap_result_envelope(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(mut map) => match map.remove("Result") {
            Some(inner) => inner,
            None => JsonValue::Object(map),
        },
        other => other,
    }
}

/// Normalize one API document record. Records without a code are dropped.
pub fn document_from_api(
    value: &JsonValue,
    collection: &str,
    period: Option<Period>,
) -> Option<Document> {
    let code = json_string(value, "Code")?;
    let mut doc = Document::new(
        json_string(value, "Collection").unwrap_or_else(|| collection.to_string()),
        code,
    );
    doc.remote_id = json_i64(value, "DocId");
    doc.citation = json_string(value, "Quote");
    doc.period = json_i64(value, "Year").map(|y| y as Period).or(period);
    doc.number = json_i64(value, "Number");
    doc.title = json_string(value, "Title");
    doc.doc_type = json_string(value, "DocType");
    doc.declared_on = json_date(value, "DeclareDate");
    doc.published_on = json_date(value, "PublishDate");
    doc.effective_from = json_date(value, "EffectFrom");
    doc.effective_till = json_date(value, "EffectTill");
    doc.last_update = json_string(value, "LastUpdate");
    doc.href = json_string(value, "Href");
    Some(doc)
}

/// Normalize one batch record together with its documents. A batch without a
/// number takes its 1-based position in the period.
pub fn batch_draft_from_api(
    value: &JsonValue,
    collection: &str,
    period: Period,
    position: usize,
) -> BatchDraft {
    let batch = Batch {
        remote_id: json_i64(value, "BatchId"),
        collection: json_string(value, "Collection").unwrap_or_else(|| collection.to_string()),
        period: json_i64(value, "Year").map(|y| y as Period).unwrap_or(period),
        number: json_i64(value, "Number").unwrap_or(position as i64 + 1),
        code: json_string(value, "Code"),
        citation: json_string(value, "Quote"),
        published_on: json_date(value, "PublishDate"),
        href: json_string(value, "Href"),
        file: json_string(value, "File"),
    };
    let documents = one_or_many(value.get("Docs"))
        .into_iter()
        .filter_map(|doc| document_from_api(doc, &batch.collection, Some(batch.period)))
        .collect();
    BatchDraft { batch, documents }
}

fn failure_from_fetch(method: &str, err: FetchError) -> SourceFailure {
    match err {
        FetchError::Timeout { .. } => SourceFailure::Timeout {
            method: method.to_string(),
        },
        FetchError::Transport { .. } => SourceFailure::Transport {
            method: method.to_string(),
            message: err.to_string(),
        },
        FetchError::HttpStatus { status, .. } => SourceFailure::HttpStatus {
            method: method.to_string(),
            status,
        },
    }
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config.http)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn endpoint(&self, format: ResponseFormat, method: &str) -> String {
        format!("{}/data.{}/{}", self.base_url, format.as_str(), method)
    }

    async fn fetch_raw(
        &self,
        format: ResponseFormat,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<u8>, SourceFailure> {
        let mut query: Vec<(&str, String)> = params.to_vec();
        query.push(("apikey", self.api_key.clone()));
        let url = self.endpoint(format, method);
        match self.http.get(&url, &query).await {
            Ok(resp) => Ok(resp.body),
            Err(err) => {
                let failure = failure_from_fetch(method, err);
                warn!(method, error = %failure, "api call failed");
                Err(failure)
            }
        }
    }

    /// One JSON call with the `Result` envelope removed.
    async fn call(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, SourceFailure> {
        let body = self.fetch_raw(ResponseFormat::Json, method, params).await?;
        let value: JsonValue = serde_json::from_slice(&body).map_err(|err| {
            let failure = SourceFailure::Malformed {
                method: method.to_string(),
                message: err.to_string(),
            };
            warn!(method, error = %failure, "api response not decodable");
            failure
        })?;
        Ok(unwrap_result_envelope(value))
    }

    /// Document content in markup-tree encoding, returned as raw text.
    pub async fn document_markup(&self, collection: &str, code: &str) -> Result<String, SourceFailure> {
        let body = self
            .fetch_raw(
                ResponseFormat::Xml,
                "DocData",
                &[("Collection", collection.to_string()), ("Document", code.to_string())],
            )
            .await?;
        String::from_utf8(body).map_err(|err| SourceFailure::Malformed {
            method: "DocData".to_string(),
            message: err.to_string(),
        })
    }

    /// Document list of one period without batch structure.
    pub async fn period_document_list(
        &self,
        collection: &str,
        period: Period,
    ) -> Result<Vec<Document>, SourceFailure> {
        let result = self
            .call(
                "YearDocList",
                &[("Collection", collection.to_string()), ("Year", period.to_string())],
            )
            .await?;
        Ok(list_under(&result, "Docs")
            .into_iter()
            .filter_map(|doc| document_from_api(doc, collection, Some(period)))
            .collect())
    }
}

#[async_trait]
impl PeriodSource for ApiClient {
    fn source_id(&self) -> &'static str {
        "zakonyprolidi-api"
    }

    async fn fetch_period(&self, collection: &str, period: Period) -> PeriodResult {
        info!(collection, period, "fetching period");
        let result = match self
            .call(
                "Year",
                &[("Collection", collection.to_string()), ("Year", period.to_string())],
            )
            .await
        {
            Ok(result) => result,
            Err(failure) => return PeriodResult::failed(collection, period, failure),
        };

        let batches: Vec<_> = one_or_many(result.get("Batches"))
            .into_iter()
            .enumerate()
            .map(|(idx, batch)| batch_draft_from_api(batch, collection, period, idx))
            .collect();
        debug!(collection, period, batches = batches.len(), "period decoded");
        PeriodResult {
            batches,
            ..PeriodResult::empty(collection, period)
        }
    }

    async fn collections(&self) -> Result<Vec<Collection>, SourceFailure> {
        let result = self.call("CollectionList", &[]).await?;
        Ok(list_under(&result, "Collections")
            .into_iter()
            .filter_map(|c| {
                Some(Collection {
                    remote_id: json_i64(c, "CollectionId"),
                    code: json_string(c, "Code")?,
                    name: json_string(c, "Name"),
                    first_period: json_i64(c, "FirstYear").map(|y| y as Period),
                    last_period: json_i64(c, "LastYear").map(|y| y as Period),
                })
            })
            .collect())
    }

    async fn doc_types(&self) -> Result<Vec<DocType>, SourceFailure> {
        let result = self.call("DocTypeList", &[]).await?;
        Ok(list_under(&result, "DocTypes")
            .into_iter()
            .filter_map(|t| {
                let remote_id = json_i64(t, "DocTypeId");
                let code = json_string(t, "Code").or_else(|| remote_id.map(|id| id.to_string()))?;
                Some(DocType {
                    remote_id,
                    code,
                    name: json_string(t, "Name"),
                })
            })
            .collect())
    }

    async fn document_content(
        &self,
        collection: &str,
        code: &str,
    ) -> Result<Option<JsonValue>, SourceFailure> {
        let result = self
            .call(
                "DocData",
                &[("Collection", collection.to_string()), ("Document", code.to_string())],
            )
            .await?;
        Ok(match result {
            JsonValue::Null => None,
            JsonValue::Object(ref map) if map.is_empty() => None,
            other => Some(other),
        })
    }

    async fn document_versions(
        &self,
        collection: &str,
        code: &str,
    ) -> Result<Vec<DocumentVersion>, SourceFailure> {
        let result = self
            .call(
                "DocVersions",
                &[("Collection", collection.to_string()), ("Document", code.to_string())],
            )
            .await?;
        Ok(list_under(&result, "Versions")
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| DocumentVersion {
                collection: collection.to_string(),
                document_code: code.to_string(),
                version_number: json_i64(entry, "Version")
                    .or_else(|| json_i64(entry, "VersionNumber"))
                    .unwrap_or(idx as i64 + 1),
                effective_from: json_date(entry, "EffectFrom"),
                effective_till: json_date(entry, "EffectTill"),
                content: Some(entry.clone()),
            })
            .collect())
    }

    async fn publish_list(
        &self,
        collection: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Document>, SourceFailure> {
        let result = self
            .call(
                "PublishList",
                &[
                    ("Collection", collection.to_string()),
                    ("DateFrom", from.format("%Y-%m-%d").to_string()),
                    ("DateTo", to.format("%Y-%m-%d").to_string()),
                ],
            )
            .await?;
        Ok(list_under(&result, "Docs")
            .into_iter()
            .filter_map(|doc| {
                let period = json_date(doc, "PublishDate").map(|d| d.year());
                document_from_api(doc, collection, period)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_is_unwrapped_once_and_only_when_present() {
        let wrapped = json!({"Version": 1, "Base": "x", "Result": {"Result": 5}});
        assert_eq!(unwrap_result_envelope(wrapped), json!({"Result": 5}));

        let bare = json!({"Collections": []});
        assert_eq!(unwrap_result_envelope(bare.clone()), bare);
        assert_eq!(unwrap_result_envelope(json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn batch_with_single_doc_object_is_normalized() {
        let raw = json!({
            "BatchId": 77,
            "Number": 19,
            "Code": "1964-19",
            "Quote": "Částka 19/1964",
            "PublishDate": "1964-03-05T00:00:00",
            "Docs": {
                "DocId": 1001,
                "Code": "1964-40",
                "Number": 40,
                "Quote": "40/1964 Sb.",
                "Title": "Občanský zákoník",
                "DocType": 4,
                "EffectFrom": "1964-04-01",
                "Href": "/cs/1964-40"
            }
        });
        let draft = batch_draft_from_api(&raw, "cs", 1964, 0);
        assert_eq!(draft.batch.number, 19);
        assert_eq!(draft.batch.period, 1964);
        assert_eq!(draft.batch.published_on, NaiveDate::from_ymd_opt(1964, 3, 5));
        assert_eq!(draft.documents.len(), 1);

        let doc = &draft.documents[0];
        assert_eq!(doc.collection, "cs");
        assert_eq!(doc.code, "1964-40");
        assert_eq!(doc.period, Some(1964));
        assert_eq!(doc.doc_type.as_deref(), Some("4"));
        assert!(doc.is_in_force());
    }

    #[test]
    fn batch_without_number_uses_position_and_skips_codeless_docs() {
        let raw = json!({"Docs": [{"Title": "no code"}, {"Code": "2012-89"}]});
        let draft = batch_draft_from_api(&raw, "cs", 2012, 2);
        assert_eq!(draft.batch.number, 3);
        assert_eq!(draft.documents.len(), 1);
        assert_eq!(draft.documents[0].period, Some(2012));
    }

    #[test]
    fn fetch_errors_map_to_source_failures() {
        let failure = failure_from_fetch(
            "Year",
            FetchError::HttpStatus {
                status: 503,
                url: "http://x".into(),
            },
        );
        assert_eq!(
            failure,
            SourceFailure::HttpStatus {
                method: "Year".into(),
                status: 503
            }
        );
        let failure = failure_from_fetch("DocData", FetchError::Timeout { url: "http://x".into() });
        assert_eq!(failure.method(), "DocData");
    }
}
