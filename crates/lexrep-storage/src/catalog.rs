use std::path::Path;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use lexrep_core::{
    content_preview, fragment_count, Document, DocumentDetail, DocumentSummary, Period, Statistics,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::store::{document_from_row, load_statistics, DOCUMENT_COLUMNS};
use crate::{Store, StoreError};

pub const DEFAULT_PREVIEW_FRAGMENTS: usize = 10;
pub const DEFAULT_PREVIEW_CHARS: usize = 100;

/// Query façade over the replica. Issues reads only.
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

/// Selection used by batch download jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCriteria {
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    /// Only documents published within the last N days.
    #[serde(default)]
    pub days_old: Option<i64>,
    #[serde(default)]
    pub doc_type: Option<String>,
    #[serde(default, alias = "year")]
    pub period: Option<Period>,
    #[serde(default = "default_max_docs")]
    pub max_docs: u32,
}

fn default_max_docs() -> u32 {
    100
}

impl Default for DocumentCriteria {
    fn default() -> Self {
        Self {
            date_from: None,
            date_to: None,
            days_old: None,
            doc_type: None,
            period: None,
            max_docs: default_max_docs(),
        }
    }
}

impl Catalog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        // Never creates the file; a missing replica is an error for readers.
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .busy_timeout(std::time::Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_store(store: &Store) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    /// Case-insensitive (ASCII) substring match on titles, newest period first.
    pub async fn search_by_title(
        &self,
        keyword: &str,
        limit: u32,
    ) -> Result<Vec<DocumentSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT collection, code, citation, title, period, number, doc_type
              FROM documents
             WHERE title LIKE ?
             ORDER BY period DESC, number
             LIMIT ?
            "#,
        )
        .bind(format!("%{keyword}%"))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(summary_from_row).collect()
    }

    pub async fn list_by_period(
        &self,
        period: Period,
        doc_type: Option<&str>,
    ) -> Result<Vec<DocumentSummary>, StoreError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT collection, code, citation, title, period, number, doc_type FROM documents WHERE period = ",
        );
        query.push_bind(period);
        if let Some(doc_type) = doc_type {
            query.push(" AND doc_type = ").push_bind(doc_type);
        }
        query.push(" ORDER BY number");
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(summary_from_row).collect()
    }

    /// First document carrying `code`, across collections.
    pub async fn document(&self, code: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE code = ? ORDER BY collection LIMIT 1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn document_detail(
        &self,
        code: &str,
        preview_fragments: usize,
        preview_chars: usize,
    ) -> Result<Option<DocumentDetail>, StoreError> {
        let Some(document) = self.document(code).await? else {
            return Ok(None);
        };
        let (count, preview) = match &document.content {
            Some(content) => (
                fragment_count(content),
                content_preview(content, preview_fragments, preview_chars),
            ),
            None => (0, Vec::new()),
        };
        Ok(Some(DocumentDetail {
            document,
            fragment_count: count,
            content_preview: preview,
        }))
    }

    pub async fn statistics(&self) -> Result<Statistics, StoreError> {
        load_statistics(&self.pool).await
    }

    /// Documents selected by `criteria`, most recently published first.
    pub async fn documents_matching(
        &self,
        criteria: &DocumentCriteria,
    ) -> Result<Vec<Document>, StoreError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE 1 = 1"));
        if let Some(from) = criteria.date_from {
            query.push(" AND published_on >= ").push_bind(from);
        }
        if let Some(to) = criteria.date_to {
            query.push(" AND published_on <= ").push_bind(to);
        }
        if let Some(days) = criteria.days_old {
            let since = Utc::now().date_naive() - ChronoDuration::days(days.max(0));
            query.push(" AND published_on >= ").push_bind(since);
        }
        if let Some(doc_type) = &criteria.doc_type {
            query.push(" AND doc_type = ").push_bind(doc_type.clone());
        }
        if let Some(period) = criteria.period {
            query.push(" AND period = ").push_bind(period);
        }
        query
            .push(" ORDER BY published_on DESC, code LIMIT ")
            .push_bind(i64::from(criteria.max_docs));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn summary_from_row(row: &SqliteRow) -> Result<DocumentSummary, StoreError> {
    let period: Option<i64> = row.try_get("period")?;
    Ok(DocumentSummary {
        collection: row.try_get("collection")?,
        code: row.try_get("code")?,
        citation: row.try_get("citation")?,
        title: row.try_get("title")?,
        period: period.map(|p| p as Period),
        number: row.try_get("number")?,
        doc_type: row.try_get("doc_type")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn seeded() -> (tempfile::TempDir, Store) {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("replica.db")).await.unwrap();
        let rows = [
            ("1964-40", 1964, 40, "Občanský zákoník", "4", (1964, 3, 5)),
            ("2012-89", 2012, 89, "Občanský zákoník", "4", (2012, 3, 22)),
            ("2012-90", 2012, 90, "Zákon o obchodních korporacích", "4", (2012, 3, 22)),
            ("2012-91", 2012, 91, "Vyhláška o rozpočtové skladbě", "2", (2012, 3, 23)),
            ("2006-262", 2006, 262, "Zákoník práce", "4", (2006, 5, 26)),
        ];
        for (code, period, number, title, doc_type, (y, m, d)) in rows {
            store
                .upsert_document(&Document {
                    period: Some(period),
                    number: Some(number),
                    title: Some(title.into()),
                    doc_type: Some(doc_type.into()),
                    citation: Some(format!("{number}/{period} Sb.")),
                    published_on: NaiveDate::from_ymd_opt(y, m, d),
                    ..Document::new("cs", code)
                })
                .await
                .unwrap();
        }
        (dir, store)
    }

    #[tokio::test]
    async fn title_search_orders_newest_period_first() {
        let (_dir, store) = seeded().await;
        let catalog = Catalog::from_store(&store);
        let hits = catalog.search_by_title("zákoník", 50).await.unwrap();
        let codes: Vec<_> = hits.iter().map(|h| h.code.as_str()).collect();
        assert_eq!(codes, vec!["2012-89", "2006-262", "1964-40"]);

        assert!(catalog.search_by_title("neexistuje", 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn period_listing_filters_by_doc_type() {
        let (_dir, store) = seeded().await;
        let catalog = Catalog::from_store(&store);
        assert_eq!(catalog.list_by_period(2012, None).await.unwrap().len(), 3);
        let decrees = catalog.list_by_period(2012, Some("2")).await.unwrap();
        assert_eq!(decrees.len(), 1);
        assert_eq!(decrees[0].code, "2012-91");
        assert!(catalog.list_by_period(1918, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn detail_builds_preview_and_misses_cleanly() {
        let (_dir, store) = seeded().await;
        let content = json!({
            "Fragments": (0..12)
                .map(|i| json!({"Content": format!("{i}: {}", "x".repeat(150))}))
                .collect::<Vec<_>>()
        });
        assert!(store
            .set_document_content("cs", "2012-89", &content)
            .await
            .unwrap());

        let catalog = Catalog::from_store(&store);
        let detail = catalog
            .document_detail("2012-89", DEFAULT_PREVIEW_FRAGMENTS, DEFAULT_PREVIEW_CHARS)
            .await
            .unwrap()
            .expect("detail");
        assert_eq!(detail.fragment_count, 12);
        assert_eq!(detail.content_preview.len(), 10);
        assert!(detail
            .content_preview
            .iter()
            .all(|p| p.chars().count() == 100));

        let bare = catalog
            .document_detail("1964-40", DEFAULT_PREVIEW_FRAGMENTS, DEFAULT_PREVIEW_CHARS)
            .await
            .unwrap()
            .expect("detail");
        assert_eq!(bare.fragment_count, 0);
        assert!(bare.content_preview.is_empty());

        assert!(catalog
            .document_detail("9999-1", 10, 100)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn criteria_select_by_range_type_and_limit() {
        let (_dir, store) = seeded().await;
        let catalog = Catalog::from_store(&store);

        let in_2012 = catalog
            .documents_matching(&DocumentCriteria {
                date_from: NaiveDate::from_ymd_opt(2012, 1, 1),
                date_to: NaiveDate::from_ymd_opt(2012, 12, 31),
                ..Default::default()
            })
            .await
            .unwrap();
        let codes: Vec<_> = in_2012.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["2012-91", "2012-89", "2012-90"]);

        let laws = catalog
            .documents_matching(&DocumentCriteria {
                doc_type: Some("4".into()),
                max_docs: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(laws.len(), 2);
        assert_eq!(laws[0].code, "2012-89");

        let by_year = catalog
            .documents_matching(&DocumentCriteria {
                period: Some(1964),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_year.len(), 1);
    }

    #[test]
    fn criteria_accept_year_alias_and_default_limit() {
        let criteria: DocumentCriteria =
            serde_json::from_value(json!({"year": 2012, "doc_type": "4"})).unwrap();
        assert_eq!(criteria.period, Some(2012));
        assert_eq!(criteria.max_docs, 100);
    }

    #[tokio::test]
    async fn read_only_catalog_sees_committed_rows() {
        let (dir, store) = seeded().await;
        store.close().await;
        let catalog = Catalog::open(dir.path().join("replica.db")).await.unwrap();
        assert_eq!(catalog.statistics().await.unwrap().total_documents, 5);
    }
}
