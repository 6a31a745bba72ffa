use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use lexrep_core::{Batch, Collection, DocType, Document, DocumentVersion, Period, Statistics};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info};

use crate::StoreError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS collections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        remote_id INTEGER,
        code TEXT NOT NULL UNIQUE,
        name TEXT,
        first_period INTEGER,
        last_period INTEGER,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS doc_types (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        remote_id INTEGER,
        code TEXT NOT NULL UNIQUE,
        name TEXT,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        remote_id INTEGER,
        collection TEXT NOT NULL,
        code TEXT NOT NULL,
        citation TEXT,
        period INTEGER,
        number INTEGER,
        title TEXT,
        doc_type TEXT,
        declared_on TEXT,
        published_on TEXT,
        effective_from TEXT,
        effective_till TEXT,
        last_update TEXT,
        href TEXT,
        content_json TEXT,
        content_html TEXT,
        tags TEXT,
        ingested_at TEXT NOT NULL,
        UNIQUE(collection, code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL REFERENCES documents(id),
        version_number INTEGER NOT NULL,
        effective_from TEXT,
        effective_till TEXT,
        content_json TEXT,
        recorded_at TEXT NOT NULL,
        UNIQUE(document_id, version_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        remote_id INTEGER,
        collection TEXT NOT NULL,
        period INTEGER NOT NULL,
        number INTEGER NOT NULL,
        code TEXT,
        citation TEXT,
        published_on TEXT,
        href TEXT,
        file TEXT,
        updated_at TEXT NOT NULL,
        UNIQUE(collection, period, number)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection)",
    "CREATE INDEX IF NOT EXISTS idx_documents_period ON documents(period)",
    "CREATE INDEX IF NOT EXISTS idx_documents_code ON documents(code)",
    "CREATE INDEX IF NOT EXISTS idx_documents_effective_from ON documents(effective_from)",
];

/// Owner of every persisted row. Each write is its own statement and commits
/// on its own; nothing here retries.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the store at `path` and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.display(), "store ready");
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent; safe on every startup.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn upsert_collection(&self, collection: &Collection) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO collections (remote_id, code, name, first_period, last_period, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(code) DO UPDATE SET
                remote_id = excluded.remote_id,
                name = excluded.name,
                first_period = excluded.first_period,
                last_period = excluded.last_period,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection.remote_id)
        .bind(&collection.code)
        .bind(&collection.name)
        .bind(collection.first_period)
        .bind(collection.last_period)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_doc_type(&self, doc_type: &DocType) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO doc_types (remote_id, code, name, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(code) DO UPDATE SET
                remote_id = excluded.remote_id,
                name = excluded.name,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(doc_type.remote_id)
        .bind(&doc_type.code)
        .bind(&doc_type.name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or overwrite the core fields of `(collection, code)`.
    ///
    /// The raw snapshot and tag columns belong to the scraper and the indexer
    /// and are never touched here; a missing structured payload keeps the
    /// stored one.
    pub async fn upsert_document(&self, doc: &Document) -> Result<(), StoreError> {
        let content_json = doc.content.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO documents (
                remote_id, collection, code, citation, period, number, title, doc_type,
                declared_on, published_on, effective_from, effective_till, last_update,
                href, content_json, ingested_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, code) DO UPDATE SET
                remote_id = excluded.remote_id,
                citation = excluded.citation,
                period = excluded.period,
                number = excluded.number,
                title = excluded.title,
                doc_type = excluded.doc_type,
                declared_on = excluded.declared_on,
                published_on = excluded.published_on,
                effective_from = excluded.effective_from,
                effective_till = excluded.effective_till,
                last_update = excluded.last_update,
                href = excluded.href,
                content_json = COALESCE(excluded.content_json, documents.content_json),
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(doc.remote_id)
        .bind(&doc.collection)
        .bind(&doc.code)
        .bind(&doc.citation)
        .bind(doc.period)
        .bind(doc.number)
        .bind(&doc.title)
        .bind(&doc.doc_type)
        .bind(doc.declared_on)
        .bind(doc.published_on)
        .bind(doc.effective_from)
        .bind(doc.effective_till)
        .bind(&doc.last_update)
        .bind(&doc.href)
        .bind(content_json)
        .bind(doc.ingested_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO batches (
                remote_id, collection, period, number, code, citation, published_on, href, file, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, period, number) DO UPDATE SET
                remote_id = excluded.remote_id,
                code = excluded.code,
                citation = excluded.citation,
                published_on = excluded.published_on,
                href = excluded.href,
                file = excluded.file,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(batch.remote_id)
        .bind(&batch.collection)
        .bind(batch.period)
        .bind(batch.number)
        .bind(&batch.code)
        .bind(&batch.citation)
        .bind(batch.published_on)
        .bind(&batch.href)
        .bind(&batch.file)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a revision. Returns `false` when the version already exists or
    /// the owning document has no row; existing revisions are never rewritten.
    pub async fn append_document_version(
        &self,
        version: &DocumentVersion,
    ) -> Result<bool, StoreError> {
        let content_json = version
            .content
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO document_versions (
                document_id, version_number, effective_from, effective_till, content_json, recorded_at
            )
            SELECT id, ?, ?, ?, ?, ?
              FROM documents
             WHERE collection = ? AND code = ?
            "#,
        )
        .bind(version.version_number)
        .bind(version.effective_from)
        .bind(version.effective_till)
        .bind(content_json)
        .bind(Utc::now())
        .bind(&version.collection)
        .bind(&version.document_code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store the structured payload of an existing document. Never creates rows.
    pub async fn set_document_content(
        &self,
        collection: &str,
        code: &str,
        content: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let content_json = serde_json::to_string(content)?;
        let result =
            sqlx::query("UPDATE documents SET content_json = ? WHERE collection = ? AND code = ?")
                .bind(content_json)
                .bind(collection)
                .bind(code)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Merge HTML-derived markup into an existing document. Unknown codes are
    /// skipped and reported as `false`.
    pub async fn merge_raw_snapshot(
        &self,
        collection: &str,
        code: &str,
        raw_markup: &str,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE documents SET content_html = ? WHERE collection = ? AND code = ?")
                .bind(raw_markup)
                .bind(collection)
                .bind(code)
                .execute(&self.pool)
                .await?;
        let merged = result.rows_affected() > 0;
        if !merged {
            debug!(collection, code, "no document row for scraped markup");
        }
        Ok(merged)
    }

    pub async fn set_tags(
        &self,
        collection: &str,
        code: &str,
        tags: &[String],
    ) -> Result<bool, StoreError> {
        let tags_json = serde_json::to_string(tags)?;
        let result = sqlx::query("UPDATE documents SET tags = ? WHERE collection = ? AND code = ?")
            .bind(tags_json)
            .bind(collection)
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn document(
        &self,
        collection: &str,
        code: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection = ? AND code = ?"
        ))
        .bind(collection)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    /// Periods of `collection` with at least one ingested document.
    pub async fn covered_periods(&self, collection: &str) -> Result<BTreeSet<Period>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT period FROM documents WHERE collection = ? AND period IS NOT NULL",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("period").map(|p| p as Period))
            .collect::<Result<_, _>>()
            .map_err(StoreError::from)
    }

    pub async fn statistics(&self) -> Result<Statistics, StoreError> {
        load_statistics(&self.pool).await
    }

    /// Release every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) const DOCUMENT_COLUMNS: &str = "remote_id, collection, code, citation, period, number, \
     title, doc_type, declared_on, published_on, effective_from, effective_till, last_update, \
     href, content_json, content_html, tags, ingested_at";

pub(crate) fn document_from_row(row: &SqliteRow) -> Result<Document, StoreError> {
    let content_json: Option<String> = row.try_get("content_json")?;
    let tags_json: Option<String> = row.try_get("tags")?;
    let period: Option<i64> = row.try_get("period")?;
    Ok(Document {
        remote_id: row.try_get("remote_id")?,
        collection: row.try_get("collection")?,
        code: row.try_get("code")?,
        citation: row.try_get("citation")?,
        period: period.map(|p| p as Period),
        number: row.try_get("number")?,
        title: row.try_get("title")?,
        doc_type: row.try_get("doc_type")?,
        declared_on: row.try_get::<Option<NaiveDate>, _>("declared_on")?,
        published_on: row.try_get::<Option<NaiveDate>, _>("published_on")?,
        effective_from: row.try_get::<Option<NaiveDate>, _>("effective_from")?,
        effective_till: row.try_get::<Option<NaiveDate>, _>("effective_till")?,
        last_update: row.try_get("last_update")?,
        href: row.try_get("href")?,
        content: content_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        raw_snapshot: row.try_get("content_html")?,
        tags: tags_json.as_deref().map(serde_json::from_str).transpose()?,
        ingested_at: row.try_get::<Option<DateTime<Utc>>, _>("ingested_at")?,
    })
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<u64, StoreError> {
    let n: i64 = sqlx::query(sql).fetch_one(pool).await?.try_get("n")?;
    Ok(n.max(0) as u64)
}

pub(crate) async fn load_statistics(pool: &SqlitePool) -> Result<Statistics, StoreError> {
    let mut stats = Statistics {
        total_collections: count(pool, "SELECT COUNT(*) AS n FROM collections").await?,
        total_doc_types: count(pool, "SELECT COUNT(*) AS n FROM doc_types").await?,
        total_documents: count(pool, "SELECT COUNT(*) AS n FROM documents").await?,
        total_batches: count(pool, "SELECT COUNT(*) AS n FROM batches").await?,
        with_full_content: count(
            pool,
            "SELECT COUNT(*) AS n FROM documents WHERE content_json IS NOT NULL",
        )
        .await?,
        tagged_documents: count(pool, "SELECT COUNT(*) AS n FROM documents WHERE tags IS NOT NULL")
            .await?,
        ..Statistics::default()
    };

    let span = sqlx::query("SELECT MIN(period) AS first, MAX(period) AS last FROM documents")
        .fetch_one(pool)
        .await?;
    stats.first_period = span.try_get::<Option<i64>, _>("first")?.map(|p| p as Period);
    stats.last_period = span.try_get::<Option<i64>, _>("last")?.map(|p| p as Period);

    let rows = sqlx::query(
        "SELECT COALESCE(doc_type, '(unknown)') AS key, COUNT(*) AS n FROM documents GROUP BY key",
    )
    .fetch_all(pool)
    .await?;
    stats.by_type = grouped(&rows)?;

    let rows = sqlx::query(
        "SELECT collection AS key, COUNT(*) AS n FROM documents GROUP BY collection",
    )
    .fetch_all(pool)
    .await?;
    stats.by_collection = grouped(&rows)?;

    let rows = sqlx::query(
        "SELECT period, COUNT(*) AS n FROM documents WHERE period IS NOT NULL GROUP BY period",
    )
    .fetch_all(pool)
    .await?;
    let mut by_period = BTreeMap::new();
    for row in &rows {
        let period: i64 = row.try_get("period")?;
        let n: i64 = row.try_get("n")?;
        by_period.insert(period as Period, n as u64);
    }
    stats.by_period = by_period;

    Ok(stats)
}

fn grouped(rows: &[SqliteRow]) -> Result<BTreeMap<String, u64>, StoreError> {
    let mut out = BTreeMap::new();
    for row in rows {
        let key: String = row.try_get("key")?;
        let n: i64 = row.try_get("n")?;
        out.insert(key, n as u64);
    }
    Ok(out)
}
