use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use lexrep_adapters::{code_from_url, ApiClient, HtmlFetcher, PageSource, PeriodSource};
use lexrep_core::{Period, PeriodResult, SourceFailure};
use lexrep_storage::Store;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncConfig;

/// Periods the `test` access token is known to return data for.
pub const TEST_PERIODS: [Period; 2] = [1964, 2012];

/// Documents whose full content the `test` token exposes.
pub const TEST_DOCUMENTS: [&str; 6] = [
    "1964-40", "2000-121", "2011-1", "2002-307", "2012-89", "2006-262",
];

/// Cooperative stop flag, checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    Unknown,
    Remaining(Duration),
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Unknown => f.write_str("unknown"),
            Eta::Remaining(left) => {
                let secs = left.as_secs();
                write!(f, "{}h {}m", secs / 3600, (secs % 3600) / 60)
            }
        }
    }
}

/// `(elapsed / done) * (total - done)`; unknown until at least one unit is done.
pub fn estimate_remaining(total: usize, done: usize, elapsed: Duration) -> Eta {
    if done == 0 {
        return Eta::Unknown;
    }
    let left = total.saturating_sub(done) as u32;
    Eta::Remaining(elapsed / done as u32 * left)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Coverage {
    Ingested { batches: usize },
    /// Valid response without batches.
    Gap,
    SourceUnavailable { failure: SourceFailure },
}

impl Coverage {
    pub fn log_message(&self) -> &'static str {
        match self {
            Coverage::Ingested { .. } => "period ingested",
            Coverage::Gap => {
                "no data for period with the current access token; run the HTML fallback (scrape mode) for it"
            }
            Coverage::SourceUnavailable { .. } => {
                "remote source unavailable for period; it stays pending for the next run"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodOutcome {
    pub period: Period,
    pub documents: usize,
    pub coverage: Coverage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodFailure {
    pub period: Period,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeReport {
    pub run_id: Uuid,
    pub collection: String,
    pub requested: Vec<Period>,
    pub ingested: Vec<Period>,
    pub gaps: Vec<Period>,
    pub failures: Vec<PeriodFailure>,
    pub documents: usize,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl RangeReport {
    fn new(collection: &str, requested: Vec<Period>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            collection: collection.to_string(),
            requested,
            ingested: Vec::new(),
            gaps: Vec::new(),
            failures: Vec::new(),
            documents: 0,
            elapsed: Duration::ZERO,
            interrupted: false,
        }
    }

    pub fn processed(&self) -> usize {
        self.ingested.len() + self.gaps.len() + self.failures.len()
    }

    pub fn failed_periods(&self) -> Vec<Period> {
        self.failures.iter().map(|f| f.period).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub target: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeReport {
    pub discovered: usize,
    pub merged: usize,
    /// Codes with no existing document row; their markup was discarded.
    pub skipped_unknown: Vec<String>,
    pub failures: Vec<DocumentFailure>,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetadataSummary {
    pub collections: usize,
    pub doc_types: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestDataReport {
    pub metadata: MetadataSummary,
    pub periods: Vec<PeriodOutcome>,
    pub contents_stored: usize,
    pub failures: Vec<DocumentFailure>,
}

fn source_error(failure: SourceFailure) -> anyhow::Error {
    anyhow!("{failure}")
}

/// Drives ingestion from the structured source into the store, and the
/// separate HTML merge. Every remote call and write is awaited before the
/// next one starts.
pub struct SyncPipeline {
    store: Store,
    api: Arc<dyn PeriodSource>,
    pages: Arc<dyn PageSource>,
    period_pacing: Duration,
    stop: StopSignal,
}

impl SyncPipeline {
    pub fn new(
        store: Store,
        api: Arc<dyn PeriodSource>,
        pages: Arc<dyn PageSource>,
        period_pacing: Duration,
    ) -> Self {
        Self {
            store,
            api,
            pages,
            period_pacing,
            stop: StopSignal::new(),
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = Store::open(&config.db_path)
            .await
            .with_context(|| format!("opening store {}", config.db_path.display()))?;
        let api = ApiClient::new(config.api_client_config()).context("building api client")?;
        let pages = HtmlFetcher::new(config.html_fetcher_config()).context("building html fetcher")?;
        Ok(Self::new(
            store,
            Arc::new(api),
            Arc::new(pages),
            config.period_pacing,
        ))
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pages(&self) -> Arc<dyn PageSource> {
        Arc::clone(&self.pages)
    }

    pub async fn sync_metadata(&self) -> Result<MetadataSummary> {
        let mut summary = MetadataSummary::default();
        match self.api.collections().await {
            Ok(collections) => {
                for collection in &collections {
                    self.store
                        .upsert_collection(collection)
                        .await
                        .with_context(|| format!("storing collection {}", collection.code))?;
                    info!(code = %collection.code, name = ?collection.name, "collection stored");
                }
                summary.collections = collections.len();
            }
            Err(failure) => warn!(error = %failure, "collection list unavailable"),
        }
        match self.api.doc_types().await {
            Ok(doc_types) => {
                for doc_type in &doc_types {
                    self.store
                        .upsert_doc_type(doc_type)
                        .await
                        .with_context(|| format!("storing doc type {}", doc_type.code))?;
                }
                summary.doc_types = doc_types.len();
            }
            Err(failure) => warn!(error = %failure, "doc type list unavailable"),
        }
        info!(
            collections = summary.collections,
            doc_types = summary.doc_types,
            "metadata synced"
        );
        Ok(summary)
    }

    /// Ingest one period from the structured source. Never falls back to HTML.
    pub async fn sync_period(&self, collection: &str, period: Period) -> Result<PeriodOutcome> {
        let result = self.api.fetch_period(collection, period).await;
        let outcome = self.ingest(result).await?;
        match &outcome.coverage {
            Coverage::Ingested { batches } => info!(
                collection,
                period,
                batches,
                documents = outcome.documents,
                "{}",
                outcome.coverage.log_message()
            ),
            Coverage::Gap => info!(collection, period, "{}", outcome.coverage.log_message()),
            Coverage::SourceUnavailable { failure } => warn!(
                collection,
                period,
                method = failure.method(),
                error = %failure,
                "{}",
                outcome.coverage.log_message()
            ),
        }
        Ok(outcome)
    }

    async fn ingest(&self, result: PeriodResult) -> Result<PeriodOutcome> {
        let period = result.period;
        if let Some(failure) = result.failure {
            return Ok(PeriodOutcome {
                period,
                documents: 0,
                coverage: Coverage::SourceUnavailable { failure },
            });
        }
        if result.batches.is_empty() {
            return Ok(PeriodOutcome {
                period,
                documents: 0,
                coverage: Coverage::Gap,
            });
        }

        let batches = result.batches.len();
        let mut documents = 0usize;
        for draft in &result.batches {
            self.store.upsert_batch(&draft.batch).await.with_context(|| {
                format!("storing batch {}/{}", draft.batch.number, draft.batch.period)
            })?;
            for doc in &draft.documents {
                self.store
                    .upsert_document(doc)
                    .await
                    .with_context(|| format!("storing document {}", doc.code))?;
                documents += 1;
            }
        }
        Ok(PeriodOutcome {
            period,
            documents,
            coverage: Coverage::Ingested { batches },
        })
    }

    /// Every period from `start` to `end`, ascending, covered or not.
    pub async fn sync_period_range(
        &self,
        collection: &str,
        start: Period,
        end: Period,
    ) -> Result<RangeReport> {
        self.run_periods(collection, (start..=end).collect()).await
    }

    /// Requested periods without any ingested document yet.
    pub async fn remaining_periods(
        &self,
        collection: &str,
        start: Period,
        end: Period,
    ) -> Result<Vec<Period>> {
        let covered = self
            .store
            .covered_periods(collection)
            .await
            .context("reading covered periods")?;
        Ok((start..=end).filter(|p| !covered.contains(p)).collect())
    }

    /// Like [`Self::sync_period_range`] but skipping periods the store already covers.
    pub async fn resume_range(
        &self,
        collection: &str,
        start: Period,
        end: Period,
    ) -> Result<RangeReport> {
        let remaining = self.remaining_periods(collection, start, end).await?;
        info!(
            collection,
            start,
            end,
            remaining = remaining.len(),
            "resuming range"
        );
        self.run_periods(collection, remaining).await
    }

    async fn run_periods(&self, collection: &str, periods: Vec<Period>) -> Result<RangeReport> {
        let mut report = RangeReport::new(collection, periods.clone());
        let span = info_span!("period_range", run_id = %report.run_id, collection);
        async {
            let started = Instant::now();
            let total = periods.len();
            for (idx, period) in periods.into_iter().enumerate() {
                if self.stop.is_stopped() {
                    report.interrupted = true;
                    warn!(period, "stop requested; leaving remaining periods pending");
                    break;
                }
                if idx > 0 && !self.period_pacing.is_zero() {
                    tokio::time::sleep(self.period_pacing).await;
                }

                match self.sync_period(collection, period).await {
                    Ok(outcome) => {
                        report.documents += outcome.documents;
                        match outcome.coverage {
                            Coverage::Ingested { .. } => report.ingested.push(period),
                            Coverage::Gap => report.gaps.push(period),
                            Coverage::SourceUnavailable { failure } => {
                                report.failures.push(PeriodFailure {
                                    period,
                                    reason: failure.to_string(),
                                })
                            }
                        }
                    }
                    Err(err) => {
                        error!(period, error = %format!("{err:#}"), "period failed");
                        report.failures.push(PeriodFailure {
                            period,
                            reason: format!("{err:#}"),
                        });
                    }
                }

                let done = idx + 1;
                let eta = estimate_remaining(total, done, started.elapsed());
                info!(
                    "[{done}/{total}] period {period}: {} documents so far, ETA {eta}",
                    report.documents
                );
            }
            report.elapsed = started.elapsed();
            info!(
                ingested = report.ingested.len(),
                gaps = report.gaps.len(),
                failed = report.failures.len(),
                documents = report.documents,
                elapsed_secs = report.elapsed.as_secs(),
                interrupted = report.interrupted,
                "range finished"
            );
        }
        .instrument(span)
        .await;
        Ok(report)
    }

    /// Discover document pages for the range and merge their markup into
    /// existing documents. Never creates document rows.
    pub async fn scrape_range(
        &self,
        collection: &str,
        start: Period,
        end: Period,
    ) -> Result<ScrapeReport> {
        let links = self.pages.list_document_links(collection, start..=end).await;
        let mut report = ScrapeReport {
            discovered: links.len(),
            ..ScrapeReport::default()
        };
        info!(collection, start, end, discovered = links.len(), "document links discovered");

        for (idx, url) in links.iter().enumerate() {
            if self.stop.is_stopped() {
                report.interrupted = true;
                warn!(url = %url, "stop requested; scrape halted");
                break;
            }
            let Some(code) = code_from_url(url) else {
                report.failures.push(DocumentFailure {
                    target: url.clone(),
                    reason: "no document code in url".to_string(),
                });
                continue;
            };

            match self.pages.fetch_document(url).await {
                Ok(page) if page.has_content() => {
                    let merged = self
                        .store
                        .merge_raw_snapshot(collection, code, &page.raw_markup)
                        .await
                        .with_context(|| format!("merging markup for {code}"))?;
                    if merged {
                        report.merged += 1;
                    } else {
                        report.skipped_unknown.push(code.to_string());
                    }
                }
                Ok(_) => report.failures.push(DocumentFailure {
                    target: url.clone(),
                    reason: "main content region missing".to_string(),
                }),
                Err(err) => {
                    warn!(url = %url, error = %err, "document page failed");
                    report.failures.push(DocumentFailure {
                        target: url.clone(),
                        reason: err.to_string(),
                    });
                }
            }

            if (idx + 1) % 10 == 0 {
                info!("scraped {}/{} documents", idx + 1, links.len());
            }
        }

        info!(
            merged = report.merged,
            skipped = report.skipped_unknown.len(),
            failed = report.failures.len(),
            "scrape finished"
        );
        Ok(report)
    }

    /// Fetch and store the structured payload of an existing document.
    pub async fn download_document_content(&self, collection: &str, code: &str) -> Result<bool> {
        let content = self
            .api
            .document_content(collection, code)
            .await
            .map_err(source_error)?;
        let Some(content) = content else {
            info!(collection, code, "no content available");
            return Ok(false);
        };
        let stored = self
            .store
            .set_document_content(collection, code, &content)
            .await
            .with_context(|| format!("storing content of {code}"))?;
        if !stored {
            warn!(collection, code, "content fetched for a document that is not in the store");
        }
        Ok(stored)
    }

    /// Append the remote revision list of a document; returns how many were new.
    pub async fn sync_document_versions(&self, collection: &str, code: &str) -> Result<usize> {
        let versions = self
            .api
            .document_versions(collection, code)
            .await
            .map_err(source_error)?;
        let mut appended = 0;
        for version in &versions {
            if self
                .store
                .append_document_version(version)
                .await
                .with_context(|| format!("storing version {} of {code}", version.version_number))?
            {
                appended += 1;
            }
        }
        info!(collection, code, listed = versions.len(), appended, "versions synced");
        Ok(appended)
    }

    /// Upsert every document published between `from` and `to`.
    pub async fn sync_published(
        &self,
        collection: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<usize> {
        let docs = self
            .api
            .publish_list(collection, from, to)
            .await
            .map_err(source_error)?;
        for doc in &docs {
            self.store
                .upsert_document(doc)
                .await
                .with_context(|| format!("storing document {}", doc.code))?;
        }
        info!(collection, %from, %to, documents = docs.len(), "publish list synced");
        Ok(docs.len())
    }

    /// Everything the `test` token can reach: metadata, the two open periods
    /// and the full content of the documented sample documents.
    pub async fn sync_test_data(&self, collection: &str) -> Result<TestDataReport> {
        let metadata = self.sync_metadata().await?;

        let mut periods = Vec::new();
        for period in TEST_PERIODS {
            if self.stop.is_stopped() {
                break;
            }
            periods.push(self.sync_period(collection, period).await?);
            if !self.period_pacing.is_zero() {
                tokio::time::sleep(self.period_pacing).await;
            }
        }

        let mut contents_stored = 0;
        let mut failures = Vec::new();
        for code in TEST_DOCUMENTS {
            if self.stop.is_stopped() {
                break;
            }
            match self.download_document_content(collection, code).await {
                Ok(true) => contents_stored += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(code, error = %format!("{err:#}"), "content download failed");
                    failures.push(DocumentFailure {
                        target: code.to_string(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        }

        Ok(TestDataReport {
            metadata,
            periods,
            contents_stored,
            failures,
        })
    }
}
