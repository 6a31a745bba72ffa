use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lexrep_adapters::{attachment_file_name, PageSource};
use lexrep_core::{Document, JobState, ScrapedPage};
use lexrep_storage::{Catalog, DocumentCriteria, Store};
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{ContentEnricher, TagIndexer};

pub const MAX_JOB_DOCUMENTS: u32 = 1000;

#[derive(Debug, Default)]
struct Slot {
    state: JobState,
    /// Run holding the slot. Only its worker releases it, through `finish`.
    owner: Option<Uuid>,
}

impl Slot {
    fn owned_by(&self, run_id: Uuid) -> bool {
        self.owner == Some(run_id)
    }
}

/// Shared, lock-guarded progress record of the (single) batch download job.
///
/// Every update names its run; updates from a run that no longer owns the
/// slot are dropped.
#[derive(Debug, Clone, Default)]
pub struct JobMonitor {
    slot: Arc<RwLock<Slot>>,
}

impl JobMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> JobState {
        self.slot.read().await.state.clone()
    }

    /// True until the worker of the current run has exited, stop requested or not.
    pub async fn is_running(&self) -> bool {
        self.slot.read().await.owner.is_some()
    }

    /// Claim the job slot. Returns `None` while any worker, including a
    /// stopping one, still holds it.
    pub async fn try_begin(&self) -> Option<Uuid> {
        let mut slot = self.slot.write().await;
        if slot.owner.is_some() {
            return None;
        }
        let run_id = Uuid::new_v4();
        slot.owner = Some(run_id);
        slot.state = JobState {
            run_id: Some(run_id),
            running: true,
            ..JobState::default()
        };
        Some(run_id)
    }

    /// Cooperative: the worker sees it before its next document.
    pub async fn request_stop(&self) {
        let mut slot = self.slot.write().await;
        if slot.owner.is_some() {
            slot.state.stopping = true;
        }
    }

    /// Whether `run_id` still owns the slot and has not been asked to stop.
    pub async fn should_continue(&self, run_id: Uuid) -> bool {
        let slot = self.slot.read().await;
        slot.owned_by(run_id) && !slot.state.stopping
    }

    async fn update(&self, run_id: Uuid, apply: impl FnOnce(&mut JobState)) {
        let mut slot = self.slot.write().await;
        if slot.owned_by(run_id) {
            apply(&mut slot.state);
        } else {
            warn!(%run_id, "update from a run that no longer owns the job slot dropped");
        }
    }

    async fn set_total(&self, run_id: Uuid, total: usize) {
        self.update(run_id, |state| state.total = total).await;
    }

    async fn set_current(&self, run_id: Uuid, code: &str) {
        self.update(run_id, |state| state.current = Some(code.to_string()))
            .await;
    }

    async fn complete_one(&self, run_id: Uuid) {
        self.update(run_id, |state| state.completed += 1).await;
    }

    async fn record_error(&self, run_id: Uuid, message: String) {
        self.update(run_id, |state| state.errors.push(message)).await;
    }

    /// Release the slot held by `run_id`. A no-op for any other run.
    pub async fn finish(&self, run_id: Uuid) {
        let mut slot = self.slot.write().await;
        if !slot.owned_by(run_id) {
            return;
        }
        slot.owner = None;
        slot.state.running = false;
        slot.state.stopping = false;
        slot.state.current = None;
    }
}

/// Fetch, enrich and tag a selection of stored documents, one at a time.
pub struct DownloadJob {
    store: Store,
    pages: Arc<dyn PageSource>,
    enricher: Arc<dyn ContentEnricher>,
    tags: Arc<TagIndexer>,
    pause: Duration,
    attachment_dir: Option<PathBuf>,
}

impl DownloadJob {
    pub fn new(
        store: Store,
        pages: Arc<dyn PageSource>,
        enricher: Arc<dyn ContentEnricher>,
        tags: Arc<TagIndexer>,
        pause: Duration,
    ) -> Self {
        Self {
            store,
            pages,
            enricher,
            tags,
            pause,
            attachment_dir: None,
        }
    }

    /// Also save the files a page links to under `<dir>/<code>/`.
    pub fn with_attachment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.attachment_dir = Some(dir.into());
        self
    }

    pub fn validate(criteria: &DocumentCriteria) -> Result<()> {
        if criteria.max_docs > MAX_JOB_DOCUMENTS {
            bail!("at most {MAX_JOB_DOCUMENTS} documents per job");
        }
        Ok(())
    }

    /// Run the job whose slot `run_id` was claimed with
    /// [`JobMonitor::try_begin`]. The slot is always released on return.
    pub async fn run(
        &self,
        run_id: Uuid,
        criteria: &DocumentCriteria,
        monitor: &JobMonitor,
    ) -> Result<JobState> {
        let span = info_span!("download_job", run_id = %run_id);
        let result = self
            .run_inner(run_id, criteria, monitor)
            .instrument(span)
            .await;
        if let Err(err) = &result {
            monitor.record_error(run_id, format!("{err:#}")).await;
        }
        monitor.finish(run_id).await;
        result?;
        Ok(monitor.snapshot().await)
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        criteria: &DocumentCriteria,
        monitor: &JobMonitor,
    ) -> Result<()> {
        let docs = Catalog::from_store(&self.store)
            .documents_matching(criteria)
            .await
            .context("selecting documents")?;
        monitor.set_total(run_id, docs.len()).await;
        info!(total = docs.len(), enricher = %self.enricher.kind(), "download job started");

        for (idx, doc) in docs.iter().enumerate() {
            if !monitor.should_continue(run_id).await {
                warn!(done = idx, "stop requested");
                break;
            }
            monitor.set_current(run_id, &doc.code).await;

            if self.enricher.is_done(&doc.code).await {
                info!(code = %doc.code, "already rendered; skipping");
                monitor.complete_one(run_id).await;
                continue;
            }

            match self.process(doc).await {
                Ok(()) => monitor.complete_one(run_id).await,
                Err(err) => {
                    warn!(code = %doc.code, error = %format!("{err:#}"), "document failed");
                    monitor
                        .record_error(run_id, format!("{}: {err:#}", doc.code))
                        .await;
                }
            }

            if !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }
        Ok(())
    }

    async fn process(&self, doc: &Document) -> Result<()> {
        let url = self.pages.document_url(&doc.collection, &doc.code);
        let page = self.pages.fetch_document(&url).await?;
        if !page.has_content() {
            bail!("main content region missing");
        }
        self.enricher.enrich(&doc.code, &page).await?;
        if let Some(dir) = &self.attachment_dir {
            self.save_attachments(dir, &doc.code, &page).await?;
        }
        self.tags.index(&self.store, doc, Some(&page)).await?;
        Ok(())
    }

    /// Files already on disk are kept; a failing download is logged and skipped.
    async fn save_attachments(&self, dir: &Path, code: &str, page: &ScrapedPage) -> Result<usize> {
        if page.attachments.is_empty() {
            return Ok(0);
        }
        let target_dir = dir.join(code);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .with_context(|| format!("creating {}", target_dir.display()))?;

        let mut saved = 0;
        for url in &page.attachments {
            let Some(name) = attachment_file_name(url) else {
                continue;
            };
            let target = target_dir.join(name);
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                debug!(code, file = name, "attachment already saved");
                continue;
            }
            match self.pages.fetch_attachment(url).await {
                Ok(bytes) => {
                    tokio::fs::write(&target, bytes)
                        .await
                        .with_context(|| format!("writing {}", target.display()))?;
                    saved += 1;
                }
                Err(err) => warn!(code, url = %url, error = %err, "attachment download failed"),
            }
        }
        info!(code, saved, listed = page.attachments.len(), "attachments stored");
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use lexrep_adapters::AdapterError;
    use lexrep_core::{Period, ScrapedPage};

    use super::*;
    use crate::TextRenderer;

    #[derive(Default)]
    struct StubPages {
        pages: HashMap<String, ScrapedPage>,
        files: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl PageSource for StubPages {
        async fn list_period_links(
            &self,
            _collection: &str,
            _period: Period,
        ) -> Result<Vec<String>, AdapterError> {
            Ok(Vec::new())
        }

        async fn fetch_document(&self, url: &str) -> Result<ScrapedPage, AdapterError> {
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| AdapterError::Anyhow(anyhow!("404 for {url}")))
        }

        fn document_url(&self, collection: &str, code: &str) -> String {
            format!("https://site/{collection}/{code}")
        }

        async fn fetch_attachment(&self, url: &str) -> Result<Vec<u8>, AdapterError> {
            self.files
                .get(url)
                .cloned()
                .ok_or_else(|| AdapterError::Anyhow(anyhow!("404 for {url}")))
        }
    }

    fn page(code: &str) -> ScrapedPage {
        ScrapedPage {
            url: format!("https://site/cs/{code}"),
            title: code.to_string(),
            plain_text: "text".into(),
            raw_markup: "<div class=\"Paper\">text</div>".into(),
            page_tags: vec!["Sbírka zákonů".into()],
            attachments: Vec::new(),
        }
    }

    async fn seeded_store(dir: &tempfile::TempDir) -> Store {
        let store = Store::open(dir.path().join("replica.db")).await.expect("store");
        for (code, day) in [("2024-1", 1), ("2024-2", 2), ("2024-3", 3)] {
            store
                .upsert_document(&Document {
                    period: Some(2024),
                    doc_type: Some("4".into()),
                    title: Some("Zákon o daních".into()),
                    published_on: NaiveDate::from_ymd_opt(2024, 1, day),
                    ..Document::new("cs", code)
                })
                .await
                .expect("seed");
        }
        store
    }

    #[test]
    fn oversized_jobs_are_rejected() {
        let criteria = DocumentCriteria {
            max_docs: 1001,
            ..Default::default()
        };
        assert!(DownloadJob::validate(&criteria).is_err());
        assert!(DownloadJob::validate(&DocumentCriteria::default()).is_ok());
    }

    #[tokio::test]
    async fn monitor_allows_one_job_at_a_time() {
        let monitor = JobMonitor::new();
        let first = monitor.try_begin().await.expect("first slot");
        assert!(monitor.try_begin().await.is_none());

        monitor.request_stop().await;
        let state = monitor.snapshot().await;
        assert!(state.running);
        assert!(state.stopping);
        assert!(monitor.try_begin().await.is_none());
        assert!(!monitor.should_continue(first).await);

        monitor.finish(first).await;
        assert!(!monitor.is_running().await);
        let second = monitor.try_begin().await.expect("second slot");
        assert_ne!(first, second);
        assert!(monitor.should_continue(second).await);

        monitor.finish(first).await;
        assert!(monitor.is_running().await);
        assert_eq!(monitor.snapshot().await.run_id, Some(second));
    }

    #[tokio::test]
    async fn job_renders_tags_and_records_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(&dir).await;
        let renderer = TextRenderer::new(dir.path().join("renders"));
        std::fs::create_dir_all(dir.path().join("renders")).expect("mkdir");
        std::fs::write(renderer.output_path("2024-3"), "done").expect("pre-render");

        let pages = StubPages {
            pages: HashMap::from([
                ("https://site/cs/2024-1".to_string(), page("2024-1")),
            ]),
            ..Default::default()
        };
        let job = DownloadJob::new(
            store.clone(),
            Arc::new(pages),
            Arc::new(renderer),
            Arc::new(TagIndexer::builtin().expect("rules")),
            Duration::ZERO,
        );
        let monitor = JobMonitor::new();
        let run_id = monitor.try_begin().await.expect("slot");

        let state = job
            .run(run_id, &DocumentCriteria::default(), &monitor)
            .await
            .expect("job");
        assert!(!state.running);
        assert_eq!(state.total, 3);
        assert_eq!(state.completed, 2);
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].starts_with("2024-2: "));
        assert!(state.current.is_none());

        let tagged = store.document("cs", "2024-1").await.expect("read").expect("row");
        assert_eq!(
            tagged.tags,
            Some(vec![
                "Sbírka zákonů".to_string(),
                "daňové právo".to_string(),
                "nové".to_string(),
                "zákon".to_string(),
            ])
        );
        assert!(dir.path().join("renders/2024-1.txt").exists());
    }

    #[tokio::test]
    async fn stopped_job_processes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(&dir).await;
        let job = DownloadJob::new(
            store,
            Arc::new(StubPages::default()),
            Arc::new(crate::NoEnricher),
            Arc::new(TagIndexer::builtin().expect("rules")),
            Duration::ZERO,
        );
        let monitor = JobMonitor::new();
        let run_id = monitor.try_begin().await.expect("slot");
        monitor.request_stop().await;

        let state = job
            .run(run_id, &DocumentCriteria::default(), &monitor)
            .await
            .expect("job");
        assert_eq!(state.total, 3);
        assert_eq!(state.completed, 0);
        assert!(state.errors.is_empty());
    }

    #[tokio::test]
    async fn stopped_run_cannot_touch_the_next_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(&dir).await;
        let pages = StubPages {
            pages: ["2024-1", "2024-2", "2024-3"]
                .into_iter()
                .map(|code| (format!("https://site/cs/{code}"), page(code)))
                .collect(),
            ..Default::default()
        };
        let job = Arc::new(DownloadJob::new(
            store,
            Arc::new(pages),
            Arc::new(crate::NoEnricher),
            Arc::new(TagIndexer::builtin().expect("rules")),
            Duration::from_millis(300),
        ));
        let monitor = JobMonitor::new();
        let first = monitor.try_begin().await.expect("first slot");

        let worker = {
            let job = Arc::clone(&job);
            let monitor = monitor.clone();
            tokio::spawn(async move {
                job.run(first, &DocumentCriteria::default(), &monitor)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.request_stop().await;

        // the stopping worker still holds the slot
        assert!(monitor.try_begin().await.is_none());

        let stopped = worker.await.expect("join").expect("first run");
        assert_eq!(stopped.run_id, Some(first));
        assert_eq!(stopped.completed, 1);
        assert!(!stopped.running);

        let second = monitor.try_begin().await.expect("second slot");
        monitor.finish(first).await;
        let state = monitor.snapshot().await;
        assert_eq!(state.run_id, Some(second));
        assert!(state.running);
        assert!(!state.stopping);
        assert_eq!(state.completed, 0);
        assert!(monitor.should_continue(second).await);
    }

    #[tokio::test]
    async fn attachments_are_saved_once_per_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(&dir).await;
        let mut with_files = page("2024-3");
        with_files.attachments = vec![
            "https://site/files/2024-3/priloha.pdf".into(),
            "https://site/files/2024-3/tabulka.xlsx".into(),
            "https://site/files/2024-3/chybi.doc".into(),
        ];
        let pages = StubPages {
            pages: HashMap::from([("https://site/cs/2024-3".to_string(), with_files)]),
            files: HashMap::from([
                ("https://site/files/2024-3/priloha.pdf".to_string(), b"%PDF new".to_vec()),
                ("https://site/files/2024-3/tabulka.xlsx".to_string(), b"xlsx".to_vec()),
            ]),
        };
        let attachments = dir.path().join("attachments");
        std::fs::create_dir_all(attachments.join("2024-3")).expect("mkdir");
        std::fs::write(attachments.join("2024-3/priloha.pdf"), "kept").expect("existing");

        let job = DownloadJob::new(
            store,
            Arc::new(pages),
            Arc::new(crate::NoEnricher),
            Arc::new(TagIndexer::builtin().expect("rules")),
            Duration::ZERO,
        )
        .with_attachment_dir(&attachments);
        let monitor = JobMonitor::new();
        let run_id = monitor.try_begin().await.expect("slot");
        // newest first: only 2024-3
        let criteria = DocumentCriteria {
            max_docs: 1,
            ..Default::default()
        };

        let state = job.run(run_id, &criteria, &monitor).await.expect("job");
        assert_eq!(state.completed, 1);
        assert!(state.errors.is_empty());
        assert_eq!(
            std::fs::read_to_string(attachments.join("2024-3/priloha.pdf")).expect("read"),
            "kept"
        );
        assert_eq!(
            std::fs::read(attachments.join("2024-3/tabulka.xlsx")).expect("read"),
            b"xlsx"
        );
        assert!(!attachments.join("2024-3/chybi.doc").exists());
    }
}
