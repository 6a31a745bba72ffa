//! Sync orchestration: period ingestion, HTML merge, tagging and download jobs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lexrep_adapters::{ApiClientConfig, HtmlFetcherConfig};
use lexrep_storage::HttpClientConfig;

mod enrich;
mod job;
mod pipeline;
mod tags;

pub use enrich::{select_enricher, ContentEnricher, EnricherKind, NoEnricher, TextRenderer};
pub use job::{DownloadJob, JobMonitor, MAX_JOB_DOCUMENTS};
pub use pipeline::{
    estimate_remaining, Coverage, DocumentFailure, Eta, MetadataSummary, PeriodFailure,
    PeriodOutcome, RangeReport, ScrapeReport, StopSignal, SyncPipeline, TestDataReport,
    TEST_DOCUMENTS, TEST_PERIODS,
};
pub use tags::TagIndexer;

pub const CRATE_NAME: &str = "lexrep-sync";

/// Earliest and latest period a full replica run walks by default.
pub const FULL_RANGE: (lexrep_core::Period, lexrep_core::Period) = (1918, 2025);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub api_key: String,
    pub api_base_url: String,
    pub web_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub period_pacing: Duration,
    pub page_pacing: Duration,
    pub render_dir: PathBuf,
    /// Attached files land in `<attachment_dir>/<code>/`.
    pub attachment_dir: PathBuf,
    pub enricher: EnricherKind,
    pub tag_rules_path: Option<PathBuf>,
    pub web_port: u16,
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("zakonyprolidi.db"),
            api_key: "test".to_string(),
            api_base_url: "http://www.zakonyprolidi.cz/api/v1".to_string(),
            web_base_url: "https://www.zakonyprolidi.cz".to_string(),
            user_agent: "lexrep-bot/0.1".to_string(),
            http_timeout_secs: 30,
            period_pacing: Duration::from_millis(1000),
            page_pacing: Duration::from_millis(2000),
            render_dir: PathBuf::from("renders"),
            attachment_dir: PathBuf::from("attachments"),
            enricher: EnricherKind::PdfRenderer,
            tag_rules_path: None,
            web_port: 5000,
            log_level: "info".to_string(),
        }
    }
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    /// Defaults overlaid with `LEXREP_*` variables; a `.env` file is read first when present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            db_path: std::env::var("LEXREP_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            api_key: std::env::var("LEXREP_API_KEY").unwrap_or(defaults.api_key),
            api_base_url: std::env::var("LEXREP_API_BASE_URL").unwrap_or(defaults.api_base_url),
            web_base_url: std::env::var("LEXREP_WEB_BASE_URL").unwrap_or(defaults.web_base_url),
            user_agent: std::env::var("LEXREP_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parsed("LEXREP_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            period_pacing: env_parsed("LEXREP_PERIOD_PACING_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.period_pacing),
            page_pacing: env_parsed("LEXREP_PAGE_PACING_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.page_pacing),
            render_dir: std::env::var("LEXREP_RENDER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.render_dir),
            attachment_dir: std::env::var("LEXREP_ATTACHMENT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.attachment_dir),
            enricher: env_parsed("LEXREP_ENRICHER").unwrap_or(defaults.enricher),
            tag_rules_path: std::env::var("LEXREP_TAG_RULES").ok().map(PathBuf::from),
            web_port: env_parsed("LEXREP_WEB_PORT").unwrap_or(defaults.web_port),
            log_level: std::env::var("LEXREP_LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    fn http_config(&self, min_interval: Duration) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_interval,
        }
    }

    pub fn api_client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            http: self.http_config(Duration::ZERO),
        }
    }

    pub fn html_fetcher_config(&self) -> HtmlFetcherConfig {
        HtmlFetcherConfig {
            base_url: self.web_base_url.clone(),
            http: self.http_config(self.page_pacing),
        }
    }

    /// Tag rules from `tag_rules_path`, or the built-in rule set.
    pub fn tag_indexer(&self) -> anyhow::Result<TagIndexer> {
        match &self.tag_rules_path {
            Some(path) => TagIndexer::from_path(path),
            None => TagIndexer::builtin(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.db_path, PathBuf::from("zakonyprolidi.db"));
        assert_eq!(config.api_key, "test");
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.enricher, EnricherKind::PdfRenderer);

        let api = config.api_client_config();
        assert_eq!(api.http.timeout, Duration::from_secs(30));
        assert_eq!(api.http.min_interval, Duration::ZERO);
        let html = config.html_fetcher_config();
        assert_eq!(html.http.min_interval, Duration::from_millis(2000));
    }
}
