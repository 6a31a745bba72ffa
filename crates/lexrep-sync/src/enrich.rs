use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lexrep_core::ScrapedPage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnricherKind {
    None,
    PdfRenderer,
    OcrAnnotator,
    AiSummarizer,
}

impl FromStr for EnricherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(EnricherKind::None),
            "text" | "pdf" => Ok(EnricherKind::PdfRenderer),
            "ocr" => Ok(EnricherKind::OcrAnnotator),
            "ai" => Ok(EnricherKind::AiSummarizer),
            other => Err(format!("unknown enricher {other:?}")),
        }
    }
}

impl fmt::Display for EnricherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnricherKind::None => "none",
            EnricherKind::PdfRenderer => "text",
            EnricherKind::OcrAnnotator => "ocr",
            EnricherKind::AiSummarizer => "ai",
        };
        f.write_str(name)
    }
}

/// Post-processing applied to each fetched document page by a download job.
#[async_trait]
pub trait ContentEnricher: Send + Sync {
    fn kind(&self) -> EnricherKind;

    /// Whether `code` already has an output from this enricher.
    async fn is_done(&self, code: &str) -> bool;

    /// Returns the written artifact, if any.
    async fn enrich(&self, code: &str, page: &ScrapedPage) -> Result<Option<PathBuf>>;
}

#[derive(Debug, Default)]
pub struct NoEnricher;

#[async_trait]
impl ContentEnricher for NoEnricher {
    fn kind(&self) -> EnricherKind {
        EnricherKind::None
    }

    async fn is_done(&self, _code: &str) -> bool {
        false
    }

    async fn enrich(&self, _code: &str, _page: &ScrapedPage) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Writes the page title and the plain text of the main content region to
/// `<dir>/<code>.txt`.
#[derive(Debug)]
pub struct TextRenderer {
    dir: PathBuf,
}

impl TextRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn output_path(&self, code: &str) -> PathBuf {
        self.dir.join(format!("{code}.txt"))
    }
}

#[async_trait]
impl ContentEnricher for TextRenderer {
    fn kind(&self) -> EnricherKind {
        EnricherKind::PdfRenderer
    }

    async fn is_done(&self, code: &str) -> bool {
        tokio::fs::try_exists(self.output_path(code))
            .await
            .unwrap_or(false)
    }

    async fn enrich(&self, code: &str, page: &ScrapedPage) -> Result<Option<PathBuf>> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.output_path(code);
        let body = format!("{}\n\n{}\n", page.title, page.plain_text);
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(Some(path))
    }
}

/// Pick the enricher once at startup. OCR and AI need external engines that
/// are not bundled; asking for them degrades to [`NoEnricher`].
pub fn select_enricher(kind: EnricherKind, config: &SyncConfig) -> Box<dyn ContentEnricher> {
    match kind {
        EnricherKind::None => Box::new(NoEnricher),
        EnricherKind::PdfRenderer => {
            info!(dir = %config.render_dir.display(), "rendering document text");
            Box::new(TextRenderer::new(config.render_dir.clone()))
        }
        EnricherKind::OcrAnnotator | EnricherKind::AiSummarizer => {
            warn!(requested = %kind, "enricher not available in this build; continuing without one");
            Box::new(NoEnricher)
        }
    }
}
