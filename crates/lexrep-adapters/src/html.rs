use async_trait::async_trait;
use lexrep_core::{Period, ScrapedPage};
use lexrep_storage::{HttpClientConfig, HttpFetcher};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::{AdapterError, PageSource};

/// Container class holding the body of a rendered document page.
pub const MAIN_CONTENT_SELECTOR: &str = "div.Paper";

/// Link targets saved next to a rendered document.
pub const ATTACHMENT_EXTENSIONS: [&str; 5] = ["pdf", "doc", "docx", "xls", "xlsx"];

#[derive(Debug, Clone)]
pub struct HtmlFetcherConfig {
    pub base_url: String,
    /// `min_interval` is the fixed gap enforced between any two page requests.
    pub http: HttpClientConfig,
}

#[derive(Debug)]
pub struct HtmlFetcher {
    http: HttpFetcher,
    base_url: String,
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Links on a period listing page that point at documents of `collection`:
/// the href contains `/{collection}/` and has exactly two slashes.
pub fn extract_document_links(
    base_url: &str,
    collection: &str,
    html: &str,
) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let anchors = selector("a[href]")?;
    let marker = format!("/{collection}/");
    let base = base_url.trim_end_matches('/');

    let mut links: Vec<String> = Vec::new();
    for href in document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
    {
        if !href.contains(&marker) || href.matches('/').count() != 2 {
            continue;
        }
        let url = if href.starts_with('/') {
            format!("{base}{href}")
        } else {
            format!("{base}/{href}")
        };
        if !links.contains(&url) {
            links.push(url);
        }
    }
    Ok(links)
}

fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

fn is_attachment(href: &str) -> bool {
    strip_query(href)
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ATTACHMENT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Absolute form of `href` as found on the page at `page_url`.
pub fn resolve_href(page_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let (scheme, rest) = page_url.split_once("://").unwrap_or(("https", page_url));
    if let Some(authority_relative) = href.strip_prefix("//") {
        return format!("{scheme}://{authority_relative}");
    }
    let host = rest.split('/').next().unwrap_or(rest);
    if href.starts_with('/') {
        return format!("{scheme}://{host}{href}");
    }
    match rest.rfind('/') {
        Some(idx) => format!("{scheme}://{}/{href}", &rest[..idx]),
        None => format!("{scheme}://{host}/{href}"),
    }
}

/// Local file name for an attachment link: its last path segment.
pub fn attachment_file_name(url: &str) -> Option<&str> {
    code_from_url(strip_query(url)).filter(|name| *name != "." && *name != "..")
}

/// Parse a document page. A missing main content region yields empty
/// `plain_text` and `raw_markup`.
pub fn parse_document_page(url: &str, html: &str) -> Result<ScrapedPage, AdapterError> {
    let document = Html::parse_document(html);

    let title = document
        .select(&selector("title")?)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let (plain_text, raw_markup) = match document.select(&selector(MAIN_CONTENT_SELECTOR)?).next()
    {
        Some(region) => {
            let text = region
                .text()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            (text, region.html())
        }
        None => (String::new(), String::new()),
    };

    let mut page_tags = Vec::new();
    if let Some(keywords) = document
        .select(&selector(r#"meta[name="keywords"]"#)?)
        .next()
        .and_then(|m| m.value().attr("content"))
    {
        page_tags.extend(
            keywords
                .split(',')
                .filter_map(|k| text_or_none(k.to_string())),
        );
    }
    page_tags.extend(
        document
            .select(&selector("a.breadcrumb")?)
            .filter_map(|n| text_or_none(n.text().collect::<String>())),
    );

    let mut attachments: Vec<String> = Vec::new();
    for href in document
        .select(&selector("a[href]")?)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| is_attachment(href))
    {
        let link = resolve_href(url, href.trim());
        if !attachments.contains(&link) {
            attachments.push(link);
        }
    }

    Ok(ScrapedPage {
        url: url.to_string(),
        title,
        plain_text,
        raw_markup,
        page_tags,
        attachments,
    })
}

/// Trailing path segment of a document URL, used as the document code.
pub fn code_from_url(url: &str) -> Option<&str> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|code| !code.is_empty())
}

impl HtmlFetcher {
    pub fn new(config: HtmlFetcherConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config.http)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn listing_url(&self, collection: &str, period: Period) -> String {
        format!("{}/{}/rocnik/{}", self.base_url, collection, period)
    }
}

#[async_trait]
impl PageSource for HtmlFetcher {
    async fn list_period_links(
        &self,
        collection: &str,
        period: Period,
    ) -> Result<Vec<String>, AdapterError> {
        let url = self.listing_url(collection, period);
        let resp = self.http.fetch_bytes(&url).await?;
        let links = extract_document_links(&self.base_url, collection, &resp.text())?;
        info!(collection, period, found = links.len(), "listing page walked");
        Ok(links)
    }

    async fn fetch_document(&self, url: &str) -> Result<ScrapedPage, AdapterError> {
        let resp = self.http.fetch_bytes(url).await?;
        let page = parse_document_page(url, &resp.text())?;
        if page.has_content() {
            debug!(url, chars = page.plain_text.len(), "document page parsed");
        } else {
            warn!(url, "main content region missing");
        }
        Ok(page)
    }

    fn document_url(&self, collection: &str, code: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, code)
    }

    async fn fetch_attachment(&self, url: &str) -> Result<Vec<u8>, AdapterError> {
        let resp = self.http.fetch_bytes(url).await?;
        debug!(url, bytes = resp.body.len(), "attachment fetched");
        Ok(resp.body)
    }
}
