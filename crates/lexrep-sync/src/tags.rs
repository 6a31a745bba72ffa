use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use lexrep_core::{Document, Period, ScrapedPage};
use lexrep_storage::Store;
use serde::Deserialize;
use tracing::debug;

const BUILTIN_RULES: &str = include_str!("../../../rules/tags.yaml");

#[derive(Debug, Clone, Deserialize)]
struct TagRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TagRule>,
    #[serde(default)]
    doc_types: Vec<DocTypeRule>,
    #[serde(default)]
    age_buckets: Vec<AgeBucket>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRule {
    tag: String,
    contains_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DocTypeRule {
    doc_type: String,
    tag: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AgeBucket {
    #[serde(default)]
    min_period: Option<Period>,
    tag: String,
}

/// Rule-based tagger. Writes only the tag column of existing documents.
#[derive(Debug, Clone)]
pub struct TagIndexer {
    title_rules: Vec<TagRule>,
    doc_type_rules: Vec<DocTypeRule>,
    age_buckets: Vec<AgeBucket>,
}

impl TagIndexer {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_RULES).context("parsing built-in tag rules")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: TagRulesFile = serde_yaml::from_str(text)?;
        Ok(Self {
            title_rules: file.rules,
            doc_type_rules: file.doc_types,
            age_buckets: file.age_buckets,
        })
    }

    pub fn auto_tags(&self, doc: &Document) -> Vec<String> {
        let mut tags = Vec::new();
        let title = doc.title.as_deref().unwrap_or_default().to_lowercase();

        for rule in &self.title_rules {
            if rule
                .contains_any
                .iter()
                .any(|needle| title.contains(&needle.to_lowercase()))
            {
                tags.push(rule.tag.clone());
            }
        }

        if let Some(doc_type) = doc.doc_type.as_deref() {
            if let Some(rule) = self.doc_type_rules.iter().find(|r| r.doc_type == doc_type) {
                tags.push(rule.tag.clone());
            }
        }

        if let Some(period) = doc.period {
            if let Some(bucket) = self
                .age_buckets
                .iter()
                .find(|b| b.min_period.map_or(true, |min| period >= min))
            {
                tags.push(bucket.tag.clone());
            }
        }

        tags
    }

    /// Sorted, de-duplicated union of rule tags and page tags.
    pub fn tags_for(&self, doc: &Document, page: Option<&ScrapedPage>) -> Vec<String> {
        let mut all: BTreeSet<String> = self.auto_tags(doc).into_iter().collect();
        if let Some(page) = page {
            all.extend(page.page_tags.iter().cloned());
        }
        all.into_iter().collect()
    }

    pub async fn index(
        &self,
        store: &Store,
        doc: &Document,
        page: Option<&ScrapedPage>,
    ) -> Result<Vec<String>> {
        let tags = self.tags_for(doc, page);
        let updated = store
            .set_tags(&doc.collection, &doc.code, &tags)
            .await
            .with_context(|| format!("storing tags for {}", doc.code))?;
        debug!(code = %doc.code, tags = tags.len(), updated, "tags indexed");
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, doc_type: &str, period: Option<Period>) -> Document {
        Document {
            title: Some(title.to_string()),
            doc_type: Some(doc_type.to_string()),
            period,
            ..Document::new("cs", "x")
        }
    }

    #[test]
    fn builtin_rules_tag_by_title_type_and_age() {
        let indexer = TagIndexer::builtin().expect("builtin rules");

        let tags = indexer.auto_tags(&doc("Zákoník práce", "4", Some(2006)));
        assert_eq!(tags, vec!["pracovní právo", "zákon", "platné"]);

        let tags = indexer.auto_tags(&doc("Trestní zákoník", "4", Some(2021)));
        assert_eq!(tags, vec!["trestní právo", "zákon", "nové"]);

        let tags = indexer.auto_tags(&doc("Vyhláška o něčem", "2", Some(1964)));
        assert_eq!(tags, vec!["vyhláška", "historické"]);

        assert!(indexer.auto_tags(&doc("Sdělení", "99", None)).is_empty());
    }

    #[test]
    fn page_tags_are_merged_sorted_and_unique() {
        let indexer = TagIndexer::builtin().expect("builtin rules");
        let page = ScrapedPage {
            url: "u".into(),
            title: "t".into(),
            plain_text: String::new(),
            raw_markup: String::new(),
            page_tags: vec!["zákon".into(), "Sbírka zákonů".into()],
            attachments: Vec::new(),
        };
        let tags = indexer.tags_for(&doc("Občanský zákoník", "4", Some(1964)), Some(&page));
        assert_eq!(
            tags,
            vec!["Sbírka zákonů", "historické", "občanské právo", "zákon"]
        );
    }

    #[test]
    fn custom_rules_without_buckets_are_accepted() {
        let indexer = TagIndexer::from_yaml_str(
            "version: 1\nrules:\n  - tag: energie\n    contains_any: [ENERGET]\n",
        )
        .expect("rules");
        let tags = indexer.auto_tags(&doc("Energetický zákon", "4", Some(2000)));
        assert_eq!(tags, vec!["energie"]);
    }

    #[tokio::test]
    async fn indexing_writes_tags_of_existing_rows_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("replica.db")).await.expect("store");
        let indexer = TagIndexer::builtin().expect("rules");
        let mut d = doc("Daňový řád", "4", Some(2009));
        d.code = "2009-280".into();
        store.upsert_document(&d).await.expect("upsert");

        let tags = indexer.index(&store, &d, None).await.expect("index");
        let stored = store.document("cs", "2009-280").await.expect("read").expect("row");
        assert_eq!(stored.tags, Some(tags));

        let mut ghost = d.clone();
        ghost.code = "1111-1".into();
        indexer.index(&store, &ghost, None).await.expect("no-op");
        assert_eq!(store.statistics().await.expect("stats").total_documents, 1);
    }
}
