//! OpenAlex `/works` search adapter with cursor paging.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{MetadataSource, SearchQuery, SourceError, abstract_index};
use crate::download::{HttpClient, RetryPolicy};
use crate::record::{BibliographicRecord, RecordIds, SourceKind};

const CATALOG: &str = "openalex";
const DEFAULT_WORKS_URL: &str = "https://api.openalex.org/works";
const TOP_CONCEPTS: usize = 5;

/// Search knobs for [`OpenAlexSource`].
#[derive(Debug, Clone)]
pub struct OpenAlexOptions {
    pub base_url: String,
    pub mailto: String,
    pub per_page: u32,
    /// Pause between cursor pages.
    pub page_delay: Duration,
    pub articles_only: bool,
    pub open_access_only: bool,
    /// `language:` filter; `None` disables it.
    pub language: Option<String>,
    /// Additional `key:v1|v2` filters.
    pub extra_filters: Vec<(String, Vec<String>)>,
    pub retry: RetryPolicy,
}

impl Default for OpenAlexOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_WORKS_URL.to_string(),
            mailto: String::new(),
            per_page: 25,
            page_delay: Duration::from_millis(200),
            articles_only: true,
            open_access_only: false,
            language: Some("en".to_string()),
            extra_filters: Vec::new(),
            retry: RetryPolicy::paging(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorksPage {
    #[serde(default)]
    results: Option<Vec<Work>>,
    #[serde(default)]
    meta: Option<PageMeta>,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    next_cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Work {
    id: Option<String>,
    title: Option<String>,
    publication_date: Option<String>,
    publication_year: Option<i32>,
    #[serde(rename = "type")]
    work_type: Option<String>,
    doi: Option<String>,
    cited_by_count: Option<u64>,
    authorships: Option<Vec<Authorship>>,
    primary_location: Option<Location>,
    concepts: Option<Vec<Concept>>,
    ids: Option<WorkIds>,
    abstract_inverted_index: Option<HashMap<String, Vec<usize>>>,
}

#[derive(Debug, Deserialize)]
struct Authorship {
    author: Option<Author>,
}

#[derive(Debug, Deserialize)]
struct Author {
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Location {
    source: Option<Venue>,
    landing_page_url: Option<String>,
    is_oa: Option<bool>,
    pdf_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Venue {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Concept {
    display_name: Option<String>,
    score: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkIds {
    pmid: Option<String>,
    pmcid: Option<String>,
}

impl Work {
    fn into_record(self) -> Option<BibliographicRecord> {
        let work_ids = self.ids.unwrap_or_default();
        let mut ids = RecordIds {
            pmid: work_ids.pmid,
            pmcid: work_ids.pmcid,
            doi: self.doi,
            openalex: self.id.clone(),
        };
        ids.normalize();
        if ids.is_empty() {
            return None;
        }

        let location = self.primary_location.unwrap_or_default();
        let mut concepts = self.concepts.unwrap_or_default();
        concepts.sort_by(|a, b| {
            b.score
                .unwrap_or_default()
                .total_cmp(&a.score.unwrap_or_default())
        });

        let mut record = BibliographicRecord::new(SourceKind::OpenAlex, ids);
        record.title = self.title.filter(|t| !t.trim().is_empty());
        record.abstract_text = abstract_index::reconstruct(self.abstract_inverted_index.as_ref());
        record.authors = self
            .authorships
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| a.author.and_then(|author| author.display_name))
            .collect();
        record.journal = location.source.and_then(|venue| venue.display_name);
        record.publication_date = self
            .publication_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
        record.pub_year = self.publication_year;
        record.url = location.landing_page_url.or(self.id);
        record.is_open_access = location.is_oa.unwrap_or(false);
        record.pdf_url = location.pdf_url;
        record.work_type = self.work_type;
        record.cited_by_count = self.cited_by_count;
        record.concepts = concepts
            .into_iter()
            .filter_map(|c| c.display_name)
            .take(TOP_CONCEPTS)
            .collect();
        Some(record)
    }
}

/// OpenAlex catalog adapter.
#[derive(Debug)]
pub struct OpenAlexSource {
    client: HttpClient,
    options: OpenAlexOptions,
}

impl OpenAlexSource {
    /// Creates an adapter; requests run under `options.retry`.
    #[must_use]
    pub fn new(client: &HttpClient, options: OpenAlexOptions) -> Self {
        Self {
            client: client.with_retry_policy(options.retry.clone()),
            options,
        }
    }

    /// Comma-joined `filter` parameter for the window and options.
    fn filter_param(&self, earliest: NaiveDate, latest: NaiveDate) -> String {
        let mut filters = vec![
            format!("from_publication_date:{}", earliest.format("%Y-%m-%d")),
            format!("to_publication_date:{}", latest.format("%Y-%m-%d")),
        ];
        if self.options.articles_only {
            filters.push("type:article".to_string());
        }
        if self.options.open_access_only {
            filters.push("open_access.is_oa:true".to_string());
        }
        if let Some(language) = &self.options.language {
            filters.push(format!("language:{language}"));
        }
        for (key, values) in &self.options.extra_filters {
            filters.push(format!("{key}:{}", values.join("|")));
        }
        filters.join(",")
    }
}

#[async_trait]
impl MetadataSource for OpenAlexSource {
    fn name(&self) -> &'static str {
        CATALOG
    }

    #[instrument(skip(self, query), fields(query = %query.query))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<BibliographicRecord>, SourceError> {
        query.validate()?;
        let (earliest, latest) = query.window.bounds()?;
        let filter = self.filter_param(earliest, latest);

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = "*".to_string();
        let mut page_number = 0_u32;

        while records.len() < query.max_records {
            page_number += 1;
            let params = [
                ("search", query.query.clone()),
                ("sort", "publication_date:desc".to_string()),
                ("per-page", self.options.per_page.to_string()),
                ("mailto", self.options.mailto.clone()),
                ("cursor", cursor.clone()),
                ("filter", filter.clone()),
            ];
            let page: WorksPage = self
                .client
                .get_json(&self.options.base_url, &params)
                .await
                .map_err(|e| SourceError::request(CATALOG, e))?;

            let works = page.results.unwrap_or_default();
            let exhausted = works.is_empty();
            for work in works {
                if records.len() >= query.max_records {
                    break;
                }
                let Some(record) = work.into_record() else {
                    continue;
                };
                let key = record
                    .ids
                    .openalex
                    .clone()
                    .or_else(|| record.dedupe_key())
                    .unwrap_or_default();
                if seen.insert(key) {
                    records.push(record);
                }
            }
            debug!(page = page_number, total = records.len(), "fetched OpenAlex page");

            match page.meta.and_then(|m| m.next_cursor) {
                Some(next) if !exhausted && records.len() < query.max_records => cursor = next,
                _ => break,
            }
            tokio::time::sleep(self.options.page_delay).await;
        }

        info!(count = records.len(), pages = page_number, "fetched OpenAlex records");
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn work_json() -> serde_json::Value {
        json!({
            "id": "https://openalex.org/W4390000001",
            "title": "Sleep fragmentation and dementia",
            "publication_date": "2024-02-29",
            "publication_year": 2024,
            "type": "article",
            "doi": "https://doi.org/10.1000/ABC.1",
            "cited_by_count": 7,
            "authorships": [
                {"author": {"display_name": "Jane Smith"}},
                {"institutions": []},
                {"author": {"display_name": "Kim Lee"}}
            ],
            "primary_location": {
                "is_oa": true,
                "landing_page_url": "https://journal.example/article/1",
                "pdf_url": "https://journal.example/article/1.pdf",
                "source": {"display_name": "Journal of Sleep"}
            },
            "concepts": [
                {"display_name": "Medicine", "score": 0.4},
                {"display_name": "Dementia", "score": 0.9},
                {"display_name": "Sleep", "score": 0.8},
                {"display_name": "Biology", "score": 0.1},
                {"display_name": "Psychiatry", "score": 0.5},
                {"display_name": "Neuroscience", "score": 0.6}
            ],
            "ids": {
                "openalex": "https://openalex.org/W4390000001",
                "pmid": "https://pubmed.ncbi.nlm.nih.gov/38000001",
                "pmcid": "https://www.ncbi.nlm.nih.gov/pmc/articles/PMC1234567"
            },
            "abstract_inverted_index": {"Sleep": [0], "matters": [1], ".": [2]}
        })
    }

    #[test]
    fn test_work_maps_to_record() {
        let work: Work = serde_json::from_value(work_json()).unwrap();
        let record = work.into_record().unwrap();
        assert_eq!(record.source, SourceKind::OpenAlex);
        assert_eq!(record.ids.openalex.as_deref(), Some("W4390000001"));
        assert_eq!(record.ids.pmid.as_deref(), Some("38000001"));
        assert_eq!(record.ids.pmcid.as_deref(), Some("PMC1234567"));
        assert_eq!(record.ids.doi.as_deref(), Some("10.1000/abc.1"));
        assert_eq!(record.authors, vec!["Jane Smith", "Kim Lee"]);
        assert_eq!(record.journal.as_deref(), Some("Journal of Sleep"));
        assert_eq!(record.url.as_deref(), Some("https://journal.example/article/1"));
        assert!(record.is_open_access);
        assert_eq!(record.pdf_url.as_deref(), Some("https://journal.example/article/1.pdf"));
        assert_eq!(
            record.concepts,
            vec!["Dementia", "Sleep", "Neuroscience", "Psychiatry", "Medicine"]
        );
        assert_eq!(record.abstract_text.as_deref(), Some("Sleep matters."));
        assert_eq!(record.publication_date, NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(record.cited_by_count, Some(7));
    }

    #[test]
    fn test_work_with_nulls_falls_back_to_id_url() {
        let work: Work = serde_json::from_value(json!({
            "id": "https://openalex.org/W1",
            "title": null,
            "authorships": null,
            "primary_location": null,
            "concepts": null,
            "ids": null,
            "abstract_inverted_index": null
        }))
        .unwrap();
        let record = work.into_record().unwrap();
        assert_eq!(record.url.as_deref(), Some("https://openalex.org/W1"));
        assert!(!record.is_open_access);
        assert!(record.abstract_text.is_none());
        assert!(!record.is_classifiable());
    }

    #[test]
    fn test_filter_param_includes_options() {
        let client = HttpClient::new(
            crate::download::ClientOptions::default(),
            std::sync::Arc::new(crate::download::RateLimiter::disabled()),
        )
        .unwrap();
        let source = OpenAlexSource::new(
            &client,
            OpenAlexOptions {
                open_access_only: true,
                extra_filters: vec![("institutions.country_code".into(), vec!["us".into(), "gb".into()])],
                ..OpenAlexOptions::default()
            },
        );
        let filter = source.filter_param(
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        );
        assert_eq!(
            filter,
            "from_publication_date:2024-02-29,to_publication_date:2024-03-01,type:article,\
             open_access.is_oa:true,language:en,institutions.country_code:us|gb"
        );
    }
}
