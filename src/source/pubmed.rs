//! `PubMed` E-utilities adapter: `esearch` for PMIDs, `efetch` for article XML.

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{MetadataSource, SearchQuery, SourceError};
use crate::download::HttpClient;
use crate::record::{BibliographicRecord, RecordIds, SourceKind};

const CATALOG: &str = "pubmed";
const DEFAULT_EUTILS_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const PUBMED_ARTICLE_URL: &str = "https://pubmed.ncbi.nlm.nih.gov";

/// PMIDs posted per `efetch` call.
const EFETCH_BATCH: usize = 200;

#[derive(Debug, Deserialize)]
struct EsearchResponse {
    #[serde(default)]
    esearchresult: EsearchResult,
}

#[derive(Debug, Default, Deserialize)]
struct EsearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

/// `PubMed` catalog adapter.
pub struct PubMedSource {
    client: HttpClient,
    base_url: String,
    email: String,
    api_key: Option<String>,
}

impl PubMedSource {
    /// Creates an adapter against the public E-utilities endpoint.
    #[must_use]
    pub fn new(client: HttpClient, email: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_base_url(client, email, api_key, DEFAULT_EUTILS_BASE_URL)
    }

    /// Creates an adapter against a custom endpoint (tests, mirrors).
    #[must_use]
    pub fn with_base_url(
        client: HttpClient,
        email: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            email: email.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn common_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("email", self.email.clone())];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    /// Finds PMIDs in the query's window, most recent first.
    ///
    /// # Errors
    ///
    /// Request failures after retries, or an unparseable response.
    #[instrument(skip(self, query), fields(query = %query.query))]
    pub async fn esearch(&self, query: &SearchQuery) -> Result<Vec<String>, SourceError> {
        let (earliest, latest) = query.window.bounds()?;
        let mut params = self.common_params();
        params.extend([
            ("db", "pubmed".to_string()),
            ("term", query.query.clone()),
            ("datetype", "edat".to_string()),
            ("mindate", earliest.format("%Y/%m/%d").to_string()),
            ("maxdate", latest.format("%Y/%m/%d").to_string()),
            ("retmax", query.max_records.to_string()),
            ("retmode", "json".to_string()),
            ("sort", "most recent".to_string()),
        ]);

        let response: EsearchResponse = self
            .client
            .get_json(&format!("{}/esearch.fcgi", self.base_url), &params)
            .await
            .map_err(|e| SourceError::request(CATALOG, e))?;

        let mut ids = response.esearchresult.idlist;
        ids.truncate(query.max_records);
        debug!(count = ids.len(), "esearch returned PMIDs");
        Ok(ids)
    }

    /// Fetches and parses article metadata for `pmids`.
    ///
    /// # Errors
    ///
    /// Request failures after retries, or malformed XML.
    #[instrument(skip(self, pmids), fields(count = pmids.len()))]
    pub async fn efetch(&self, pmids: &[String]) -> Result<Vec<BibliographicRecord>, SourceError> {
        let mut records = Vec::with_capacity(pmids.len());
        for batch in pmids.chunks(EFETCH_BATCH) {
            let mut form = self.common_params();
            form.extend([
                ("db", "pubmed".to_string()),
                ("id", batch.join(",")),
                ("retmode", "xml".to_string()),
            ]);
            let xml = self
                .client
                .post_form_text(&format!("{}/efetch.fcgi", self.base_url), &form)
                .await
                .map_err(|e| SourceError::request(CATALOG, e))?;
            records.extend(parse_efetch_xml(&xml)?);
        }
        Ok(records)
    }
}

impl std::fmt::Debug for PubMedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubMedSource")
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MetadataSource for PubMedSource {
    fn name(&self) -> &'static str {
        CATALOG
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<BibliographicRecord>, SourceError> {
        query.validate()?;
        let pmids = self.esearch(query).await?;
        if pmids.is_empty() {
            info!(query = %query.query, "no PubMed records in window");
            return Ok(Vec::new());
        }
        let mut records = self.efetch(&pmids).await?;
        records.truncate(query.max_records);
        info!(count = records.len(), "fetched PubMed records");
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Pmid,
    Doi,
    Pmcid,
    Title,
    Journal,
    Year,
    Abstract,
    LastName,
    Initials,
}

#[derive(Debug, Default)]
struct ArticleBuilder {
    pmid: Option<String>,
    doi: Option<String>,
    pmcid: Option<String>,
    title: Option<String>,
    journal: Option<String>,
    year: Option<String>,
    abstract_parts: Vec<String>,
    authors: Vec<String>,
    last_name: Option<String>,
    initials: Option<String>,
}

impl ArticleBuilder {
    fn set(&mut self, field: Field, text: String) {
        if text.is_empty() {
            return;
        }
        let slot = match field {
            Field::Abstract => {
                self.abstract_parts.push(text);
                return;
            }
            Field::Pmid => &mut self.pmid,
            Field::Doi => &mut self.doi,
            Field::Pmcid => &mut self.pmcid,
            Field::Title => &mut self.title,
            Field::Journal => &mut self.journal,
            Field::Year => &mut self.year,
            Field::LastName => &mut self.last_name,
            Field::Initials => &mut self.initials,
        };
        if slot.is_none() {
            *slot = Some(text);
        }
    }

    fn finish_author(&mut self) {
        if let (Some(last), Some(initials)) = (self.last_name.take(), self.initials.take()) {
            self.authors.push(format!("{last} {initials}"));
        }
    }

    fn build(self) -> Option<BibliographicRecord> {
        let mut ids = RecordIds {
            pmid: self.pmid,
            pmcid: self.pmcid,
            doi: self.doi,
            openalex: None,
        };
        ids.normalize();
        if ids.is_empty() {
            return None;
        }
        let url = ids
            .pmid
            .as_ref()
            .map(|pmid| format!("{PUBMED_ARTICLE_URL}/{pmid}/"));

        let mut record = BibliographicRecord::new(SourceKind::PubMed, ids);
        record.title = self.title;
        record.journal = self.journal;
        record.pub_year = self
            .year
            .filter(|y| !y.is_empty() && y.chars().all(|c| c.is_ascii_digit()))
            .and_then(|y| y.parse().ok());
        record.abstract_text = (!self.abstract_parts.is_empty()).then(|| self.abstract_parts.join(" "));
        record.authors = self.authors;
        record.url = url;
        Some(record)
    }
}

fn ends_with(stack: &[String], suffix: &[&str]) -> bool {
    stack.len() >= suffix.len()
        && stack[stack.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(have, want)| have == want)
}

fn field_for(stack: &[String], element: &BytesStart<'_>) -> Result<Option<Field>, SourceError> {
    let field = if ends_with(stack, &["MedlineCitation", "PMID"]) {
        Some(Field::Pmid)
    } else if ends_with(stack, &["PubmedData", "ArticleIdList", "ArticleId"]) {
        let id_type = element
            .try_get_attribute("IdType")
            .map_err(|e| SourceError::parse(CATALOG, e.to_string()))?
            .map(|attr| attr.unescape_value().map(|v| v.to_ascii_lowercase()))
            .transpose()
            .map_err(|e| SourceError::parse(CATALOG, e.to_string()))?;
        match id_type.as_deref() {
            Some("doi") => Some(Field::Doi),
            Some("pmc") => Some(Field::Pmcid),
            _ => None,
        }
    } else if ends_with(stack, &["Article", "ArticleTitle"]) {
        Some(Field::Title)
    } else if ends_with(stack, &["Journal", "Title"]) {
        Some(Field::Journal)
    } else if ends_with(stack, &["JournalIssue", "PubDate", "Year"]) {
        Some(Field::Year)
    } else if ends_with(stack, &["Abstract", "AbstractText"]) {
        Some(Field::Abstract)
    } else if ends_with(stack, &["AuthorList", "Author", "LastName"]) {
        Some(Field::LastName)
    } else if ends_with(stack, &["AuthorList", "Author", "Initials"]) {
        Some(Field::Initials)
    } else {
        None
    };
    Ok(field)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses an `efetch` `PubmedArticleSet` into records.
///
/// Inline markup inside titles and abstracts is flattened to its text.
/// Articles without any identifier are skipped.
///
/// # Errors
///
/// [`SourceError::Parse`] for malformed XML.
pub fn parse_efetch_xml(xml: &str) -> Result<Vec<BibliographicRecord>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut records = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut article: Option<ArticleBuilder> = None;
    // (field, element depth, accumulated text)
    let mut capture: Option<(Field, usize, String)> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| SourceError::parse(CATALOG, format!("at byte {}: {e}", reader.buffer_position())))?;
        match event {
            Event::Start(element) => {
                let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                if name == "PubmedArticle" {
                    article = Some(ArticleBuilder::default());
                }
                stack.push(name);
                if article.is_some()
                    && capture.is_none()
                    && let Some(field) = field_for(&stack, &element)?
                {
                    capture = Some((field, stack.len(), String::new()));
                }
            }
            Event::Text(text) => {
                if let Some((_, _, buffer)) = capture.as_mut() {
                    let text = text
                        .unescape()
                        .map_err(|e| SourceError::parse(CATALOG, e.to_string()))?;
                    buffer.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some((_, _, buffer)) = capture.as_mut() {
                    buffer.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(element) => {
                let depth = stack.len();
                if capture.as_ref().is_some_and(|(_, start, _)| *start == depth)
                    && let Some((field, _, text)) = capture.take()
                    && let Some(builder) = article.as_mut()
                {
                    builder.set(field, collapse_whitespace(&text));
                }
                match element.name().as_ref() {
                    b"Author" => {
                        if let Some(builder) = article.as_mut() {
                            builder.finish_author();
                        }
                    }
                    b"PubmedArticle" => {
                        if let Some(record) = article.take().and_then(ArticleBuilder::build) {
                            records.push(record);
                        }
                    }
                    _ => {}
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    debug!(count = records.len(), "parsed efetch XML");
    Ok(records)
}
