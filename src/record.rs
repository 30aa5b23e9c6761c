//! Normalized bibliographic records and identity-based merging.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::classify::Classification;
use crate::fulltext::ResolutionAttempt;

/// Catalog that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    PubMed,
    OpenAlex,
}

/// External identifiers of one work. At least one is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIds {
    pub pmid: Option<String>,
    pub pmcid: Option<String>,
    pub doi: Option<String>,
    pub openalex: Option<String>,
}

impl RecordIds {
    /// Normalizes every present identifier in place and drops empty ones.
    pub fn normalize(&mut self) {
        self.pmid = self.pmid.as_deref().and_then(normalize_pmid);
        self.pmcid = self.pmcid.as_deref().and_then(normalize_pmcid);
        self.doi = self.doi.as_deref().and_then(normalize_doi);
        self.openalex = self.openalex.as_deref().and_then(normalize_openalex);
    }

    /// Returns true when no identifier is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pmid.is_none() && self.pmcid.is_none() && self.doi.is_none() && self.openalex.is_none()
    }

    /// Every identity key this record can be matched on.
    #[must_use]
    pub fn identity_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(4);
        if let Some(doi) = self.doi.as_deref().and_then(normalize_doi) {
            keys.push(format!("doi:{doi}"));
        }
        if let Some(pmid) = self.pmid.as_deref().and_then(normalize_pmid) {
            keys.push(format!("pmid:{pmid}"));
        }
        if let Some(pmcid) = self.pmcid.as_deref().and_then(normalize_pmcid) {
            keys.push(format!("pmcid:{pmcid}"));
        }
        if let Some(openalex) = self.openalex.as_deref().and_then(normalize_openalex) {
            keys.push(format!("openalex:{openalex}"));
        }
        keys
    }

    /// Identifier used to query PMC services: PMCID when known, else PMID.
    #[must_use]
    pub fn pmc_lookup_id(&self) -> Option<&str> {
        self.pmcid.as_deref().or(self.pmid.as_deref())
    }

    fn fill_from(&mut self, other: &Self) {
        fill(&mut self.pmid, &other.pmid);
        fill(&mut self.pmcid, &other.pmcid);
        fill(&mut self.doi, &other.doi);
        fill(&mut self.openalex, &other.openalex);
    }
}

/// One work as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BibliographicRecord {
    pub ids: RecordIds,
    pub source: SourceKind,
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub authors: Vec<String>,
    pub journal: Option<String>,
    pub pub_year: Option<i32>,
    pub publication_date: Option<NaiveDate>,
    /// Canonical landing page.
    pub url: Option<String>,
    pub is_open_access: bool,
    pub pdf_url: Option<String>,
    pub work_type: Option<String>,
    pub cited_by_count: Option<u64>,
    pub concepts: Vec<String>,
    pub classification: Option<Classification>,
    /// `None` until classified.
    pub relevant: Option<bool>,
    pub license: Option<String>,
    pub fulltext_path: Option<PathBuf>,
    pub fulltext_paths: Vec<PathBuf>,
    pub attempts: Vec<ResolutionAttempt>,
}

impl BibliographicRecord {
    /// Creates an empty record for `source`.
    #[must_use]
    pub fn new(source: SourceKind, ids: RecordIds) -> Self {
        Self {
            ids,
            source,
            title: None,
            abstract_text: None,
            authors: Vec::new(),
            journal: None,
            pub_year: None,
            publication_date: None,
            url: None,
            is_open_access: false,
            pdf_url: None,
            work_type: None,
            cited_by_count: None,
            concepts: Vec::new(),
            classification: None,
            relevant: None,
            license: None,
            fulltext_path: None,
            fulltext_paths: Vec::new(),
            attempts: Vec::new(),
        }
    }

    /// Primary merge key: DOI, then PMID, then PMCID, then OpenAlex id.
    #[must_use]
    pub fn dedupe_key(&self) -> Option<String> {
        self.ids.identity_keys().into_iter().next()
    }

    /// Whether the record has both a title and an abstract to classify.
    #[must_use]
    pub fn is_classifiable(&self) -> bool {
        non_blank(self.title.as_deref()) && non_blank(self.abstract_text.as_deref())
    }

    /// Title and abstract joined for the classifier.
    #[must_use]
    pub fn classification_text(&self) -> Option<String> {
        if !self.is_classifiable() {
            return None;
        }
        Some(format!(
            "{}. {}",
            self.title.as_deref().unwrap_or_default().trim(),
            self.abstract_text.as_deref().unwrap_or_default().trim()
        ))
    }

    #[must_use]
    pub fn has_fulltext(&self) -> bool {
        self.fulltext_path.is_some()
    }

    /// File-system-safe stem naming this record's documents.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let raw = self
            .ids
            .pmcid
            .as_deref()
            .or(self.ids.pmid.as_deref())
            .or(self.ids.doi.as_deref())
            .or(self.ids.openalex.as_deref())
            .unwrap_or("record");
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    /// Attaches resolved documents; the first path becomes `fulltext_path`.
    pub fn attach_documents(&mut self, paths: Vec<PathBuf>, license: Option<String>) {
        self.fulltext_path = paths.first().cloned();
        self.fulltext_paths = paths;
        if license.is_some() {
            self.license = license;
        }
    }

    /// Fills every missing field from `other` without overwriting present ones.
    fn absorb(&mut self, other: Self) {
        self.ids.fill_from(&other.ids);
        fill(&mut self.title, &other.title);
        fill(&mut self.abstract_text, &other.abstract_text);
        if self.authors.is_empty() {
            self.authors = other.authors;
        }
        fill(&mut self.journal, &other.journal);
        fill(&mut self.pub_year, &other.pub_year);
        fill(&mut self.publication_date, &other.publication_date);
        fill(&mut self.url, &other.url);
        self.is_open_access |= other.is_open_access;
        fill(&mut self.pdf_url, &other.pdf_url);
        fill(&mut self.work_type, &other.work_type);
        fill(&mut self.cited_by_count, &other.cited_by_count);
        if self.concepts.is_empty() {
            self.concepts = other.concepts;
        }
        if self.classification.is_none() {
            self.classification = other.classification;
            self.relevant = other.relevant;
        }
        fill(&mut self.license, &other.license);
        if self.fulltext_path.is_none() {
            self.fulltext_path = other.fulltext_path;
            self.fulltext_paths = other.fulltext_paths;
        }
        self.attempts.extend(other.attempts);
    }
}

/// Merges records that share any identifier.
///
/// On collision the record with a full-text path wins; if both or neither
/// have one, the `PubMed` record wins, then the earlier one. The winner's
/// missing fields are filled from the loser. Input order is preserved.
#[must_use]
pub fn merge_records(records: Vec<BibliographicRecord>) -> Vec<BibliographicRecord> {
    let mut slots: Vec<Option<BibliographicRecord>> = Vec::with_capacity(records.len());
    // Every key a slot has absorbed, including ones the winner's ids dropped.
    let mut slot_keys: Vec<Vec<String>> = Vec::with_capacity(records.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for mut record in records {
        record.ids.normalize();
        let keys = record.ids.identity_keys();

        let mut matched: Vec<usize> = keys.iter().filter_map(|k| index.get(k).copied()).collect();
        matched.sort_unstable();
        matched.dedup();

        let target = if let Some(&first) = matched.first() {
            let mut merged = record;
            let mut absorbed = keys;
            for &slot in matched.iter().rev() {
                if let Some(existing) = slots[slot].take() {
                    merged = combine(existing, merged);
                }
                absorbed.append(&mut slot_keys[slot]);
            }
            slots[first] = Some(merged);
            slot_keys[first] = absorbed;
            first
        } else {
            slots.push(Some(record));
            slot_keys.push(keys);
            slots.len() - 1
        };

        if let Some(merged) = &slots[target] {
            slot_keys[target].extend(merged.ids.identity_keys());
        }
        let keys = &mut slot_keys[target];
        keys.sort_unstable();
        keys.dedup();
        for key in keys.iter() {
            index.insert(key.clone(), target);
        }
    }

    slots.into_iter().flatten().collect()
}

/// Picks the winner of two colliding records; `existing` was seen first.
fn combine(existing: BibliographicRecord, incoming: BibliographicRecord) -> BibliographicRecord {
    let incoming_wins = match (existing.has_fulltext(), incoming.has_fulltext()) {
        (false, true) => true,
        (true, false) => false,
        _ => existing.source != SourceKind::PubMed && incoming.source == SourceKind::PubMed,
    };
    let (mut winner, loser) = if incoming_wins {
        (incoming, existing)
    } else {
        (existing, incoming)
    };
    winner.absorb(loser);
    winner
}

fn fill<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// Lowercases a DOI and strips resolver prefixes.
#[must_use]
pub fn normalize_doi(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let stripped = ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "http://dx.doi.org/", "doi:"]
        .iter()
        .find_map(|prefix| lowered.strip_prefix(prefix))
        .unwrap_or(&lowered)
        .trim();
    (!stripped.is_empty()).then(|| stripped.to_string())
}

/// Keeps the digits of a PMID (accepts trailing URL segments).
#[must_use]
pub fn normalize_pmid(raw: &str) -> Option<String> {
    let tail = last_segment(raw);
    (!tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit())).then(|| tail.to_string())
}

/// Uppercases a PMCID and ensures the `PMC` prefix.
#[must_use]
pub fn normalize_pmcid(raw: &str) -> Option<String> {
    let tail = last_segment(raw).to_uppercase();
    let digits = tail.strip_prefix("PMC").unwrap_or(&tail);
    (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())).then(|| format!("PMC{digits}"))
}

/// Reduces an OpenAlex work URL to its `W…` identifier.
#[must_use]
pub fn normalize_openalex(raw: &str) -> Option<String> {
    let tail = last_segment(raw).to_uppercase();
    (!tail.is_empty()).then_some(tail)
}

fn last_segment(raw: &str) -> &str {
    raw.trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn record(source: SourceKind, pmid: Option<&str>, doi: Option<&str>) -> BibliographicRecord {
        BibliographicRecord::new(
            source,
            RecordIds {
                pmid: pmid.map(String::from),
                doi: doi.map(String::from),
                ..RecordIds::default()
            },
        )
    }

    // ==================== Normalization Tests ====================

    #[test]
    fn test_normalize_identifiers() {
        assert_eq!(
            normalize_doi("https://doi.org/10.1000/ABC").as_deref(),
            Some("10.1000/abc")
        );
        assert_eq!(normalize_doi("doi:10.1/x").as_deref(), Some("10.1/x"));
        assert_eq!(normalize_doi("  "), None);
        assert_eq!(
            normalize_pmid("https://pubmed.ncbi.nlm.nih.gov/12345/").as_deref(),
            Some("12345")
        );
        assert_eq!(normalize_pmid("abc"), None);
        assert_eq!(normalize_pmcid("pmc998").as_deref(), Some("PMC998"));
        assert_eq!(
            normalize_pmcid("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC42").as_deref(),
            Some("PMC42")
        );
        assert_eq!(normalize_pmcid("42").as_deref(), Some("PMC42"));
        assert_eq!(
            normalize_openalex("https://openalex.org/W2741809807").as_deref(),
            Some("W2741809807")
        );
    }

    #[test]
    fn test_dedupe_key_prefers_doi() {
        let r = record(SourceKind::PubMed, Some("1"), Some("10.1/X"));
        assert_eq!(r.dedupe_key().as_deref(), Some("doi:10.1/x"));
        let r = record(SourceKind::PubMed, Some("1"), None);
        assert_eq!(r.dedupe_key().as_deref(), Some("pmid:1"));
    }

    #[test]
    fn test_classification_text_requires_title_and_abstract() {
        let mut r = record(SourceKind::PubMed, Some("1"), None);
        r.title = Some("Title".into());
        assert!(r.classification_text().is_none());
        r.abstract_text = Some("   ".into());
        assert!(!r.is_classifiable());
        r.abstract_text = Some("Body".into());
        assert_eq!(r.classification_text().as_deref(), Some("Title. Body"));
    }

    #[test]
    fn test_file_stem_is_filesystem_safe() {
        let r = record(SourceKind::OpenAlex, None, Some("10.1000/abc.def"));
        assert_eq!(r.file_stem(), "10_1000_abc_def");
    }

    // ==================== Merge Tests ====================

    #[test]
    fn test_merge_prefers_record_with_fulltext() {
        let pubmed = record(SourceKind::PubMed, Some("100"), Some("10.1/a"));
        let mut openalex = record(SourceKind::OpenAlex, Some("100"), Some("https://doi.org/10.1/A"));
        openalex.attach_documents(vec![PathBuf::from("/docs/a.pdf")], Some("cc-by".into()));
        openalex.cited_by_count = Some(3);

        let merged = merge_records(vec![pubmed, openalex]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, SourceKind::OpenAlex);
        assert_eq!(merged[0].fulltext_path, Some(PathBuf::from("/docs/a.pdf")));
    }

    #[test]
    fn test_merge_prefers_pubmed_on_tie_and_fills_fields() {
        let mut openalex = record(SourceKind::OpenAlex, None, Some("10.1/b"));
        openalex.ids.openalex = Some("W1".into());
        openalex.cited_by_count = Some(9);
        openalex.title = Some("OpenAlex title".into());
        let mut pubmed = record(SourceKind::PubMed, Some("200"), Some("10.1/B"));
        pubmed.title = Some("PubMed title".into());

        let merged = merge_records(vec![openalex, pubmed]);
        assert_eq!(merged.len(), 1);
        let winner = &merged[0];
        assert_eq!(winner.source, SourceKind::PubMed);
        assert_eq!(winner.title.as_deref(), Some("PubMed title"));
        assert_eq!(winner.cited_by_count, Some(9));
        assert_eq!(winner.ids.openalex.as_deref(), Some("W1"));
        assert_eq!(winner.ids.pmid.as_deref(), Some("200"));
    }

    #[test]
    fn test_merge_bridges_two_earlier_records() {
        let by_doi = record(SourceKind::OpenAlex, None, Some("10.1/c"));
        let by_pmid = record(SourceKind::PubMed, Some("300"), None);
        let bridge = record(SourceKind::OpenAlex, Some("300"), Some("10.1/c"));

        let merged = merge_records(vec![by_doi, by_pmid, bridge]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].ids.pmid.as_deref(), Some("300"));
        assert_eq!(merged[0].ids.doi.as_deref(), Some("10.1/c"));
    }

    #[test]
    fn test_merge_follows_identifiers_of_absorbed_records() {
        // Same PMID, conflicting DOIs: the winner keeps 10.1/d.
        let pubmed = record(SourceKind::PubMed, Some("400"), Some("10.1/d"));
        let mut conflicting = record(SourceKind::OpenAlex, Some("400"), Some("10.1/d-preprint"));
        conflicting.ids.openalex = Some("W4".into());
        // Only reachable through the loser's DOI.
        let mut later = record(SourceKind::OpenAlex, None, Some("https://doi.org/10.1/D-PREPRINT"));
        later.cited_by_count = Some(11);
        // And then through the later record's own identifier.
        let mut last = record(SourceKind::OpenAlex, None, None);
        last.ids.openalex = Some("W4".into());
        let unrelated = record(SourceKind::PubMed, Some("401"), None);

        let merged = merge_records(vec![pubmed, conflicting, unrelated, later, last]);
        assert_eq!(merged.len(), 2);
        let first = &merged[0];
        assert_eq!(first.source, SourceKind::PubMed);
        assert_eq!(first.ids.doi.as_deref(), Some("10.1/d"));
        assert_eq!(first.ids.openalex.as_deref(), Some("W4"));
        assert_eq!(first.cited_by_count, Some(11));
        assert_eq!(merged[1].ids.pmid.as_deref(), Some("401"));
    }

    #[test]
    fn test_merged_identifiers_are_unique() {
        let input = vec![
            record(SourceKind::PubMed, Some("1"), Some("10.1/a")),
            record(SourceKind::OpenAlex, None, Some("10.1/A")),
            record(SourceKind::PubMed, Some("2"), None),
            record(SourceKind::OpenAlex, Some("2"), Some("10.1/b")),
            record(SourceKind::OpenAlex, None, Some("10.1/c")),
        ];
        let merged = merge_records(input);
        assert_eq!(merged.len(), 3);

        let mut seen = HashSet::new();
        for r in &merged {
            for key in r.ids.identity_keys() {
                assert!(seen.insert(key.clone()), "duplicate identifier {key}");
            }
        }
    }
}
