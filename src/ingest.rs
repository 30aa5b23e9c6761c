//! Hand-off of resolved documents to a knowledge store.
//!
//! [`Ingestor`] is the boundary; [`JsonlIngestor`] appends one JSON line per
//! document to a manifest file so another process can load the store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::record::BibliographicRecord;

/// Errors produced while ingesting a document.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The store refused the document.
    #[error("document rejected: {0}")]
    Rejected(String),
}

impl IngestError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Metadata stored next to each document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestMetadata {
    pub year: Option<i32>,
    pub date_added: NaiveDate,
    pub authors: String,
    pub title: Option<String>,
    pub journal: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    /// Aspect name to `no` / `maybe` / `yes`.
    pub aspects: BTreeMap<String, String>,
    pub qualifies: Option<bool>,
    pub license: Option<String>,
}

impl IngestMetadata {
    #[must_use]
    pub fn from_record(record: &BibliographicRecord, date_added: NaiveDate) -> Self {
        Self {
            year: record.pub_year,
            date_added,
            authors: record.authors.join(", "),
            title: record.title.clone(),
            journal: record.journal.clone(),
            abstract_text: record.abstract_text.clone(),
            aspects: record
                .classification
                .as_ref()
                .map(crate::classify::Classification::flags)
                .unwrap_or_default(),
            qualifies: record.relevant,
            license: record.license.clone(),
        }
    }
}

/// Destination for resolved documents.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest(
        &self,
        record: &BibliographicRecord,
        document: &[u8],
        metadata: &IngestMetadata,
    ) -> Result<(), IngestError>;
}

#[derive(Debug, Serialize)]
struct ManifestLine<'a> {
    id: Option<String>,
    path: Option<&'a Path>,
    bytes: usize,
    #[serde(flatten)]
    metadata: &'a IngestMetadata,
}

/// Appends a JSON line per document to a manifest file.
#[derive(Debug)]
pub struct JsonlIngestor {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlIngestor {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Ingestor for JsonlIngestor {
    #[instrument(skip_all, fields(manifest = %self.path.display()))]
    async fn ingest(
        &self,
        record: &BibliographicRecord,
        document: &[u8],
        metadata: &IngestMetadata,
    ) -> Result<(), IngestError> {
        if document.is_empty() {
            return Err(IngestError::Rejected("empty document".to_string()));
        }
        let line = ManifestLine {
            id: record.dedupe_key(),
            path: record.fulltext_path.as_deref(),
            bytes: document.len(),
            metadata,
        };
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IngestError::io(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| IngestError::io(&self.path, e))?;
        file.write_all(&encoded)
            .await
            .map_err(|e| IngestError::io(&self.path, e))?;
        file.flush().await.map_err(|e| IngestError::io(&self.path, e))?;
        debug!(id = line.id.as_deref().unwrap_or_default(), "document ingested");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::classify::{AspectLabel, AspectPrediction, Classification};
    use crate::record::{RecordIds, SourceKind};

    fn record() -> BibliographicRecord {
        let mut record = BibliographicRecord::new(
            SourceKind::PubMed,
            RecordIds {
                pmid: Some("38000001".into()),
                ..RecordIds::default()
            },
        );
        record.title = Some("Sleep and dementia".into());
        record.authors = vec!["Smith J".into(), "Lee KH".into()];
        record.pub_year = Some(2024);
        record.classification = Some(Classification {
            aspects: vec![AspectPrediction {
                aspect: "P_AB".into(),
                label: AspectLabel::Yes,
                confidence: 0.9,
            }],
            qualifies: true,
        });
        record.relevant = Some(true);
        record.fulltext_path = Some(PathBuf::from("/docs/PMC1.pdf"));
        record
    }

    #[test]
    fn test_metadata_mirrors_record() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let meta = IngestMetadata::from_record(&record(), date);
        assert_eq!(meta.authors, "Smith J, Lee KH");
        assert_eq!(meta.year, Some(2024));
        assert_eq!(meta.qualifies, Some(true));
        assert_eq!(meta.aspects.get("P_AB").map(String::as_str), Some("yes"));
        assert_eq!(meta.date_added, date);
    }

    #[tokio::test]
    async fn test_jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = JsonlIngestor::new(dir.path().join("out").join("manifest.jsonl"));
        let rec = record();
        let meta = IngestMetadata::from_record(&rec, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());

        ingestor.ingest(&rec, b"%PDF-1.4", &meta).await.unwrap();
        ingestor.ingest(&rec, b"%PDF-1.4 again", &meta).await.unwrap();

        let text = std::fs::read_to_string(ingestor.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], "pmid:38000001");
        assert_eq!(lines[0]["bytes"], 8);
        assert_eq!(lines[0]["title"], "Sleep and dementia");
        assert_eq!(lines[1]["path"], "/docs/PMC1.pdf");
    }

    #[tokio::test]
    async fn test_empty_document_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = JsonlIngestor::new(dir.path().join("m.jsonl"));
        let rec = record();
        let meta = IngestMetadata::from_record(&rec, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let err = ingestor.ingest(&rec, b"", &meta).await.unwrap_err();
        assert!(matches!(err, IngestError::Rejected(_)));
    }
}
