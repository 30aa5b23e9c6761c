//! Relevance classifier boundary.
//!
//! The classifier scores a title+abstract on five evidence aspects and gives a
//! final qualification flag. Three adapters are provided:
//! - [`BlockingClassifier`] runs a synchronous, CPU-bound model on the blocking pool
//! - [`HttpClassifier`] posts the text to a model server
//! - [`PassThroughClassifier`] qualifies everything (no model configured)

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::download::{DownloadError, HttpClient, RequestSpec};

/// Aspect keys scored by the classifier, in report order.
pub const ASPECTS: [&str; 5] = ["P_AB", "I_AB", "C_AB", "O_AB", "S_AB"];

/// Errors raised by a classifier adapter.
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// The model server could not be reached or answered with an error.
    #[error("classifier request failed: {0}")]
    Request(#[source] DownloadError),

    /// The model answered with something that is not a classification.
    #[error("classifier returned an unusable response: {0}")]
    InvalidResponse(String),

    /// The blocking worker panicked or was cancelled.
    #[error("classifier worker failed: {0}")]
    Worker(String),

    /// The model itself reported a failure.
    #[error("classifier model error: {0}")]
    Model(String),
}

/// Per-aspect label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectLabel {
    No,
    Maybe,
    Yes,
}

impl AspectLabel {
    /// Parses `no`/`maybe`/`yes` case-insensitively.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "no" => Some(Self::No),
            "maybe" => Some(Self::Maybe),
            "yes" => Some(Self::Yes),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Maybe => "maybe",
            Self::Yes => "yes",
        }
    }
}

/// Prediction for one aspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectPrediction {
    pub aspect: String,
    pub label: AspectLabel,
    pub confidence: f32,
}

/// Classifier verdict for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub aspects: Vec<AspectPrediction>,
    pub qualifies: bool,
}

impl Classification {
    /// Label for `aspect`, if the classifier scored it.
    #[must_use]
    pub fn label(&self, aspect: &str) -> Option<AspectLabel> {
        self.aspects
            .iter()
            .find(|p| p.aspect == aspect)
            .map(|p| p.label)
    }

    /// Builds a classification from the flat `{ASPECT}_pred` / `{ASPECT}_conf` / `final_pred` shape.
    ///
    /// Without `final_pred`, a record qualifies when no aspect is labelled `no`.
    ///
    /// # Errors
    ///
    /// [`ClassifyError::InvalidResponse`] when the value is not an object or a label is unknown.
    pub fn from_flat(value: &serde_json::Value) -> Result<Self, ClassifyError> {
        let object = value
            .as_object()
            .ok_or_else(|| ClassifyError::InvalidResponse("expected a JSON object".into()))?;

        let mut aspects = Vec::new();
        for aspect in ASPECTS {
            let Some(raw) = object.get(&format!("{aspect}_pred")) else {
                continue;
            };
            let label = raw
                .as_str()
                .and_then(AspectLabel::parse)
                .ok_or_else(|| ClassifyError::InvalidResponse(format!("bad label for {aspect}: {raw}")))?;
            #[allow(clippy::cast_possible_truncation)]
            let confidence = object
                .get(&format!("{aspect}_conf"))
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0) as f32;
            aspects.push(AspectPrediction {
                aspect: aspect.to_string(),
                label,
                confidence,
            });
        }

        let qualifies = match object.get("final_pred") {
            Some(serde_json::Value::Bool(flag)) => *flag,
            Some(serde_json::Value::String(label)) => AspectLabel::parse(label) == Some(AspectLabel::Yes),
            Some(other) => {
                return Err(ClassifyError::InvalidResponse(format!(
                    "bad final_pred: {other}"
                )));
            }
            None => {
                if aspects.is_empty() {
                    return Err(ClassifyError::InvalidResponse(
                        "no aspect predictions and no final_pred".into(),
                    ));
                }
                aspects.iter().all(|p| p.label != AspectLabel::No)
            }
        };

        Ok(Self { aspects, qualifies })
    }

    /// Flat map view used by ingestion metadata.
    #[must_use]
    pub fn flags(&self) -> BTreeMap<String, String> {
        self.aspects
            .iter()
            .map(|p| (p.aspect.clone(), p.label.as_str().to_string()))
            .collect()
    }
}

/// Scores a title+abstract.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Classifies `text`.
    async fn classify(&self, text: &str) -> Result<Classification, ClassifyError>;
}

type ModelFn = dyn Fn(&str) -> Result<Classification, ClassifyError> + Send + Sync;

/// Runs a synchronous model on tokio's blocking pool so the event loop stays free.
#[derive(Clone)]
pub struct BlockingClassifier {
    model: Arc<ModelFn>,
}

impl BlockingClassifier {
    /// Wraps a synchronous model function.
    pub fn new<F>(model: F) -> Self
    where
        F: Fn(&str) -> Result<Classification, ClassifyError> + Send + Sync + 'static,
    {
        Self {
            model: Arc::new(model),
        }
    }
}

impl std::fmt::Debug for BlockingClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClassifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl Classifier for BlockingClassifier {
    fn name(&self) -> &'static str {
        "blocking"
    }

    async fn classify(&self, text: &str) -> Result<Classification, ClassifyError> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || model(&text))
            .await
            .map_err(|e| ClassifyError::Worker(e.to_string()))?
    }
}

/// Posts `{"text": …}` to a model server returning the flat prediction map.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: HttpClient,
    endpoint: String,
}

impl HttpClassifier {
    #[must_use]
    pub fn new(client: HttpClient, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self, text), fields(endpoint = %self.endpoint, chars = text.len()))]
    async fn classify(&self, text: &str) -> Result<Classification, ClassifyError> {
        let spec = RequestSpec::post_json(&self.endpoint, serde_json::json!({ "text": text }));
        let response = self
            .client
            .request(spec)
            .await
            .map_err(ClassifyError::Request)?;
        let value: serde_json::Value = serde_json::from_slice(&response.body)
            .map_err(|e| ClassifyError::InvalidResponse(e.to_string()))?;
        let classification = Classification::from_flat(&value)?;
        debug!(qualifies = classification.qualifies, "classified");
        Ok(classification)
    }
}

/// Qualifies every record. Used when no model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughClassifier;

#[async_trait]
impl Classifier for PassThroughClassifier {
    fn name(&self) -> &'static str {
        "pass-through"
    }

    async fn classify(&self, _text: &str) -> Result<Classification, ClassifyError> {
        Ok(Classification {
            aspects: Vec::new(),
            qualifies: true,
        })
    }
}
