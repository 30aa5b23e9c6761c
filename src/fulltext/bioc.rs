//! BioC structured full text (strategy 1 of the PMC chain).

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::{debug, instrument};

use super::{ResolutionState, Strategy, StrategyOutcome};
use crate::download::{HttpClient, RequestSpec};
use crate::record::BibliographicRecord;

/// Text and license extracted from a BioC document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredText {
    /// `section_type` and passage text per passage, passages separated by blank lines.
    pub text: String,
    pub license: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    License,
    SectionType,
    PassageText,
}

/// Parses a BioC XML collection.
///
/// # Errors
///
/// A description of the first XML error.
pub fn parse_bioc_xml(xml: &str) -> Result<StructuredText, String> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut capture: Option<(Capture, usize, String)> = None;

    let mut license: Option<String> = None;
    let mut passages: Vec<String> = Vec::new();
    let mut section: Option<String> = None;
    let mut passage_text = String::new();

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(element) => {
                let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                let parent = stack.last().map(String::as_str);
                let key = element
                    .try_get_attribute("key")
                    .map_err(|e| e.to_string())?
                    .map(|attr| attr.unescape_value().map(|v| v.into_owned()))
                    .transpose()
                    .map_err(|e| e.to_string())?;

                let wanted = match (parent, name.as_str(), key.as_deref()) {
                    (Some("document"), "infon", Some("license")) => Some(Capture::License),
                    (Some("passage"), "infon", Some("section_type")) => Some(Capture::SectionType),
                    (Some("passage"), "text", _) => Some(Capture::PassageText),
                    _ => None,
                };
                if name == "passage" {
                    section = None;
                    passage_text.clear();
                }
                stack.push(name);
                if capture.is_none()
                    && let Some(kind) = wanted
                {
                    capture = Some((kind, stack.len(), String::new()));
                }
            }
            Event::Text(text) => {
                if let Some((_, _, buffer)) = capture.as_mut() {
                    buffer.push_str(&text.unescape().map_err(|e| e.to_string())?);
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
                    && let Some((kind, _, value)) = capture.take()
                {
                    let value = value.trim().to_string();
                    match kind {
                        Capture::License if license.is_none() && !value.is_empty() => {
                            license = Some(value);
                        }
                        Capture::SectionType => section = Some(value),
                        Capture::PassageText => passage_text.push_str(&value),
                        Capture::License => {}
                    }
                }
                if element.name().as_ref() == b"passage" && !passage_text.is_empty() {
                    let block = match section.take() {
                        Some(section) if !section.is_empty() => format!("{section}\n{passage_text}"),
                        _ => passage_text.clone(),
                    };
                    passages.push(block);
                    passage_text.clear();
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(StructuredText {
        text: passages.join("\n\n"),
        license,
    })
}

/// Fetches BioC XML by PMCID (or PMID) and keeps its text for later strategies.
#[derive(Debug)]
pub struct StructuredTextStrategy {
    client: HttpClient,
    base_url: String,
}

impl StructuredTextStrategy {
    #[must_use]
    pub fn new(client: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Strategy for StructuredTextStrategy {
    fn name(&self) -> &'static str {
        "bioc_text"
    }

    #[instrument(skip(self, record, state), fields(id = record.ids.pmc_lookup_id()))]
    async fn attempt(&self, record: &BibliographicRecord, state: &mut ResolutionState) -> StrategyOutcome {
        let Some(id) = record.ids.pmc_lookup_id() else {
            return StrategyOutcome::HardFailure("record has no PMID or PMCID".to_string());
        };
        let url = format!("{}/BioC_xml/{id}/unicode", self.base_url);

        let response = match self.client.request(RequestSpec::get(&url)).await {
            Ok(response) => response,
            Err(e) => return StrategyOutcome::SoftFailure(format!("BioC unavailable: {e}")),
        };
        let parsed = match parse_bioc_xml(&response.text()) {
            Ok(parsed) => parsed,
            Err(reason) => return StrategyOutcome::SoftFailure(format!("BioC parse error: {reason}")),
        };
        if parsed.text.trim().is_empty() {
            return StrategyOutcome::SoftFailure("BioC document has no passages".to_string());
        }

        debug!(chars = parsed.text.len(), license = ?parsed.license, "stored BioC text");
        state.structured_text = Some(parsed.text);
        if parsed.license.is_some() {
            state.license.clone_from(&parsed.license);
            state.text_license = parsed.license;
        }
        StrategyOutcome::Advanced
    }
}
