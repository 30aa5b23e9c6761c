//! PMC OA web service lookup (strategy 2 of the PMC chain).

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, instrument};

use super::transfer::TransferLink;
use super::{ResolutionState, Strategy, StrategyOutcome};
use crate::download::{HttpClient, RequestSpec, with_query};
use crate::record::BibliographicRecord;

/// Parsed OA service answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OaRecord {
    pub license: Option<String>,
    pub links: Vec<TransferLink>,
    /// Service-reported error, e.g. `idIsNotOpenAccess`.
    pub error: Option<String>,
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, String> {
    element
        .try_get_attribute(name)
        .map_err(|e| e.to_string())?
        .map(|attr| attr.unescape_value().map(|v| v.trim().to_string()))
        .transpose()
        .map_err(|e| e.to_string())
}

/// Parses the OA service XML (`<OA><records><record license=…><link …/>`).
///
/// The license is taken from the first record; links from every record.
///
/// # Errors
///
/// A description of the first XML error.
pub fn parse_oa_response(xml: &str) -> Result<OaRecord, String> {
    let mut reader = Reader::from_str(xml);
    let mut parsed = OaRecord::default();
    let mut seen_record = false;
    let mut in_error = false;
    let mut error_text = String::new();

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(element) | Event::Empty(element) => match element.name().as_ref() {
                b"record" => {
                    if !seen_record {
                        parsed.license = attribute(&element, "license")?.filter(|l| !l.is_empty());
                        seen_record = true;
                    }
                }
                b"link" => {
                    if let Some(href) = attribute(&element, "href")?.filter(|h| !h.is_empty()) {
                        parsed.links.push(TransferLink {
                            url: href,
                            format: attribute(&element, "format")?,
                        });
                    }
                }
                b"error" => {
                    in_error = true;
                    error_text = attribute(&element, "code")?.unwrap_or_default();
                }
                _ => {}
            },
            Event::Text(text) if in_error => {
                let text = text.unescape().map_err(|e| e.to_string())?;
                let text = text.trim();
                if !text.is_empty() {
                    if !error_text.is_empty() {
                        error_text.push_str(": ");
                    }
                    error_text.push_str(text);
                }
            }
            Event::End(element) if element.name().as_ref() == b"error" => {
                in_error = false;
                parsed.error = Some(std::mem::take(&mut error_text));
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(parsed)
}

/// Looks up package links and the license for a PMC article.
#[derive(Debug)]
pub struct OaLookupStrategy {
    client: HttpClient,
    service_url: String,
}

impl OaLookupStrategy {
    #[must_use]
    pub fn new(client: HttpClient, service_url: impl Into<String>) -> Self {
        Self {
            client,
            service_url: service_url.into(),
        }
    }
}

#[async_trait]
impl Strategy for OaLookupStrategy {
    fn name(&self) -> &'static str {
        "oa_lookup"
    }

    #[instrument(skip(self, record, state), fields(id = record.ids.pmc_lookup_id()))]
    async fn attempt(&self, record: &BibliographicRecord, state: &mut ResolutionState) -> StrategyOutcome {
        let Some(id) = record.ids.pmc_lookup_id() else {
            return StrategyOutcome::HardFailure("record has no PMID or PMCID".to_string());
        };
        let url = match with_query(&self.service_url, &[("id", id.to_string())]) {
            Ok(url) => url,
            Err(e) => return StrategyOutcome::SoftFailure(e.to_string()),
        };
        let response = match self.client.request(RequestSpec::get(url)).await {
            Ok(response) => response,
            Err(e) => return StrategyOutcome::SoftFailure(format!("OA service unavailable: {e}")),
        };
        let parsed = match parse_oa_response(&response.text()) {
            Ok(parsed) => parsed,
            Err(reason) => return StrategyOutcome::SoftFailure(format!("OA service parse error: {reason}")),
        };

        if parsed.links.is_empty() {
            let reason = parsed
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "no download links".to_string());
            return StrategyOutcome::SoftFailure(reason);
        }

        debug!(links = parsed.links.len(), license = ?parsed.license, "OA links found");
        if parsed.license.is_some() {
            state.license = parsed.license;
        }
        state.links = parsed.links;
        StrategyOutcome::Advanced
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_with_links() {
        let xml = r#"<OA><responseDate>2024-03-01 10:00:00</responseDate>
<request id="PMC1234567">https://www.ncbi.nlm.nih.gov/pmc/utils/oa/oa.fcgi?id=PMC1234567</request>
<records returned-count="1" total-count="1">
<record id="PMC1234567" citation="J Sleep. 2024" license="CC BY" retracted="no">
<link format="tgz" updated="2024-02-01" href="ftp://ftp.ncbi.nlm.nih.gov/pub/pmc/oa_package/8e/71/PMC1234567.tar.gz" />
<link format="pdf" updated="2024-02-01" href="ftp://ftp.ncbi.nlm.nih.gov/pub/pmc/oa_pdf/8e/71/article.pdf" />
</record></records></OA>"#;
        let parsed = parse_oa_response(xml).unwrap();
        assert_eq!(parsed.license.as_deref(), Some("CC BY"));
        assert_eq!(parsed.links.len(), 2);
        assert_eq!(parsed.links[0].format.as_deref(), Some("tgz"));
        assert!(parsed.links[1].url.ends_with("article.pdf"));
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_parse_not_open_access_error() {
        let xml = r#"<OA><responseDate>2024-03-01</responseDate><request id="PMC1">x</request>
<error code="idIsNotOpenAccess">identifier 'PMC1' is not Open Access</error></OA>"#;
        let parsed = parse_oa_response(xml).unwrap();
        assert!(parsed.links.is_empty());
        assert_eq!(
            parsed.error.as_deref(),
            Some("idIsNotOpenAccess: identifier 'PMC1' is not Open Access")
        );
    }
}
