//! Request header profiles for catalog APIs and document servers.
//!
//! Catalog APIs get a polite tool User-Agent carrying the contact address.
//! Document servers get a realistic browser profile, since many publishers
//! refuse obvious tool traffic.

use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/litharvest/litharvest";

/// Browser User-Agent sent to document servers and used by the headless browser.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";

const BROWSER_ACCEPT: &str = "application/pdf,application/octet-stream;q=0.9,*/*;q=0.8";
const BROWSER_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const BROWSER_ACCEPT_ENCODING: &str = "gzip, deflate, br";

/// Which header set a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProfile {
    /// Tool identification with a contact address.
    Api,
    /// Realistic browser headers.
    Browser,
}

/// User-Agent for catalog API traffic.
#[must_use]
pub fn api_user_agent(contact_email: &str) -> String {
    let version = env!("CARGO_PKG_VERSION");
    let contact = contact_email.trim();
    if contact.is_empty() {
        format!("litharvest/{version} (research-tool; +{PROJECT_UA_URL})")
    } else {
        format!("litharvest/{version} (research-tool; +{PROJECT_UA_URL}; mailto:{contact})")
    }
}

/// Builds the header map for `profile`.
///
/// Values that are not valid header text (for example a contact address with
/// control characters) are dropped rather than sent malformed.
#[must_use]
pub fn headers_for(profile: HeaderProfile, contact_email: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    match profile {
        HeaderProfile::Api => {
            insert(&mut headers, USER_AGENT, &api_user_agent(contact_email));
            insert(&mut headers, ACCEPT, "application/json, application/xml;q=0.9, */*;q=0.5");
        }
        HeaderProfile::Browser => {
            insert(&mut headers, USER_AGENT, BROWSER_USER_AGENT);
            insert(&mut headers, ACCEPT, BROWSER_ACCEPT);
            insert(&mut headers, ACCEPT_LANGUAGE, BROWSER_ACCEPT_LANGUAGE);
            insert(&mut headers, ACCEPT_ENCODING, BROWSER_ACCEPT_ENCODING);
            insert(&mut headers, HeaderName::from_static("dnt"), "1");
        }
    }
    headers
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
