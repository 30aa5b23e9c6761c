//! Runtime configuration.
//!
//! Sources, lowest precedence first: built-in defaults, a TOML file
//! (`--config <path>` or `$XDG_CONFIG_HOME/litharvest/config.toml`), a
//! `.env` file, process environment, then CLI flags applied by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::download::{DEFAULT_BROWSER_CONCURRENCY, DEFAULT_CONCURRENCY, MAX_CONCURRENCY};

pub const DEFAULT_EUTILS_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
pub const DEFAULT_BIOC_URL: &str = "https://www.ncbi.nlm.nih.gov/research/bionlp/RESTful/pmcoa.cgi";
pub const DEFAULT_OA_SERVICE_URL: &str = "https://www.ncbi.nlm.nih.gov/pmc/utils/oa/oa.fcgi";
pub const DEFAULT_OPENALEX_URL: &str = "https://api.openalex.org/works";
pub const DEFAULT_FTP_HOST: &str = "ftp.ncbi.nlm.nih.gov";

const CONFIG_DIR: &str = "litharvest";
const CONFIG_FILE: &str = "config.toml";
const MANIFEST_FILE: &str = "manifest.jsonl";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// NCBI requires a contact address on every E-utilities call.
    #[error("a contact email is required (set `contact_email` or NCBI_EMAIL)")]
    MissingContactEmail,

    #[error("invalid config value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("invalid URL for `{field}`: {value}")]
    InvalidUrl { field: &'static str, value: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Everything needed to build a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub contact_email: String,
    pub ncbi_api_key: Option<String>,
    /// OpenAlex polite-pool address; falls back to `contact_email`.
    pub openalex_mailto: Option<String>,

    pub eutils_base_url: String,
    pub bioc_base_url: String,
    pub oa_service_url: String,
    pub openalex_base_url: String,

    pub ftp_host: String,
    pub ftp_user: String,
    pub ftp_password: String,

    pub doc_dir: PathBuf,
    /// FTP read chunk in bytes.
    pub chunk_size: usize,
    pub headless: bool,
    pub browser_executable: Option<PathBuf>,

    pub download_concurrency: usize,
    pub browser_concurrency: usize,
    /// Minimum spacing between requests to one host; 0 disables pacing.
    pub rate_limit_ms: u64,
    pub request_timeout_secs: u64,
    /// Overrides the attempt count of the metadata retry preset.
    pub max_retries: Option<u32>,

    pub openalex_per_page: u32,
    pub openalex_page_delay_ms: u64,

    /// Classifier endpoint; every record qualifies when unset.
    pub classifier_url: Option<String>,
    /// Defaults to `<doc_dir>/manifest.jsonl`.
    pub manifest_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            contact_email: String::new(),
            ncbi_api_key: None,
            openalex_mailto: None,
            eutils_base_url: DEFAULT_EUTILS_URL.to_string(),
            bioc_base_url: DEFAULT_BIOC_URL.to_string(),
            oa_service_url: DEFAULT_OA_SERVICE_URL.to_string(),
            openalex_base_url: DEFAULT_OPENALEX_URL.to_string(),
            ftp_host: DEFAULT_FTP_HOST.to_string(),
            ftp_user: "anonymous".to_string(),
            ftp_password: "anonymous@".to_string(),
            doc_dir: PathBuf::from("documents"),
            chunk_size: 256 * 1024,
            headless: true,
            browser_executable: None,
            download_concurrency: DEFAULT_CONCURRENCY,
            browser_concurrency: DEFAULT_BROWSER_CONCURRENCY,
            rate_limit_ms: 340,
            request_timeout_secs: 60,
            max_retries: None,
            openalex_per_page: 25,
            openalex_page_delay_ms: 200,
            classifier_url: None,
            manifest_path: None,
        }
    }
}

impl Config {
    /// Loads file, `.env` and environment layers.
    ///
    /// An explicit path must exist; the default path is optional.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] or [`ConfigError::Parse`] for a bad file.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => debug!(error = %e, "ignoring unreadable .env"),
        }
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;
        info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Parses TOML text; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// The parser message for malformed TOML or unknown keys.
    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }

    /// Applies environment overrides read through `lookup`. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("NCBI_EMAIL") {
            self.contact_email = v;
        }
        if let Some(v) = get("NCBI_API_KEY") {
            self.ncbi_api_key = Some(v);
        }
        if let Some(v) = get("OPENALEX_MAILTO") {
            self.openalex_mailto = Some(v);
        }
        if let Some(v) = get("FTP_USER") {
            self.ftp_user = v;
        }
        if let Some(v) = get("FTP_PASSWORD") {
            self.ftp_password = v;
        }
        if let Some(v) = get("LITHARVEST_DOC_DIR") {
            self.doc_dir = PathBuf::from(v);
        }
        if let Some(v) = get("LITHARVEST_CLASSIFIER_URL") {
            self.classifier_url = Some(v);
        }
    }

    /// Checks values that would otherwise fail deep inside a run.
    ///
    /// # Errors
    ///
    /// The first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.contact_email.trim().is_empty() {
            return Err(ConfigError::MissingContactEmail);
        }
        for (field, value) in [
            ("download_concurrency", self.download_concurrency),
            ("browser_concurrency", self.browser_concurrency),
        ] {
            if !(1..=MAX_CONCURRENCY).contains(&value) {
                return Err(ConfigError::invalid(
                    field,
                    format!("{value}. Expected range: 1..={MAX_CONCURRENCY}"),
                ));
            }
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid("chunk_size", "must be positive"));
        }
        if self.rate_limit_ms > 60_000 {
            return Err(ConfigError::invalid(
                "rate_limit_ms",
                format!("{}. Expected range: 0..=60000", self.rate_limit_ms),
            ));
        }
        if !(1..=3600).contains(&self.request_timeout_secs) {
            return Err(ConfigError::invalid(
                "request_timeout_secs",
                format!("{}. Expected range: 1..=3600", self.request_timeout_secs),
            ));
        }
        if self.max_retries == Some(0) {
            return Err(ConfigError::invalid("max_retries", "must be at least 1"));
        }
        if !(1..=200).contains(&self.openalex_per_page) {
            return Err(ConfigError::invalid(
                "openalex_per_page",
                format!("{}. Expected range: 1..=200", self.openalex_per_page),
            ));
        }

        let mut urls = vec![
            ("eutils_base_url", self.eutils_base_url.as_str()),
            ("bioc_base_url", self.bioc_base_url.as_str()),
            ("oa_service_url", self.oa_service_url.as_str()),
            ("openalex_base_url", self.openalex_base_url.as_str()),
        ];
        if let Some(classifier) = self.classifier_url.as_deref() {
            urls.push(("classifier_url", classifier));
        }
        for (field, value) in urls {
            validate_http_url(field, value)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn openalex_contact(&self) -> &str {
        self.openalex_mailto.as_deref().unwrap_or(&self.contact_email)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_path
            .clone()
            .unwrap_or_else(|| self.doc_dir.join(MANIFEST_FILE))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    #[must_use]
    pub fn openalex_page_delay(&self) -> Duration {
        Duration::from_millis(self.openalex_page_delay_ms)
    }
}

fn validate_http_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        }),
    }
}

/// `$XDG_CONFIG_HOME/litharvest/config.toml`, else `$HOME/.config/...`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    config_path_from(|key| std::env::var_os(key).map(PathBuf::from))
}

fn config_path_from<F>(lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<PathBuf>,
{
    let base = lookup("XDG_CONFIG_HOME")
        .filter(|p| p.is_absolute())
        .or_else(|| lookup("HOME").map(|home| home.join(".config")))?;
    Some(base.join(CONFIG_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn valid() -> Config {
        Config {
            contact_email: "me@example.org".into(),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 262_144);
        assert_eq!(config.download_concurrency, 10);
        assert_eq!(config.browser_concurrency, 3);
        assert!(config.headless);
        assert_eq!(config.manifest_path(), PathBuf::from("documents/manifest.jsonl"));
    }

    #[test]
    fn test_toml_overrides_selected_keys() {
        let config = Config::from_toml_str(
            r#"
            contact_email = "lab@example.org"
            download_concurrency = 4
            doc_dir = "/srv/papers"
            classifier_url = "http://localhost:8000/classify"
            "#,
        )
        .unwrap();
        assert_eq!(config.contact_email, "lab@example.org");
        assert_eq!(config.download_concurrency, 4);
        assert_eq!(config.browser_concurrency, 3);
        assert_eq!(config.doc_dir, PathBuf::from("/srv/papers"));
        assert_eq!(config.eutils_base_url, DEFAULT_EUTILS_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::from_toml_str("concurrency = 3").unwrap_err();
        assert!(err.contains("concurrency"));
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "download_concurrency = \"ten\"").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { path: p, .. } if p == path));

        let missing = Config::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("NCBI_EMAIL", "env@example.org"),
            ("NCBI_API_KEY", "abc123"),
            ("FTP_USER", "  "),
            ("LITHARVEST_DOC_DIR", "/tmp/docs"),
        ]);
        let mut config = Config::default();
        config.apply_env_from(|k| env.get(k).map(ToString::to_string));

        assert_eq!(config.contact_email, "env@example.org");
        assert_eq!(config.ncbi_api_key.as_deref(), Some("abc123"));
        assert_eq!(config.ftp_user, "anonymous");
        assert_eq!(config.doc_dir, PathBuf::from("/tmp/docs"));
        assert_eq!(config.openalex_contact(), "env@example.org");
    }

    #[test]
    fn test_validate_missing_email() {
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::MissingContactEmail)
        ));
    }

    #[test]
    fn test_validate_zero_budget_and_chunk() {
        let config = Config {
            browser_concurrency: 0,
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "browser_concurrency",
                ..
            })
        ));

        let config = Config {
            chunk_size: 0,
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "chunk_size",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_bad_url() {
        let config = Config {
            oa_service_url: "not a url".into(),
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl {
                field: "oa_service_url",
                ..
            })
        ));

        let config = Config {
            classifier_url: Some("ftp://host/classify".into()),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_path_prefers_xdg() {
        let path = config_path_from(|k| match k {
            "XDG_CONFIG_HOME" => Some(PathBuf::from("/xdg")),
            "HOME" => Some(PathBuf::from("/home/u")),
            _ => None,
        });
        assert_eq!(path, Some(PathBuf::from("/xdg/litharvest/config.toml")));

        let path = config_path_from(|k| (k == "HOME").then(|| PathBuf::from("/home/u")));
        assert_eq!(path, Some(PathBuf::from("/home/u/.config/litharvest/config.toml")));
    }
}
