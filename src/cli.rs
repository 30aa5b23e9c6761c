//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;
use litharvest::Config;

/// Harvest recent biomedical literature and its full text.
///
/// Searches PubMed and OpenAlex for works published in a recency window,
/// screens them with the configured classifier, resolves full-text
/// documents and writes the merged record set as JSON.
#[derive(Parser, Debug)]
#[command(name = "litharvest")]
#[command(author, version, about)]
pub struct Args {
    /// Free-text search query
    pub query: String,

    /// Window ends this many days ago
    #[arg(long, default_value_t = 30)]
    pub start_day: u32,

    /// Window spans this many days before its end
    #[arg(long, default_value_t = 1)]
    pub lookback_days: u32,

    /// Maximum records per catalog
    #[arg(short = 'n', long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..=10_000))]
    pub max_records: u64,

    /// Config file (defaults to $XDG_CONFIG_HOME/litharvest/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory documents are written to
    #[arg(long)]
    pub doc_dir: Option<PathBuf>,

    /// Maximum concurrent document downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub download_concurrency: Option<u8>,

    /// Maximum concurrent browser sessions (1-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub browser_concurrency: Option<u8>,

    /// Maximum attempts for metadata requests (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_retries: Option<u8>,

    /// Minimum delay between requests to same domain in milliseconds (0 to disable, max 60000)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: Option<u64>,

    /// Show the browser window during fallback fetches
    #[arg(long)]
    pub headed: bool,

    /// Write the record set here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Applies flags on top of file and environment settings.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(dir) = &self.doc_dir {
            config.doc_dir.clone_from(dir);
        }
        if let Some(n) = self.download_concurrency {
            config.download_concurrency = usize::from(n);
        }
        if let Some(n) = self.browser_concurrency {
            config.browser_concurrency = usize::from(n);
        }
        if let Some(n) = self.max_retries {
            config.max_retries = Some(u32::from(n));
        }
        if let Some(ms) = self.rate_limit {
            config.rate_limit_ms = ms;
        }
        if self.headed {
            config.headless = false;
        }
    }

    /// Log level used when `RUST_LOG` is unset.
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    pub fn max_records(&self) -> usize {
        usize::try_from(self.max_records).unwrap_or(usize::MAX)
    }
}
