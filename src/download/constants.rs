//! Constants for the download module (timeouts, pacing, streaming).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-request timeout for API calls and document fetches.
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Warning threshold for cumulative pacing delay per host (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Default write chunk for streamed transfers (256 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Number of leading bytes inspected when sniffing a document signature.
pub const SNIFF_WINDOW: usize = 4096;
