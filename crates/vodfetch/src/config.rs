use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Cumulative payload size above which segments are spilled to disk.
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 50 * 1024 * 1024;

/// HTTP client settings shared by every request of a run.
///
/// Built once and handed to [`crate::HttpSource::new`]; nothing here is
/// process-global, so independent configurations can coexist.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Timeout applied to each individual request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Headers sent with every request; custom entries override defaults
    pub headers: HeaderMap,

    pub danger_accept_invalid_certs: bool,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: 10,
        }
    }
}

impl DownloaderConfig {
    /// Merge custom headers over the default set. Custom values win for the
    /// same header name.
    pub fn with_headers(mut self, custom: HeaderMap) -> Self {
        for (name, value) in custom.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }

    /// Build the reqwest client every fetch of a run goes through.
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(&self.user_agent)
            .default_headers(self.headers.clone())
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .danger_accept_invalid_certs(self.danger_accept_invalid_certs);

        builder = if self.follow_redirects {
            builder.redirect(reqwest::redirect::Policy::limited(10))
        } else {
            builder.redirect(reqwest::redirect::Policy::none())
        };

        builder.build()
    }
}

// --- Scheduler Configuration ---
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Max concurrent segment downloads (default: 10)
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { concurrency: 10 }
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Retries after the first attempt (default: 3)
    pub max_retries: u32,
    /// Backoff unit: the wait before retry `k` is `k * retry_delay_unit`
    pub retry_delay_unit: Duration,
    /// Responses above this size are read chunk by chunk (default: 2MB)
    pub streaming_threshold_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_unit: Duration::from_secs(1),
            streaming_threshold_bytes: 2 * 1024 * 1024,
        }
    }
}

// --- Storage Configuration ---
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub memory_threshold: u64,
    /// Parent of the spill directory; the system temp dir when unset
    pub temp_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            temp_root: None,
        }
    }
}

// --- Decryption Configuration ---
#[derive(Debug, Clone)]
pub struct DecryptionConfig {
    /// Run AES on tokio's blocking pool instead of the async worker
    pub offload_to_blocking_pool: bool,
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self {
            offload_to_blocking_pool: true,
        }
    }
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub fetcher: FetcherConfig,
    pub storage: StorageConfig,
    pub decryption: DecryptionConfig,
}

impl EngineConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.scheduler.concurrency = concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.fetcher.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_unit(mut self, unit: Duration) -> Self {
        self.fetcher.retry_delay_unit = unit;
        self
    }

    pub fn with_memory_threshold(mut self, threshold: u64) -> Self {
        self.storage.memory_threshold = threshold;
        self
    }

    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage.temp_root = Some(root.into());
        self
    }
}
