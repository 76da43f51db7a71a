use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default user agent sent with every request unless the caller overrides it
/// through the per-task header set.
pub const DEFAULT_USER_AGENT: &str = concat!("m3u8dl-engine/", env!("CARGO_PKG_VERSION"));

// --- HTTP client configuration ---
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout covering the response body read.
    pub read_timeout: Duration,
    /// Redirect chain bound.
    pub max_redirects: usize,
    /// Idle connections kept per host. The effective pool is sized to
    /// `max(pool_max_idle_per_host, worker concurrency cap)` so raising the
    /// thread budget never starves the client.
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_redirects: 8,
            pool_max_idle_per_host: 16,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

// --- Worker pool configuration ---
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hard upper bound on per-task concurrency regardless of the requested
    /// thread budget.
    pub concurrency_cap: usize,
    /// Per-segment retry behavior.
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 64,
            retry: RetryPolicy::default(),
        }
    }
}

// --- Muxer configuration ---
#[derive(Debug, Clone, Default)]
pub struct MuxerConfig {
    /// Explicit ffmpeg binary path. Falls back to the `FFMPEG_PATH`
    /// environment variable, then to `ffmpeg` on `PATH`.
    pub ffmpeg_path: Option<String>,
}

// --- Top-level configuration ---
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub http: HttpConfig,
    pub worker: WorkerConfig,
    pub muxer: MuxerConfig,
}

impl EngineConfig {
    pub fn with_ffmpeg_path(mut self, path: impl Into<String>) -> Self {
        self.muxer.ffmpeg_path = Some(path.into());
        self
    }

    pub fn with_concurrency_cap(mut self, cap: usize) -> Self {
        self.worker.concurrency_cap = cap.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.worker.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.http.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.http.read_timeout, Duration::from_secs(30));
        assert_eq!(config.http.max_redirects, 8);
        assert_eq!(config.worker.retry.max_retries, 6);
    }

    #[test]
    fn concurrency_cap_never_drops_to_zero() {
        let config = EngineConfig::default().with_concurrency_cap(0);
        assert_eq!(config.worker.concurrency_cap, 1);
    }
}
