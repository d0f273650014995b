//! Runtime supervisor configuration.

use std::time::Duration;

use reqwest::Url;
use tracing::warn;

use crate::paths::InstallLayout;
use crate::{DEFAULT_HOST, DEFAULT_MODEL, DEFAULT_PORT};

/// Environment variable overriding the runtime endpoint URL.
pub const ENDPOINT_ENV: &str = "KEEPER_ENDPOINT";
/// Environment variable overriding the default model name.
pub const MODEL_ENV: &str = "KEEPER_MODEL";
/// Environment variable carrying an expected archive SHA-256.
pub const ARCHIVE_SHA256_ENV: &str = "KEEPER_ARCHIVE_SHA256";

/// Variable the runtime itself reads to know which address to serve on / talk to.
pub const RUNTIME_HOST_ENV: &str = "OLLAMA_HOST";

/// Configuration for the runtime supervisor.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Host the runtime listens on.
    pub host: String,
    /// Port the runtime listens on.
    pub port: u16,
    /// Model used when callers don't name one.
    pub default_model: String,
    /// Install location; `None` means the platform default.
    pub layout: Option<InstallLayout>,
    /// Download URL override for the release archive.
    pub archive_url: Option<String>,
    /// Expected SHA-256 of the release archive (hex).
    pub archive_sha256: Option<String>,
    /// TCP reachability timeout.
    pub probe_timeout: Duration,
    /// Timeout for readiness HTTP requests.
    pub http_timeout: Duration,
    /// Delay between readiness attempts.
    pub retry_delay: Duration,
    /// Attempts when checking for an already-running service.
    pub ready_attempts: u32,
    /// Attempts after starting the service ourselves.
    pub start_attempts: u32,
    /// How long to wait after a graceful stop before killing.
    pub graceful_stop_timeout: Duration,
    /// How long to wait after a forced kill.
    pub forced_stop_timeout: Duration,
    /// How long to let a child run before checking for an early exit.
    pub early_exit_grace: Duration,
    /// Wait between graceful and forced signals for stale processes.
    pub conflict_kill_grace: Duration,
    /// How long to wait for a freed port.
    pub port_release_timeout: Duration,
    /// Timeout for the listing subcommand.
    pub list_timeout: Duration,
    /// Upper bound for a model pull.
    pub pull_timeout: Duration,
    /// Connect timeout for the archive download.
    pub download_connect_timeout: Duration,
    /// Overall timeout for the archive download.
    pub download_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            default_model: DEFAULT_MODEL.to_string(),
            layout: None,
            archive_url: None,
            archive_sha256: None,
            probe_timeout: Duration::from_secs(2),
            http_timeout: Duration::from_secs(3),
            retry_delay: Duration::from_secs(1),
            ready_attempts: 2,
            start_attempts: 30,
            graceful_stop_timeout: Duration::from_secs(5),
            forced_stop_timeout: Duration::from_secs(1),
            early_exit_grace: Duration::from_millis(500),
            conflict_kill_grace: Duration::from_secs(1),
            port_release_timeout: Duration::from_secs(10),
            list_timeout: Duration::from_secs(10),
            pull_timeout: Duration::from_secs(60 * 60),
            download_connect_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl RuntimeConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            match parse_endpoint(&endpoint) {
                Some((host, port)) => {
                    config.host = host;
                    config.port = port;
                }
                None => warn!("Ignoring invalid {}: {}", ENDPOINT_ENV, endpoint),
            }
        }

        if let Ok(model) = std::env::var(MODEL_ENV) {
            if !model.trim().is_empty() {
                config.default_model = model.trim().to_string();
            }
        }

        config.archive_sha256 = std::env::var(ARCHIVE_SHA256_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim().to_lowercase());

        config
    }

    /// Create a builder for configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Base URL of the runtime HTTP API.
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    /// Value for the runtime's own host variable.
    pub fn runtime_host_value(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parse an endpoint URL into host and port.
///
/// Missing ports fall back to [`DEFAULT_PORT`]; bare `host:port` values are accepted too.
pub fn parse_endpoint(raw: &str) -> Option<(String, u16)> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.trim_matches(|c| c == '[' || c == ']');
    if host.is_empty() {
        return None;
    }
    let port = url.port().unwrap_or(DEFAULT_PORT);
    Some((host.to_string(), port))
}

/// Builder for runtime configuration.
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.config.default_model = model.into();
        self
    }

    pub fn layout(mut self, layout: InstallLayout) -> Self {
        self.config.layout = Some(layout);
        self
    }

    pub fn archive_url(mut self, url: impl Into<String>) -> Self {
        self.config.archive_url = Some(url.into());
        self
    }

    pub fn archive_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.config.archive_sha256 = Some(sha256.into());
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.config.http_timeout = timeout;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn ready_attempts(mut self, attempts: u32) -> Self {
        self.config.ready_attempts = attempts;
        self
    }

    pub fn start_attempts(mut self, attempts: u32) -> Self {
        self.config.start_attempts = attempts;
        self
    }

    pub fn graceful_stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.graceful_stop_timeout = timeout;
        self
    }

    pub fn forced_stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.forced_stop_timeout = timeout;
        self
    }

    pub fn early_exit_grace(mut self, grace: Duration) -> Self {
        self.config.early_exit_grace = grace;
        self
    }

    pub fn conflict_kill_grace(mut self, grace: Duration) -> Self {
        self.config.conflict_kill_grace = grace;
        self
    }

    pub fn port_release_timeout(mut self, timeout: Duration) -> Self {
        self.config.port_release_timeout = timeout;
        self
    }

    pub fn list_timeout(mut self, timeout: Duration) -> Self {
        self.config.list_timeout = timeout;
        self
    }

    pub fn pull_timeout(mut self, timeout: Duration) -> Self {
        self.config.pull_timeout = timeout;
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.base_url(), "http://127.0.0.1:11434");
        assert_eq!(config.default_model, DEFAULT_MODEL);
        assert_eq!(config.ready_attempts, 2);
        assert_eq!(config.start_attempts, 30);
        assert_eq!(config.graceful_stop_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("http://localhost:8080"),
            Some(("localhost".to_string(), 8080))
        );
        assert_eq!(
            parse_endpoint("10.0.0.5:9000"),
            Some(("10.0.0.5".to_string(), 9000))
        );
        assert_eq!(
            parse_endpoint("http://example.internal"),
            Some(("example.internal".to_string(), DEFAULT_PORT))
        );
        assert_eq!(parse_endpoint("http://[::1]:7000"), Some(("::1".to_string(), 7000)));
        assert_eq!(parse_endpoint("http://"), None);
    }

    #[test]
    fn test_ipv6_urls() {
        let config = RuntimeConfig::builder().host("::1").port(7000).build();
        assert_eq!(config.base_url(), "http://[::1]:7000");
        assert_eq!(config.runtime_host_value(), "[::1]:7000");
    }

    #[test]
    fn test_builder_pattern() {
        let config = RuntimeConfig::builder()
            .host("localhost")
            .port(12000)
            .default_model("demo-model")
            .start_attempts(5)
            .retry_delay(Duration::from_millis(10))
            .build();
        assert_eq!(config.base_url(), "http://localhost:12000");
        assert_eq!(config.runtime_host_value(), "localhost:12000");
        assert_eq!(config.default_model, "demo-model");
        assert_eq!(config.start_attempts, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(10));
    }
}
