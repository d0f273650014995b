//! Readiness checks against the runtime HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::HealthError;
use crate::port::is_port_reachable;

/// Primary readiness endpoint.
pub const READINESS_PATH: &str = "/api/version";
/// Fallback listing endpoint, present in every runtime version.
pub const LISTING_PATH: &str = "/api/tags";

/// Result of a single readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub ready: bool,
    pub reason: String,
}

impl HealthReport {
    pub fn ready(reason: impl Into<String>) -> Self {
        Self {
            ready: true,
            reason: reason.into(),
        }
    }

    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: reason.into(),
        }
    }
}

/// A readiness probe with bounded retry.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Probe once.
    async fn check_once(&self) -> HealthReport;

    /// Delay between attempts in [`HealthCheck::check_with_retries`].
    fn retry_delay(&self) -> Duration;

    /// Probe up to `max_attempts` times, stopping at the first success.
    async fn check_with_retries(&self, max_attempts: u32) -> Result<(), HealthError> {
        let mut last_reason = String::from("no attempts made");

        for attempt in 1..=max_attempts {
            let report = self.check_once().await;
            if report.ready {
                debug!("Runtime ready on attempt {}/{}", attempt, max_attempts);
                return Ok(());
            }
            debug!(
                "Runtime not ready ({}/{}): {}",
                attempt, max_attempts, report.reason
            );
            last_reason = report.reason;

            if attempt < max_attempts {
                sleep(self.retry_delay()).await;
            }
        }

        Err(HealthError::Timeout {
            attempts: max_attempts,
            reason: last_reason,
        })
    }
}

/// HTTP readiness monitor for the runtime.
pub struct HealthMonitor {
    client: reqwest::Client,
    host: String,
    port: u16,
    base_url: String,
    probe_timeout: Duration,
    retry_delay: Duration,
}

impl HealthMonitor {
    pub fn new(config: &RuntimeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            host: config.host.clone(),
            port: config.port,
            base_url: config.base_url(),
            probe_timeout: config.probe_timeout,
            retry_delay: config.retry_delay,
        }
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_status(&self, path: &str) -> Result<u16, String> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .get(&url)
            .send()
            .await
            .map(|r| r.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl HealthCheck for HealthMonitor {
    async fn check_once(&self) -> HealthReport {
        if !is_port_reachable(&self.host, self.port, self.probe_timeout).await {
            return HealthReport::not_ready("port unreachable");
        }

        let primary = match self.get_status(READINESS_PATH).await {
            Ok(200) => return HealthReport::ready(format!("{} returned 200", READINESS_PATH)),
            Ok(status) => format!("{} returned {}", READINESS_PATH, status),
            Err(e) => format!("{} failed: {}", READINESS_PATH, e),
        };

        match self.get_status(LISTING_PATH).await {
            Ok(200) => HealthReport::ready(format!("{} returned 200", LISTING_PATH)),
            Ok(status) => {
                HealthReport::not_ready(format!("{}; {} returned {}", primary, LISTING_PATH, status))
            }
            Err(e) => HealthReport::not_ready(format!("{}; {} failed: {}", primary, LISTING_PATH, e)),
        }
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}
