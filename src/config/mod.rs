use serde::Deserialize;
use std::time::Duration;

use crate::services::embedding_queue::{FailurePolicy, JobRetention};
use crate::services::hub::HubSettings;

/// Configuration of the job server binary.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// Workers AI embedding model
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// How long finished embedding jobs stay pollable
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    /// Maximum number of embedding jobs kept in memory
    #[serde(default = "default_job_registry_capacity")]
    pub job_registry_capacity: usize,

    /// Highest failed/total ratio for which a job still counts as completed
    #[serde(default = "default_failure_tolerance")]
    pub embedding_failure_tolerance: f64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_embedding_model() -> String {
    "@cf/baai/bge-base-en-v1.5".to_string()
}

fn default_job_retention_secs() -> u64 {
    3600
}

fn default_job_registry_capacity() -> usize {
    256
}

fn default_failure_tolerance() -> f64 {
    1.0
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn job_retention(&self) -> JobRetention {
        JobRetention {
            capacity: self.job_registry_capacity.max(1),
            ttl: Duration::from_secs(self.job_retention_secs),
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            max_failure_ratio: self.embedding_failure_tolerance.clamp(0.0, 1.0),
        }
    }
}

/// Configuration of the stream client (`watch` binary).
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the hosted backend
    pub backend_url: String,

    /// Bearer token sent with stream and API requests
    #[serde(default)]
    pub api_token: Option<String>,

    /// Delay before the global status stream connects
    #[serde(default = "default_global_debounce_ms")]
    pub global_debounce_ms: u64,

    /// Silence on a check stream before falling back to polling
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,

    /// Interval of the fallback check poll; 0 disables it
    #[serde(default = "default_poll_interval_ms")]
    pub fallback_poll_interval_ms: u64,

    /// Interval between job status polls
    #[serde(default = "default_poll_interval_ms")]
    pub job_poll_interval_ms: u64,

    /// Address for a Prometheus scrape listener (e.g., "127.0.0.1:9101").
    /// Unset leaves stream metrics unexported.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_global_debounce_ms() -> u64 {
    300
}

fn default_stream_idle_timeout_secs() -> u64 {
    45
}

fn default_poll_interval_ms() -> u64 {
    1500
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            global_debounce: Duration::from_millis(self.global_debounce_ms),
            idle_timeout: Duration::from_secs(self.stream_idle_timeout_secs.max(1)),
            fallback_poll_interval: (self.fallback_poll_interval_ms > 0)
                .then(|| Duration::from_millis(self.fallback_poll_interval_ms)),
        }
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_config(vars: &[(&str, &str)]) -> ClientConfig {
        envy::from_iter(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn test_client_defaults() {
        let config = client_config(&[("BACKEND_URL", "http://backend.test")]);
        let settings = config.hub_settings();
        assert_eq!(settings.global_debounce, Duration::from_millis(300));
        assert_eq!(settings.idle_timeout, Duration::from_secs(45));
        assert_eq!(settings.fallback_poll_interval, Some(Duration::from_millis(1500)));
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn test_client_metrics_listener_and_disabled_polling() {
        let config = client_config(&[
            ("BACKEND_URL", "http://backend.test"),
            ("METRICS_ADDR", "127.0.0.1:9101"),
            ("FALLBACK_POLL_INTERVAL_MS", "0"),
        ]);
        assert_eq!(config.metrics_addr.as_deref(), Some("127.0.0.1:9101"));
        assert!(config.hub_settings().fallback_poll_interval.is_none());
    }
}
