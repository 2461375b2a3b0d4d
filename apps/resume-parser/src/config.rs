use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::messaging::ListenerSettings;
use crate::pipeline::PipelineSettings;
use crate::registry::RegistrySettings;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Service configuration loaded from environment variables.
/// Startup fails if a required variable is missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub nats_url: String,
    pub redis_url: Option<String>,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub anthropic_api_key: String,
    /// 64 hex chars; per-organization keys are derived from it.
    pub org_master_key: String,
    /// `None` entitles every organization.
    pub allowed_organizations: Option<HashSet<String>>,
    pub processing_node: String,
    pub port: u16,
    pub rust_log: String,
    pub listener: ListenerSettings,
    pub pipeline: PipelineSettings,
    pub breaker: CircuitBreakerConfig,
    pub registry: RegistrySettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);

        let listener_defaults = ListenerSettings::default();
        let listener = ListenerSettings {
            stream: env.or("NATS_STREAM", listener_defaults.stream.clone()),
            queue_group: env.or("NATS_QUEUE_GROUP", listener_defaults.queue_group.clone()),
            max_concurrent: env.parse_or("MAX_CONCURRENT_JOBS", listener_defaults.max_concurrent)?,
            ..listener_defaults
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env.parse_or("RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay: env.millis_or("RETRY_BASE_DELAY_MS", retry_defaults.base_delay)?,
            max_delay: env.millis_or("RETRY_MAX_DELAY_MS", retry_defaults.max_delay)?,
            ..retry_defaults
        };

        let pipeline_defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            max_file_size_bytes: env
                .parse_or("MAX_FILE_SIZE_BYTES", pipeline_defaults.max_file_size_bytes)?,
            retry,
            ..pipeline_defaults
        };

        let breaker_defaults = CircuitBreakerConfig::default();
        let breaker = CircuitBreakerConfig {
            failure_threshold: env
                .parse_or("BREAKER_FAILURE_THRESHOLD", breaker_defaults.failure_threshold)?,
            reset_timeout: env.secs_or("BREAKER_RESET_TIMEOUT_SECS", breaker_defaults.reset_timeout)?,
            monitor_window: env
                .secs_or("BREAKER_MONITOR_WINDOW_SECS", breaker_defaults.monitor_window)?,
        };

        let registry_defaults = RegistrySettings::default();
        let registry = RegistrySettings {
            processing_timeout: env
                .secs_or("PROCESSING_TIMEOUT_SECS", registry_defaults.processing_timeout)?,
            sweep_interval: env
                .secs_or("REGISTRY_SWEEP_INTERVAL_SECS", registry_defaults.sweep_interval)?,
            sweep_enabled: env.parse_or("REGISTRY_SWEEP_ENABLED", registry_defaults.sweep_enabled)?,
        };

        Ok(Config {
            nats_url: env.require("NATS_URL")?,
            redis_url: env.optional("REDIS_URL"),
            s3_bucket: env.require("S3_BUCKET")?,
            s3_endpoint: env.require("S3_ENDPOINT")?,
            aws_access_key_id: env.require("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: env.require("AWS_SECRET_ACCESS_KEY")?,
            anthropic_api_key: env.require("ANTHROPIC_API_KEY")?,
            org_master_key: env.require("ORG_MASTER_KEY")?,
            allowed_organizations: env
                .optional("ALLOWED_ORGANIZATIONS")
                .map(|list| parse_list(&list))
                .filter(|orgs| !orgs.is_empty()),
            processing_node: env
                .optional("PROCESSING_NODE")
                .unwrap_or_else(|| format!("node-{}", Uuid::new_v4())),
            port: env.parse_or("PORT", 8080)?,
            rust_log: env.or("RUST_LOG", "info".to_string()),
            listener,
            pipeline,
            breaker,
            registry,
        })
    }
}

fn parse_list(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    /// Set and non-blank.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.optional(key)
            .with_context(|| format!("Required environment variable '{key}' is not set"))
    }

    fn or(&self, key: &str, default: String) -> String {
        self.optional(key).unwrap_or(default)
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse::<T>()
                .with_context(|| format!("{key} has an invalid value '{raw}'")),
            None => Ok(default),
        }
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration> {
        let ms = self.parse_or(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }

    fn secs_or(&self, key: &str, default: Duration) -> Result<Duration> {
        let secs = self.parse_or(key, default.as_secs())?;
        Ok(Duration::from_secs(secs))
    }
}
