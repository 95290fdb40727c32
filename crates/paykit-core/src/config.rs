use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Environment variable prefix, e.g. `PAYKIT__STRIPE__WEBHOOK_SECRET`
pub const ENV_PREFIX: &str = "PAYKIT";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stripe: Option<StripeConfig>,
    #[serde(default)]
    pub paypal: Option<PaypalConfig>,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_env(ENV_PREFIX)
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(environment(prefix))
            .build()?;

        let app: Self = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    /// Load configuration from file with environment overrides
    ///
    /// A missing file is not an error; environment variables alone may carry
    /// the whole configuration.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(environment(ENV_PREFIX))
            .build()?;

        let app: Self = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    /// Reject configurations the webhook pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stripe.is_none() && self.paypal.is_none() {
            return Err(CoreError::configuration(
                "at least one provider (stripe or paypal) must be configured",
            ));
        }

        if let Some(stripe) = &self.stripe {
            if stripe.webhook_secret.trim().is_empty() {
                return Err(CoreError::configuration("stripe.webhook_secret is empty"));
            }
        }

        if let Some(paypal) = &self.paypal {
            paypal.validate()?;
        }

        self.idempotency.validate()?;
        self.retry.validate()?;

        Ok(())
    }
}

fn environment(prefix: &str) -> Environment {
    Environment::with_prefix(prefix)
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("paypal.allowed_cert_hosts")
        .try_parsing(true)
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on a single webhook request, retries included
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }

    pub fn with_host(mut self, host: String) -> Self {
        self.host = host;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout_seconds() -> u64 {
    25
}

/// Stripe webhook configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StripeConfig {
    /// Endpoint signing secret (`whsec_...`)
    pub webhook_secret: String,
    /// Allowed clock skew for the signed timestamp; 0 disables the check
    #[serde(default = "default_timestamp_tolerance_seconds")]
    pub timestamp_tolerance_seconds: i64,
}

impl StripeConfig {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            timestamp_tolerance_seconds: default_timestamp_tolerance_seconds(),
        }
    }

    pub fn with_timestamp_tolerance(mut self, seconds: i64) -> Self {
        self.timestamp_tolerance_seconds = seconds;
        self
    }
}

fn default_timestamp_tolerance_seconds() -> i64 {
    300 // 5 minutes
}

/// PayPal webhook configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PaypalConfig {
    /// Webhook ID assigned by PayPal to this listener
    pub webhook_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_paypal_api_base_url")]
    pub api_base_url: String,
    /// Hosts a `paypal-cert-url` may point at
    #[serde(default = "default_allowed_cert_hosts")]
    pub allowed_cert_hosts: Vec<String>,
    /// Try the verify-webhook-signature API before manual verification
    #[serde(default = "default_true")]
    pub use_api_verification: bool,
}

impl PaypalConfig {
    pub fn new(webhook_id: impl Into<String>) -> Self {
        Self {
            webhook_id: webhook_id.into(),
            client_id: None,
            client_secret: None,
            api_base_url: default_paypal_api_base_url(),
            allowed_cert_hosts: default_allowed_cert_hosts(),
            use_api_verification: true,
        }
    }

    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_allowed_cert_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_cert_hosts = hosts;
        self
    }

    /// Client credentials when both halves are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some((id.as_str(), secret.as_str()))
            }
            _ => None,
        }
    }

    /// Whether the API verification strategy can run
    pub fn api_verification_enabled(&self) -> bool {
        self.use_api_verification && self.credentials().is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.webhook_id.trim().is_empty() {
            return Err(CoreError::configuration("paypal.webhook_id is empty"));
        }
        if self.client_id.is_some() != self.client_secret.is_some() {
            return Err(CoreError::configuration(
                "paypal.client_id and paypal.client_secret must be set together",
            ));
        }
        if self.allowed_cert_hosts.is_empty() {
            return Err(CoreError::configuration(
                "paypal.allowed_cert_hosts must not be empty",
            ));
        }
        Ok(())
    }
}

fn default_paypal_api_base_url() -> String {
    "https://api-m.paypal.com".to_string()
}

/// PayPal hosts that serve webhook signing certificates
pub fn default_allowed_cert_hosts() -> Vec<String> {
    vec![
        "api.paypal.com".to_string(),
        "api-m.paypal.com".to_string(),
        "api.sandbox.paypal.com".to_string(),
        "api-m.sandbox.paypal.com".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

/// Storage backend for processed-event bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyBackend {
    /// Single-process store; not shared between instances
    #[default]
    Memory,
    /// Shared Redis keystore for multi-instance deployments
    Redis,
}

/// Idempotency store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencySettings {
    #[serde(default)]
    pub backend: IdempotencyBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Lifetime of a processed record
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Lifetime of a failed record; redeliveries after this reprocess
    #[serde(default = "default_failed_ttl_seconds")]
    pub failed_ttl_seconds: u64,
    /// Lease on an in-progress claim
    #[serde(default = "default_claim_ttl_seconds")]
    pub claim_ttl_seconds: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl IdempotencySettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn failed_ttl(&self) -> Duration {
        Duration::from_secs(self.failed_ttl_seconds)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.ttl_seconds == 0 {
            return Err(CoreError::configuration("idempotency.ttl_seconds must be > 0"));
        }
        if self.claim_ttl_seconds == 0 {
            return Err(CoreError::configuration(
                "idempotency.claim_ttl_seconds must be > 0",
            ));
        }
        if self.max_entries == 0 {
            return Err(CoreError::configuration("idempotency.max_entries must be > 0"));
        }
        if self.backend == IdempotencyBackend::Redis
            && self.redis_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(CoreError::configuration(
                "idempotency.redis_url is required for the redis backend",
            ));
        }
        Ok(())
    }
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            backend: IdempotencyBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            ttl_seconds: default_ttl_seconds(),
            failed_ttl_seconds: default_failed_ttl_seconds(),
            claim_ttl_seconds: default_claim_ttl_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_key_prefix() -> String {
    "paykit:webhook:".to_string()
}

fn default_ttl_seconds() -> u64 {
    7 * 24 * 60 * 60 // 7 days
}

fn default_failed_ttl_seconds() -> u64 {
    300
}

fn default_claim_ttl_seconds() -> u64 {
    300
}

fn default_max_entries() -> usize {
    100_000
}

/// Retry settings for handler dispatch
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Only retry errors classified as transient
    #[serde(default = "default_true")]
    pub conditional: bool,
}

impl RetrySettings {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CoreError::configuration("retry.max_attempts must be >= 1"));
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(CoreError::configuration(
                "retry.backoff_multiplier must be a finite value >= 1",
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(CoreError::configuration(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        Ok(())
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            conditional: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
