//! Webhook signature verification
//!
//! Each provider is authenticated by an ordered chain of
//! [`SignatureVerifier`] strategies. Verification always runs against the
//! exact bytes received; parsing happens only after a strategy accepts them.

pub mod paypal;
pub mod stripe;

pub use self::paypal::{
    CertificateFetcher, HttpCertificateFetcher, PaypalApiVerifier, PaypalCertVerifier,
    PaypalTransmission,
};
pub use self::stripe::{StripeSignatureVerifier, StripeSigner};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::events::{Provider, WebhookEvent};
use paykit_core::{PaypalConfig, StripeConfig};

/// Header names read by the verifiers
pub mod headers {
    pub const STRIPE_SIGNATURE: &str = "stripe-signature";
    pub const PAYPAL_TRANSMISSION_ID: &str = "paypal-transmission-id";
    pub const PAYPAL_TRANSMISSION_TIME: &str = "paypal-transmission-time";
    pub const PAYPAL_TRANSMISSION_SIG: &str = "paypal-transmission-sig";
    pub const PAYPAL_CERT_URL: &str = "paypal-cert-url";
    pub const PAYPAL_AUTH_ALGO: &str = "paypal-auth-algo";

    /// Headers whose values are truncated in logs
    pub const SIGNATURE_HEADERS: &[&str] = &[STRIPE_SIGNATURE, PAYPAL_TRANSMISSION_SIG];
}

/// Characters of a signature value kept in logs
const LOGGED_SIGNATURE_CHARS: usize = 12;

/// Why a webhook was not accepted as authentic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("missing required header: {0}")]
    MissingHeader(String),

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("certificate fetch failed: {0}")]
    CertificateFetch(String),

    #[error("untrusted certificate URL: {0}")]
    UntrustedCertificateUrl(String),

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("timestamp outside tolerance: {0} seconds difference")]
    TimestampOutOfTolerance(i64),

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("verification service unavailable: {0}")]
    Unavailable(String),

    #[error("no verification strategy configured")]
    NoStrategies,
}

impl VerificationError {
    pub(crate) fn invalid_header(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Raw inbound webhook: body bytes exactly as received plus headers
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    body: Bytes,
    headers: HeaderMap,
}

impl WebhookRequest {
    pub fn new(body: impl Into<Bytes>, headers: HeaderMap) -> Self {
        Self {
            body: body.into(),
            headers,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Required header as a trimmed string
    pub fn header(&self, name: &str) -> Result<&str, VerificationError> {
        let value = self
            .headers
            .get(name)
            .ok_or_else(|| VerificationError::MissingHeader(name.to_string()))?;
        let value = value
            .to_str()
            .map_err(|_| VerificationError::invalid_header(name, "not visible ASCII"))?
            .trim();

        if value.is_empty() {
            return Err(VerificationError::MissingHeader(name.to_string()));
        }
        Ok(value)
    }

    /// Provider signature headers for audit logs, signatures truncated.
    /// Every other header is left out.
    pub fn header_context(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(name, _)| is_provider_header(name.as_str()))
            .map(|(name, value)| {
                let value = value.to_str().unwrap_or("<binary>");
                let value = if headers::SIGNATURE_HEADERS.contains(&name.as_str()) {
                    truncate_signature(value)
                } else {
                    value.to_string()
                };
                (name.as_str().to_string(), value)
            })
            .collect()
    }
}

fn is_provider_header(name: &str) -> bool {
    name == headers::STRIPE_SIGNATURE || name.starts_with("paypal-")
}

fn truncate_signature(value: &str) -> String {
    match value.char_indices().nth(LOGGED_SIGNATURE_CHARS) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}

/// One way of proving a webhook came from its provider
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Strategy name used in logs
    fn name(&self) -> &str;

    /// Accept or reject the request as authentic
    async fn verify(&self, request: &WebhookRequest) -> Result<(), VerificationError>;
}

/// Ordered verification chain for one provider
#[derive(Clone)]
pub struct WebhookAuthenticator {
    provider: Provider,
    strategies: Vec<Arc<dyn SignatureVerifier>>,
}

impl WebhookAuthenticator {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            strategies: Vec::new(),
        }
    }

    /// Append a strategy; strategies run in insertion order
    pub fn with_strategy(mut self, strategy: Arc<dyn SignatureVerifier>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Stripe chain: a single HMAC strategy
    pub fn stripe(config: &StripeConfig) -> Self {
        Self::new(Provider::Stripe)
            .with_strategy(Arc::new(StripeSignatureVerifier::from_config(config)))
    }

    /// PayPal chain: the verification API when credentials are configured,
    /// then local certificate verification
    pub fn paypal(config: &PaypalConfig, client: reqwest::Client) -> Self {
        let mut authenticator = Self::new(Provider::Paypal);

        if let Some((client_id, client_secret)) =
            config.credentials().filter(|_| config.api_verification_enabled())
        {
            authenticator = authenticator.with_strategy(Arc::new(PaypalApiVerifier::new(
                client.clone(),
                config.api_base_url.clone(),
                client_id,
                client_secret,
                config.webhook_id.clone(),
            )));
        }

        let fetcher = Arc::new(HttpCertificateFetcher::new(client));
        authenticator.with_strategy(Arc::new(
            PaypalCertVerifier::new(config.webhook_id.clone(), fetcher)
                .with_allowed_hosts(config.allowed_cert_hosts.clone()),
        ))
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Verify the request and parse it into an event.
    ///
    /// The first strategy that accepts wins. When every strategy rejects, the
    /// last error is returned. An empty chain rejects everything.
    pub async fn authenticate(
        &self,
        request: &WebhookRequest,
    ) -> Result<WebhookEvent, VerificationError> {
        if self.strategies.is_empty() {
            error!(provider = %self.provider, "No signature verification strategy configured");
            return Err(VerificationError::NoStrategies);
        }

        let mut last_error = VerificationError::NoStrategies;

        for strategy in &self.strategies {
            match strategy.verify(request).await {
                Ok(()) => {
                    debug!(
                        provider = %self.provider,
                        strategy = strategy.name(),
                        "Webhook signature verified"
                    );
                    return WebhookEvent::parse(self.provider, request.body()).map_err(|e| {
                        warn!(
                            provider = %self.provider,
                            error = %e,
                            "Verified webhook body could not be parsed"
                        );
                        e
                    });
                }
                Err(e) => {
                    warn!(
                        provider = %self.provider,
                        strategy = strategy.name(),
                        error = %e,
                        headers = ?request.header_context(),
                        "Webhook signature verification failed"
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

impl std::fmt::Debug for WebhookAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookAuthenticator")
            .field("provider", &self.provider)
            .field("strategies", &self.strategy_names())
            .finish()
    }
}

/// Constant-time string comparison to prevent timing attacks
pub(crate) fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedVerifier {
        name: &'static str,
        outcome: Result<(), VerificationError>,
        calls: AtomicUsize,
    }

    impl FixedVerifier {
        fn new(name: &'static str, outcome: Result<(), VerificationError>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SignatureVerifier for FixedVerifier {
        fn name(&self) -> &str {
            self.name
        }

        async fn verify(&self, _request: &WebhookRequest) -> Result<(), VerificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn stripe_request() -> WebhookRequest {
        let body = r#"{"id":"evt_1","type":"charge.succeeded","created":1700000000,"data":{"object":{}}}"#;
        WebhookRequest::new(body, HeaderMap::new())
    }

    #[tokio::test]
    async fn test_empty_chain_fails_closed() {
        let authenticator = WebhookAuthenticator::new(Provider::Stripe);
        let result = authenticator.authenticate(&stripe_request()).await;

        assert_eq!(result.unwrap_err(), VerificationError::NoStrategies);
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let primary = FixedVerifier::new("primary", Ok(()));
        let fallback = FixedVerifier::new("fallback", Ok(()));
        let authenticator = WebhookAuthenticator::new(Provider::Stripe)
            .with_strategy(primary.clone())
            .with_strategy(fallback.clone());

        let event = authenticator.authenticate(&stripe_request()).await.unwrap();

        assert_eq!(event.id(), "evt_1");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_after_failure() {
        let primary = FixedVerifier::new(
            "primary",
            Err(VerificationError::Unavailable("timeout".to_string())),
        );
        let fallback = FixedVerifier::new("fallback", Ok(()));
        let authenticator = WebhookAuthenticator::new(Provider::Stripe)
            .with_strategy(primary)
            .with_strategy(fallback.clone());

        assert!(authenticator.authenticate(&stripe_request()).await.is_ok());
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_surfaces_last_error() {
        let authenticator = WebhookAuthenticator::new(Provider::Paypal)
            .with_strategy(FixedVerifier::new(
                "api",
                Err(VerificationError::Unavailable("down".to_string())),
            ))
            .with_strategy(FixedVerifier::new("cert", Err(VerificationError::SignatureMismatch)));

        let result = authenticator.authenticate(&stripe_request()).await;
        assert_eq!(result.unwrap_err(), VerificationError::SignatureMismatch);
    }

    #[tokio::test]
    async fn test_verified_but_malformed_body() {
        let authenticator = WebhookAuthenticator::new(Provider::Stripe)
            .with_strategy(FixedVerifier::new("ok", Ok(())));
        let request = WebhookRequest::new("[]", HeaderMap::new());

        assert!(matches!(
            authenticator.authenticate(&request).await,
            Err(VerificationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_paypal_chain_from_config() {
        let without_credentials = WebhookAuthenticator::paypal(
            &PaypalConfig::new("WH-1"),
            reqwest::Client::new(),
        );
        assert_eq!(without_credentials.strategy_names(), vec!["paypal-certificate"]);

        let with_credentials = WebhookAuthenticator::paypal(
            &PaypalConfig::new("WH-1").with_credentials("id", "secret"),
            reqwest::Client::new(),
        );
        assert_eq!(
            with_credentials.strategy_names(),
            vec!["paypal-api", "paypal-certificate"]
        );

        let stripe = WebhookAuthenticator::stripe(&StripeConfig::new("whsec_1"));
        assert_eq!(stripe.provider(), Provider::Stripe);
        assert_eq!(stripe.strategy_names(), vec!["stripe-hmac"]);
    }

    #[test]
    fn test_header_lookup() {
        let mut map = HeaderMap::new();
        map.insert(headers::PAYPAL_AUTH_ALGO, HeaderValue::from_static(" SHA256withRSA "));
        map.insert(headers::PAYPAL_CERT_URL, HeaderValue::from_static(""));
        let request = WebhookRequest::new("{}", map);

        assert_eq!(request.header(headers::PAYPAL_AUTH_ALGO).unwrap(), "SHA256withRSA");
        assert!(matches!(
            request.header(headers::PAYPAL_CERT_URL),
            Err(VerificationError::MissingHeader(_))
        ));
        assert!(matches!(
            request.header(headers::PAYPAL_TRANSMISSION_ID),
            Err(VerificationError::MissingHeader(_))
        ));
    }

    #[test]
    fn test_header_context_truncates_signatures() {
        let mut map = HeaderMap::new();
        map.insert(
            headers::PAYPAL_TRANSMISSION_SIG,
            HeaderValue::from_static("c2lnbmF0dXJlLXRoYXQtaXMtbG9uZw=="),
        );
        map.insert(headers::PAYPAL_TRANSMISSION_ID, HeaderValue::from_static("tx-1"));
        let request = WebhookRequest::new("{}", map);

        let context = request.header_context();
        let sig = context
            .iter()
            .find(|(name, _)| name == headers::PAYPAL_TRANSMISSION_SIG)
            .map(|(_, v)| v.as_str());
        let id = context
            .iter()
            .find(|(name, _)| name == headers::PAYPAL_TRANSMISSION_ID)
            .map(|(_, v)| v.as_str());

        assert_eq!(sig, Some("c2lnbmF0dXJl..."));
        assert_eq!(id, Some("tx-1"));
    }

    #[test]
    fn test_header_context_skips_unrelated_headers() {
        let mut map = HeaderMap::new();
        map.insert("authorization", HeaderValue::from_static("Bearer secret-token"));
        map.insert("cookie", HeaderValue::from_static("session=abc"));
        map.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        map.insert(headers::STRIPE_SIGNATURE, HeaderValue::from_static("t=1,v1=abc"));
        map.insert(headers::PAYPAL_AUTH_ALGO, HeaderValue::from_static("SHA256withRSA"));
        let request = WebhookRequest::new("{}", map);

        let mut names: Vec<String> = request
            .header_context()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();

        assert_eq!(names, vec![headers::PAYPAL_AUTH_ALGO, headers::STRIPE_SIGNATURE]);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "ab"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
