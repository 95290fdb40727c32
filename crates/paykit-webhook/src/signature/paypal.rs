//! PayPal webhook signatures
//!
//! PayPal sends five `paypal-*` transmission headers. Two strategies check
//! them:
//! - [`PaypalApiVerifier`] asks PayPal's `verify-webhook-signature` endpoint
//! - [`PaypalCertVerifier`] rebuilds the signed message locally,
//!   `"{transmission_id}|{transmission_time}|{webhook_id}|{crc32(body)}"`, and
//!   checks it with the RSA public key from PayPal's signing certificate

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::sign::Verifier;
use openssl::x509::X509;
use parking_lot::Mutex;
use paykit_core::default_allowed_cert_hosts;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{headers, SignatureVerifier, VerificationError, WebhookRequest};

/// The only algorithm PayPal uses for webhook transmissions
pub const SUPPORTED_AUTH_ALGO: &str = "SHA256withRSA";

const VERIFICATION_SUCCESS: &str = "SUCCESS";

/// Refresh OAuth tokens this long before PayPal expires them
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Transmission headers of one PayPal delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaypalTransmission {
    pub transmission_id: String,
    pub transmission_time: String,
    pub transmission_sig: String,
    pub cert_url: String,
    pub auth_algo: String,
}

impl PaypalTransmission {
    pub fn from_request(request: &WebhookRequest) -> Result<Self, VerificationError> {
        Ok(Self {
            transmission_id: request.header(headers::PAYPAL_TRANSMISSION_ID)?.to_string(),
            transmission_time: request.header(headers::PAYPAL_TRANSMISSION_TIME)?.to_string(),
            transmission_sig: request.header(headers::PAYPAL_TRANSMISSION_SIG)?.to_string(),
            cert_url: request.header(headers::PAYPAL_CERT_URL)?.to_string(),
            auth_algo: request.header(headers::PAYPAL_AUTH_ALGO)?.to_string(),
        })
    }

    /// The string PayPal signed for this delivery
    pub fn signed_message(&self, webhook_id: &str, body: &[u8]) -> String {
        format!(
            "{}|{}|{}|{}",
            self.transmission_id,
            self.transmission_time,
            webhook_id,
            body_crc32(body)
        )
    }
}

/// IEEE CRC32 of the raw body
pub fn body_crc32(body: &[u8]) -> u32 {
    crc32fast::hash(body)
}

/// Source of PEM signing certificates
#[async_trait]
pub trait CertificateFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String, VerificationError>;
}

/// Downloads certificates over HTTPS on every call
#[derive(Debug, Clone)]
pub struct HttpCertificateFetcher {
    client: reqwest::Client,
}

impl HttpCertificateFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CertificateFetcher for HttpCertificateFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, VerificationError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| VerificationError::CertificateFetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerificationError::CertificateFetch(format!(
                "{} returned {}",
                url, status
            )));
        }

        response
            .text()
            .await
            .map_err(|e| VerificationError::CertificateFetch(e.to_string()))
    }
}

/// Local verification: CRC32 + RSA-SHA256 against PayPal's certificate
pub struct PaypalCertVerifier {
    webhook_id: String,
    allowed_hosts: Vec<String>,
    fetcher: Arc<dyn CertificateFetcher>,
}

impl PaypalCertVerifier {
    pub fn new(webhook_id: impl Into<String>, fetcher: Arc<dyn CertificateFetcher>) -> Self {
        Self {
            webhook_id: webhook_id.into(),
            allowed_hosts: default_allowed_cert_hosts(),
            fetcher,
        }
    }

    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_hosts = hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect();
        self
    }

    /// Only https URLs on an allowlisted host may supply the key
    pub fn validate_cert_url(&self, raw: &str) -> Result<Url, VerificationError> {
        let url = Url::parse(raw)
            .map_err(|_| VerificationError::UntrustedCertificateUrl(raw.to_string()))?;

        if url.scheme() != "https" {
            return Err(VerificationError::UntrustedCertificateUrl(raw.to_string()));
        }

        let host = url
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| VerificationError::UntrustedCertificateUrl(raw.to_string()))?;

        if !self.allowed_hosts.iter().any(|allowed| *allowed == host) {
            return Err(VerificationError::UntrustedCertificateUrl(raw.to_string()));
        }

        Ok(url)
    }

    fn load_certificate(pem: &str) -> Result<X509, VerificationError> {
        let cert = X509::from_pem(pem.as_bytes())
            .map_err(|e| VerificationError::CertificateFetch(format!("invalid certificate: {e}")))?;

        let now = Asn1Time::days_from_now(0)
            .map_err(|e| VerificationError::CertificateFetch(e.to_string()))?;
        let expired = cert
            .not_after()
            .compare(&now)
            .map_err(|e| VerificationError::CertificateFetch(e.to_string()))?
            == Ordering::Less;
        let not_yet_valid = cert
            .not_before()
            .compare(&now)
            .map_err(|e| VerificationError::CertificateFetch(e.to_string()))?
            == Ordering::Greater;

        if expired || not_yet_valid {
            return Err(VerificationError::CertificateFetch(
                "certificate is outside its validity period".to_string(),
            ));
        }

        Ok(cert)
    }
}

#[async_trait]
impl SignatureVerifier for PaypalCertVerifier {
    fn name(&self) -> &str {
        "paypal-certificate"
    }

    async fn verify(&self, request: &WebhookRequest) -> Result<(), VerificationError> {
        let transmission = PaypalTransmission::from_request(request)?;

        if !transmission.auth_algo.eq_ignore_ascii_case(SUPPORTED_AUTH_ALGO) {
            return Err(VerificationError::UnsupportedAlgorithm(transmission.auth_algo));
        }

        let signature = STANDARD
            .decode(transmission.transmission_sig.as_bytes())
            .map_err(|_| {
                VerificationError::invalid_header(headers::PAYPAL_TRANSMISSION_SIG, "not base64")
            })?;

        let url = self.validate_cert_url(&transmission.cert_url)?;
        let pem = self.fetcher.fetch(&url).await?;
        let cert = Self::load_certificate(&pem)?;

        let public_key = cert
            .public_key()
            .map_err(|e| VerificationError::CertificateFetch(e.to_string()))?;
        let message = transmission.signed_message(&self.webhook_id, request.body());

        let verified = Verifier::new(MessageDigest::sha256(), &public_key)
            .and_then(|mut verifier| {
                verifier.update(message.as_bytes())?;
                verifier.verify(&signature)
            })
            .unwrap_or(false);

        if verified {
            debug!(transmission_id = %transmission.transmission_id, "PayPal certificate signature verified");
            Ok(())
        } else {
            Err(VerificationError::SignatureMismatch)
        }
    }
}

#[derive(Debug, Serialize)]
struct VerifyWebhookSignatureRequest<'a> {
    auth_algo: &'a str,
    cert_url: &'a str,
    transmission_id: &'a str,
    transmission_sig: &'a str,
    transmission_time: &'a str,
    webhook_id: &'a str,
    /// Delivered bytes, embedded verbatim
    webhook_event: &'a RawValue,
}

#[derive(Debug, Deserialize)]
struct VerifyWebhookSignatureResponse {
    verification_status: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Verification through PayPal's `verify-webhook-signature` API
pub struct PaypalApiVerifier {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    webhook_id: String,
    token: Mutex<Option<CachedToken>>,
}

impl PaypalApiVerifier {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        webhook_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            webhook_id: webhook_id.into(),
            token: Mutex::new(None),
        }
    }

    fn cached_token(&self) -> Option<String> {
        self.token
            .lock()
            .as_ref()
            .filter(|token| Instant::now() < token.refresh_at)
            .map(|token| token.value.clone())
    }

    async fn access_token(&self) -> Result<String, VerificationError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| VerificationError::Unavailable(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerificationError::Unavailable(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: AccessTokenResponse = response
            .json()
            .await
            .map_err(|e| VerificationError::Unavailable(format!("invalid token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(0));
        *self.token.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });

        Ok(token.access_token)
    }
}

#[async_trait]
impl SignatureVerifier for PaypalApiVerifier {
    fn name(&self) -> &str {
        "paypal-api"
    }

    async fn verify(&self, request: &WebhookRequest) -> Result<(), VerificationError> {
        let transmission = PaypalTransmission::from_request(request)?;
        let webhook_event: &RawValue = serde_json::from_slice(request.body())
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;

        let token = self.access_token().await?;
        let body = VerifyWebhookSignatureRequest {
            auth_algo: &transmission.auth_algo,
            cert_url: &transmission.cert_url,
            transmission_id: &transmission.transmission_id,
            transmission_sig: &transmission.transmission_sig,
            transmission_time: &transmission.transmission_time,
            webhook_id: &self.webhook_id,
            webhook_event,
        };

        let response = self
            .client
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.base_url
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| VerificationError::Unavailable(format!("verification request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.token.lock().take();
        }
        if !status.is_success() {
            warn!(%status, transmission_id = %transmission.transmission_id, "PayPal verification API error");
            return Err(VerificationError::Unavailable(format!(
                "verification endpoint returned {status}"
            )));
        }

        let result: VerifyWebhookSignatureResponse = response.json().await.map_err(|e| {
            VerificationError::Unavailable(format!("invalid verification response: {e}"))
        })?;

        if result.verification_status == VERIFICATION_SUCCESS {
            debug!(transmission_id = %transmission.transmission_id, "PayPal API verified webhook");
            Ok(())
        } else {
            Err(VerificationError::SignatureMismatch)
        }
    }
}
