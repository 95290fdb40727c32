//! Stripe webhook signatures
//!
//! Stripe signs `"{timestamp}.{body}"` with HMAC-SHA256 and sends
//! `stripe-signature: t=<unix>,v1=<hex>[,v1=<hex>...]`. Several `v1` entries
//! appear while a secret is being rolled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use paykit_core::{Clock, StripeConfig, SystemClock};
use sha2::Sha256;
use std::sync::Arc;

use super::{constant_time_compare, headers, SignatureVerifier, VerificationError, WebhookRequest};

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme accepted by the verifier
const SCHEME: &str = "v1";

const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

fn compute_signature(secret: &[u8], timestamp: i64, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Produces `stripe-signature` header values
pub struct StripeSigner {
    secret: Vec<u8>,
}

impl StripeSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Header value for a payload signed at `timestamp`
    pub fn sign(&self, payload: &[u8], timestamp: DateTime<Utc>) -> String {
        let ts = timestamp.timestamp();
        let signature = compute_signature(&self.secret, ts, payload).unwrap_or_default();
        format!("t={},{}={}", ts, SCHEME, signature)
    }

    pub fn sign_now(&self, payload: &[u8]) -> String {
        self.sign(payload, Utc::now())
    }
}

/// HMAC-SHA256 verifier for the `stripe-signature` header
pub struct StripeSignatureVerifier {
    secret: Vec<u8>,
    timestamp_tolerance_seconds: i64,
    clock: Arc<dyn Clock>,
}

impl StripeSignatureVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            timestamp_tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(config: &StripeConfig) -> Self {
        Self::new(&config.webhook_secret)
            .with_timestamp_tolerance(config.timestamp_tolerance_seconds)
    }

    /// Maximum clock difference in seconds; 0 disables the check
    pub fn with_timestamp_tolerance(mut self, seconds: i64) -> Self {
        self.timestamp_tolerance_seconds = seconds.max(0);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check `payload` against a `stripe-signature` header value
    pub fn verify_header(&self, payload: &[u8], header: &str) -> Result<(), VerificationError> {
        let (timestamp, signatures) = parse_signature_header(header)?;

        self.verify_timestamp(timestamp)?;

        let expected = compute_signature(&self.secret, timestamp, payload)
            .ok_or(VerificationError::SignatureMismatch)?;
        let matched = signatures
            .iter()
            .any(|candidate| constant_time_compare(candidate, &expected));

        if matched {
            Ok(())
        } else {
            Err(VerificationError::SignatureMismatch)
        }
    }

    fn verify_timestamp(&self, timestamp: i64) -> Result<(), VerificationError> {
        if self.timestamp_tolerance_seconds == 0 {
            return Ok(());
        }

        let now = self.clock.now().timestamp();
        let diff = now.saturating_sub(timestamp).saturating_abs();

        if diff > self.timestamp_tolerance_seconds {
            return Err(VerificationError::TimestampOutOfTolerance(diff));
        }

        Ok(())
    }
}

#[async_trait]
impl SignatureVerifier for StripeSignatureVerifier {
    fn name(&self) -> &str {
        "stripe-hmac"
    }

    async fn verify(&self, request: &WebhookRequest) -> Result<(), VerificationError> {
        let header = request.header(headers::STRIPE_SIGNATURE)?;
        self.verify_header(request.body(), header)
    }
}

/// Split `t=..,v1=..` into the timestamp and every `v1` signature
fn parse_signature_header(header: &str) -> Result<(i64, Vec<String>), VerificationError> {
    let invalid = |reason: &str| VerificationError::invalid_header(headers::STRIPE_SIGNATURE, reason);

    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .trim()
            .split_once('=')
            .ok_or_else(|| invalid("expected key=value pairs"))?;

        match key {
            "t" => {
                timestamp = Some(value.parse().map_err(|_| invalid("invalid timestamp"))?);
            }
            SCHEME => signatures.push(value.to_string()),
            // v0 and future schemes are ignored
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| invalid("missing timestamp"))?;
    if signatures.is_empty() {
        return Err(invalid("no v1 signature"));
    }

    Ok((timestamp, signatures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};
    use chrono::Duration;
    use paykit_core::ManualClock;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_sign_and_verify() {
        let signer = StripeSigner::new(SECRET);
        let verifier = StripeSignatureVerifier::new(SECRET);

        let payload = br#"{"id":"evt_1"}"#;
        let header = signer.sign_now(payload);

        assert!(header.starts_with("t="));
        assert!(verifier.verify_header(payload, &header).is_ok());
    }

    #[test]
    fn test_wrong_secret() {
        let signer = StripeSigner::new("whsec_one");
        let verifier = StripeSignatureVerifier::new("whsec_two");

        let header = signer.sign_now(b"payload");
        assert_eq!(
            verifier.verify_header(b"payload", &header),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn test_modified_payload() {
        let signer = StripeSigner::new(SECRET);
        let verifier = StripeSignatureVerifier::new(SECRET);

        let header = signer.sign_now(b"original payload");
        assert_eq!(
            verifier.verify_header(b"modified payload", &header),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn test_signature_is_byte_exact() {
        let signer = StripeSigner::new(SECRET);
        let verifier = StripeSignatureVerifier::new(SECRET);

        // Not valid UTF-8; must not be normalized before hashing.
        let payload = [0x7b, 0xff, 0xfe, 0x7d];
        let header = signer.sign_now(&payload);

        assert!(verifier.verify_header(&payload, &header).is_ok());
        assert!(verifier.verify_header(&[0x7b, 0xfd, 0xfe, 0x7d], &header).is_err());
    }

    #[test]
    fn test_expired_timestamp() {
        let signer = StripeSigner::new(SECRET);
        let verifier = StripeSignatureVerifier::new(SECRET).with_timestamp_tolerance(60);

        let header = signer.sign(b"payload", Utc::now() - Duration::seconds(120));
        assert!(matches!(
            verifier.verify_header(b"payload", &header),
            Err(VerificationError::TimestampOutOfTolerance(diff)) if diff >= 120
        ));
    }

    #[test]
    fn test_zero_tolerance_disables_check() {
        let clock = Arc::new(ManualClock::new());
        let signer = StripeSigner::new(SECRET);
        let verifier = StripeSignatureVerifier::new(SECRET)
            .with_timestamp_tolerance(0)
            .with_clock(clock.clone());

        let header = signer.sign(b"payload", clock.now());
        clock.advance(Duration::days(30));

        assert!(verifier.verify_header(b"payload", &header).is_ok());
    }

    #[test]
    fn test_any_v1_signature_matches() {
        let signer = StripeSigner::new(SECRET);
        let verifier = StripeSignatureVerifier::new(SECRET);
        let now = Utc::now();

        let header = signer.sign(b"payload", now);
        let valid = header.split(",v1=").nth(1).unwrap();
        let rotated = format!(
            "t={},v1={},v0=legacy,v1={}",
            now.timestamp(),
            "0".repeat(64),
            valid
        );

        assert!(verifier.verify_header(b"payload", &rotated).is_ok());
    }

    #[test]
    fn test_malformed_headers() {
        let verifier = StripeSignatureVerifier::new(SECRET);

        for header in ["", "garbage", "v1=abc", "t=abc,v1=abc", "t=1700000000"] {
            assert!(
                matches!(
                    verifier.verify_header(b"payload", header),
                    Err(VerificationError::InvalidHeader { .. })
                ),
                "header {header:?} should be invalid"
            );
        }
    }

    #[tokio::test]
    async fn test_verify_request() {
        let signer = StripeSigner::new(SECRET);
        let verifier = StripeSignatureVerifier::new(SECRET);
        let body = br#"{"id":"evt_1"}"#;

        let mut map = HeaderMap::new();
        map.insert(
            headers::STRIPE_SIGNATURE,
            HeaderValue::from_str(&signer.sign_now(body)).unwrap(),
        );

        assert!(verifier
            .verify(&WebhookRequest::new(body.to_vec(), map))
            .await
            .is_ok());

        let unsigned = WebhookRequest::new(body.to_vec(), HeaderMap::new());
        assert_eq!(
            verifier.verify(&unsigned).await,
            Err(VerificationError::MissingHeader("stripe-signature".to_string()))
        );
    }

    #[test]
    fn test_from_config() {
        let config = StripeConfig::new("whsec_cfg").with_timestamp_tolerance(30);
        let verifier = StripeSignatureVerifier::from_config(&config);

        assert_eq!(verifier.timestamp_tolerance_seconds, 30);
    }
}
