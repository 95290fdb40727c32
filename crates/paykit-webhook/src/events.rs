//! Verified payment events
//!
//! Provider payloads are normalized into a [`WebhookEvent`] carrying a closed
//! [`EventType`] tag. Events are only built from bodies whose signature has
//! already been checked.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::signature::VerificationError;

/// Payment provider that sent a webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Stripe,
    Paypal,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Paypal => "paypal",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-independent event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "payment.captured")]
    PaymentCaptured,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
    #[serde(rename = "checkout.completed")]
    CheckoutCompleted,
    #[serde(rename = "subscription.created")]
    SubscriptionCreated,
    #[serde(rename = "subscription.updated")]
    SubscriptionUpdated,
    #[serde(rename = "subscription.cancelled")]
    SubscriptionCancelled,
    #[serde(rename = "invoice.paid")]
    InvoicePaid,
    #[serde(rename = "invoice.payment_failed")]
    InvoicePaymentFailed,
    #[serde(rename = "dispute.created")]
    DisputeCreated,
    #[serde(rename = "dispute.resolved")]
    DisputeResolved,
    #[serde(rename = "unknown")]
    Unknown,
}

impl EventType {
    /// Every mapped type, `Unknown` excluded
    pub const ALL: [EventType; 11] = [
        Self::PaymentCaptured,
        Self::PaymentFailed,
        Self::PaymentRefunded,
        Self::CheckoutCompleted,
        Self::SubscriptionCreated,
        Self::SubscriptionUpdated,
        Self::SubscriptionCancelled,
        Self::InvoicePaid,
        Self::InvoicePaymentFailed,
        Self::DisputeCreated,
        Self::DisputeResolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentCaptured => "payment.captured",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentRefunded => "payment.refunded",
            Self::CheckoutCompleted => "checkout.completed",
            Self::SubscriptionCreated => "subscription.created",
            Self::SubscriptionUpdated => "subscription.updated",
            Self::SubscriptionCancelled => "subscription.cancelled",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::DisputeCreated => "dispute.created",
            Self::DisputeResolved => "dispute.resolved",
            Self::Unknown => "unknown",
        }
    }

    /// Map a Stripe `type` string
    pub fn from_stripe(raw: &str) -> Self {
        match raw {
            "payment_intent.succeeded" | "charge.succeeded" => Self::PaymentCaptured,
            "payment_intent.payment_failed" | "charge.failed" => Self::PaymentFailed,
            "charge.refunded" => Self::PaymentRefunded,
            "checkout.session.completed" => Self::CheckoutCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionCancelled,
            "invoice.paid" | "invoice.payment_succeeded" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "charge.dispute.created" => Self::DisputeCreated,
            "charge.dispute.closed" => Self::DisputeResolved,
            _ => Self::Unknown,
        }
    }

    /// Map a PayPal `event_type` string
    pub fn from_paypal(raw: &str) -> Self {
        match raw {
            "PAYMENT.CAPTURE.COMPLETED" | "PAYMENT.SALE.COMPLETED" => Self::PaymentCaptured,
            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => Self::PaymentFailed,
            "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.SALE.REFUNDED" => Self::PaymentRefunded,
            "CHECKOUT.ORDER.COMPLETED" | "CHECKOUT.ORDER.APPROVED" => Self::CheckoutCompleted,
            "BILLING.SUBSCRIPTION.CREATED" | "BILLING.SUBSCRIPTION.ACTIVATED" => {
                Self::SubscriptionCreated
            }
            "BILLING.SUBSCRIPTION.UPDATED" => Self::SubscriptionUpdated,
            "BILLING.SUBSCRIPTION.CANCELLED"
            | "BILLING.SUBSCRIPTION.EXPIRED"
            | "BILLING.SUBSCRIPTION.SUSPENDED" => Self::SubscriptionCancelled,
            "BILLING.SUBSCRIPTION.PAYMENT.FAILED" => Self::InvoicePaymentFailed,
            "CUSTOMER.DISPUTE.CREATED" => Self::DisputeCreated,
            "CUSTOMER.DISPUTE.RESOLVED" => Self::DisputeResolved,
            _ => Self::Unknown,
        }
    }

    pub fn from_provider(provider: Provider, raw: &str) -> Self {
        match provider {
            Provider::Stripe => Self::from_stripe(raw),
            Provider::Paypal => Self::from_paypal(raw),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified, normalized webhook event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    id: String,
    provider: Provider,
    event_type: EventType,
    raw_type: String,
    created_at: DateTime<Utc>,
    resource: serde_json::Value,
}

#[derive(Deserialize)]
struct StripeEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    #[serde(default)]
    data: Option<StripeData>,
}

#[derive(Deserialize)]
struct StripeData {
    #[serde(default)]
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct PaypalEnvelope {
    id: String,
    event_type: String,
    create_time: DateTime<Utc>,
    #[serde(default)]
    resource: serde_json::Value,
}

impl WebhookEvent {
    pub(crate) fn new(
        id: impl Into<String>,
        provider: Provider,
        raw_type: impl Into<String>,
        created_at: DateTime<Utc>,
        resource: serde_json::Value,
    ) -> Self {
        let raw_type = raw_type.into();
        Self {
            id: id.into(),
            provider,
            event_type: EventType::from_provider(provider, &raw_type),
            raw_type,
            created_at,
            resource,
        }
    }

    /// Parse a verified body in the provider's wire format
    pub(crate) fn parse(provider: Provider, body: &[u8]) -> Result<Self, VerificationError> {
        let event = match provider {
            Provider::Stripe => {
                let envelope: StripeEnvelope = serde_json::from_slice(body)
                    .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
                let created_at = Utc
                    .timestamp_opt(envelope.created, 0)
                    .single()
                    .ok_or_else(|| {
                        VerificationError::MalformedPayload(format!(
                            "invalid created timestamp {}",
                            envelope.created
                        ))
                    })?;
                let resource = envelope
                    .data
                    .map(|data| data.object)
                    .unwrap_or(serde_json::Value::Null);

                Self::new(envelope.id, provider, envelope.event_type, created_at, resource)
            }
            Provider::Paypal => {
                let envelope: PaypalEnvelope = serde_json::from_slice(body)
                    .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;

                Self::new(
                    envelope.id,
                    provider,
                    envelope.event_type,
                    envelope.create_time,
                    envelope.resource,
                )
            }
        };

        if event.id.trim().is_empty() {
            return Err(VerificationError::MalformedPayload(
                "event id is empty".to_string(),
            ));
        }
        if event.raw_type.trim().is_empty() {
            return Err(VerificationError::MalformedPayload(
                "event type is empty".to_string(),
            ));
        }

        Ok(event)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Deduplication key, scoped by provider since ids are only unique per
    /// provider
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.provider.as_str(), self.id)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// The provider's own type string
    pub fn raw_type(&self) -> &str {
        &self.raw_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Provider resource object (Stripe `data.object`, PayPal `resource`)
    pub fn resource(&self) -> &serde_json::Value {
        &self.resource
    }
}
