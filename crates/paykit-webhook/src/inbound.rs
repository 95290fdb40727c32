//! Inbound webhook endpoints
//!
//! Mounts one POST route per configured provider and maps each
//! [`WebhookResult`] to the status code that drives provider redelivery:
//! 200 stops it, 400 and 500 keep it going.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::Provider;
use crate::processor::{ProcessingOutcome, StatsSnapshot, WebhookProcessor, WebhookResult};
use crate::signature::WebhookRequest;

pub const STRIPE_PATH: &str = "/webhooks/stripe";
pub const PAYPAL_PATH: &str = "/webhooks/paypal";
pub const STATS_PATH: &str = "/webhooks/stats";

/// Processors to expose over HTTP
#[derive(Debug, Clone, Default)]
pub struct WebhookRoutes {
    stripe: Option<Arc<WebhookProcessor>>,
    paypal: Option<Arc<WebhookProcessor>>,
    request_timeout: Option<Duration>,
}

impl WebhookRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stripe(mut self, processor: Arc<WebhookProcessor>) -> Self {
        self.stripe = Some(processor);
        self
    }

    pub fn with_paypal(mut self, processor: Arc<WebhookProcessor>) -> Self {
        self.paypal = Some(processor);
        self
    }

    /// Cancel retries still pending after `timeout`
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    fn processors(&self) -> Vec<(Provider, Arc<WebhookProcessor>)> {
        [
            (Provider::Stripe, self.stripe.clone()),
            (Provider::Paypal, self.paypal.clone()),
        ]
        .into_iter()
        .filter_map(|(provider, processor)| processor.map(|p| (provider, p)))
        .collect()
    }
}

#[derive(Clone)]
struct ProviderEndpoint {
    provider: Provider,
    processor: Arc<WebhookProcessor>,
    request_timeout: Option<Duration>,
}

#[derive(Clone)]
struct StatsState {
    processors: Vec<(Provider, Arc<WebhookProcessor>)>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    providers: BTreeMap<&'static str, StatsSnapshot>,
}

/// Create Axum router for inbound webhooks
pub fn create_webhook_router(routes: WebhookRoutes) -> Router {
    let mut router = Router::new();

    for (provider, processor) in routes.processors() {
        let path = match provider {
            Provider::Stripe => STRIPE_PATH,
            Provider::Paypal => PAYPAL_PATH,
        };
        info!(provider = %provider, path, "Mounting webhook endpoint");

        let endpoint = ProviderEndpoint {
            provider,
            processor,
            request_timeout: routes.request_timeout,
        };
        router = router.route(path, post(handle_webhook).with_state(endpoint));
    }

    let stats = StatsState {
        processors: routes.processors(),
    };
    router.route(STATS_PATH, get(webhook_stats).with_state(stats))
}

/// HTTP status for a processing result
pub fn status_for(result: &WebhookResult) -> StatusCode {
    match result.outcome {
        ProcessingOutcome::Processed | ProcessingOutcome::Duplicate => StatusCode::OK,
        ProcessingOutcome::Rejected => StatusCode::BAD_REQUEST,
        ProcessingOutcome::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_webhook(
    State(endpoint): State<ProviderEndpoint>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let request = WebhookRequest::new(body, headers);
    let cancel = CancellationToken::new();

    let processing = endpoint.processor.process(&request, &cancel);
    tokio::pin!(processing);

    let result = match endpoint.request_timeout {
        Some(timeout) => {
            tokio::select! {
                result = &mut processing => result,
                _ = tokio::time::sleep(timeout) => {
                    warn!(
                        provider = %endpoint.provider,
                        timeout_ms = timeout.as_millis() as u64,
                        "Webhook request timed out, cancelling pending retries"
                    );
                    cancel.cancel();
                    processing.await
                }
            }
        }
        None => processing.await,
    };

    (status_for(&result), Json(result))
}

async fn webhook_stats(State(state): State<StatsState>) -> impl IntoResponse {
    let providers = state
        .processors
        .iter()
        .map(|(provider, processor)| (provider.as_str(), processor.stats()))
        .collect();

    Json(StatsResponse { providers })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: ProcessingOutcome) -> WebhookResult {
        WebhookResult {
            success: outcome.is_success(),
            event_id: "evt_1".to_string(),
            message: String::new(),
            outcome,
            elapsed_ms: 0,
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&result(ProcessingOutcome::Processed)), StatusCode::OK);
        assert_eq!(status_for(&result(ProcessingOutcome::Duplicate)), StatusCode::OK);
        assert_eq!(
            status_for(&result(ProcessingOutcome::Rejected)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&result(ProcessingOutcome::Failed)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_routes_only_include_configured_providers() {
        assert!(WebhookRoutes::new().processors().is_empty());
    }
}
