//! Handlers bundled with the server binary

use async_trait::async_trait;
use paykit_webhook::{EventHandler, EventRouter, EventType, HandlerError, WebhookEvent};
use std::sync::Arc;
use tracing::info;

/// Records every accepted event in the log
///
/// Deployments replace it with handlers carrying their own business logic.
pub struct AuditLogHandler;

#[async_trait]
impl EventHandler for AuditLogHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        info!(
            event_id = %event.id(),
            provider = %event.provider(),
            event_type = %event.event_type(),
            raw_type = event.raw_type(),
            created_at = %event.created_at(),
            "Webhook event accepted"
        );
        Ok(())
    }
}

pub fn default_router() -> EventRouter {
    let audit: Arc<dyn EventHandler> = Arc::new(AuditLogHandler);
    EventType::ALL
        .into_iter()
        .fold(EventRouter::new(), |router, event_type| {
            router.on(event_type, audit.clone())
        })
}
