//! Application state and initialization

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use paykit_core::{AppConfig, IdempotencyBackend, IdempotencySettings};
use paykit_infra::{
    IdempotencyConfig, IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore,
    RetryConfig,
};
use paykit_webhook::{
    EventRouter, RetryMode, WebhookAuthenticator, WebhookProcessor, WebhookRoutes,
};

use crate::cli::Args;
use crate::handlers::default_router;
use crate::server::Server;

/// Timeout for outbound calls to PayPal (certificates, verification API)
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// One store shared by every provider's processor
    pub store: Arc<dyn IdempotencyStore>,
    pub routes: WebhookRoutes,
}

impl AppState {
    pub async fn new(config: AppConfig, router: EventRouter) -> Result<Self> {
        info!("Initializing application components");

        let store = build_store(&config.idempotency).await?;
        let client = reqwest::Client::builder()
            .timeout(OUTBOUND_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        let routes = build_routes(&config, store.clone(), router, client)?;

        Ok(Self {
            config: Arc::new(config),
            store,
            routes,
        })
    }
}

async fn build_store(settings: &IdempotencySettings) -> Result<Arc<dyn IdempotencyStore>> {
    let config = IdempotencyConfig::from(settings);

    match settings.backend {
        IdempotencyBackend::Memory => {
            info!("Using in-memory idempotency store");
            Ok(Arc::new(InMemoryIdempotencyStore::new(config)))
        }
        IdempotencyBackend::Redis => {
            let url = settings
                .redis_url
                .as_deref()
                .context("idempotency.redis_url is required for the redis backend")?;
            let store = RedisIdempotencyStore::connect(url, config)
                .await
                .context("Failed to connect idempotency store to Redis")?;
            Ok(Arc::new(store))
        }
    }
}

fn build_routes(
    config: &AppConfig,
    store: Arc<dyn IdempotencyStore>,
    router: EventRouter,
    client: reqwest::Client,
) -> Result<WebhookRoutes> {
    let retry = RetryConfig::from(&config.retry);
    let mode = if config.retry.conditional {
        RetryMode::Conditional
    } else {
        RetryMode::Always
    };

    let processor = |authenticator: WebhookAuthenticator| -> Result<Arc<WebhookProcessor>> {
        let processor = WebhookProcessor::builder(authenticator)
            .store(store.clone())
            .router(router.clone())
            .retry(retry.clone())
            .retry_mode(mode)
            .build()
            .context("Failed to build webhook processor")?;
        Ok(Arc::new(processor))
    };

    let mut routes = WebhookRoutes::new().with_request_timeout(config.server.request_timeout());

    if let Some(stripe) = &config.stripe {
        routes = routes.with_stripe(processor(WebhookAuthenticator::stripe(stripe))?);
    }

    if let Some(paypal) = &config.paypal {
        if !paypal.api_verification_enabled() {
            info!("PayPal API verification disabled, using certificate verification only");
        }
        routes = routes.with_paypal(processor(WebhookAuthenticator::paypal(
            paypal, client,
        ))?);
    }

    Ok(routes)
}

/// Main application
pub struct App {
    args: Args,
    state: AppState,
}

impl App {
    pub async fn build(args: Args) -> Result<Self> {
        args.validate().context("Invalid command line arguments")?;

        let mut config = AppConfig::load_from_file(&args.config_path())
            .context("Failed to load configuration")?;
        if let Some(port) = args.port {
            config.server.port = port;
        }

        let state = AppState::new(config, default_router()).await?;

        Ok(Self { args, state })
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting server");
        info!("HTTP address: {}", self.state.config.server.address());

        let server = Server::new(self.args, self.state)?;
        server.run().await
    }
}
