use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::admission::{AdmissionConfig, AdmissionEngine};
use crate::config::Config;
use crate::endpoints;
use crate::error::Error;
use crate::moderation::{ForbiddenWords, OpenAIModerationClient};
use crate::store::{InMemoryStore, RedisStore, Store};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub engine: Arc<AdmissionEngine>,
}

impl AppStateData {
    /// Connects to the configured store and builds the admission engine
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let store = setup_store(&config).await?;
        Self::new_with_store(config, store)
    }

    pub fn new_with_store(config: Arc<Config>, store: Arc<dyn Store>) -> Result<Self, Error> {
        let mut engine = AdmissionEngine::new(store, AdmissionConfig::from(config.as_ref()))
            .with_forbidden_words(ForbiddenWords::new(
                config.moderation.forbidden_words.iter().cloned(),
            ));

        match &config.moderation.endpoint {
            Some(endpoint) => {
                if config.moderation.api_key.is_none() {
                    tracing::warn!(
                        "Moderation endpoint is set without an API key, requests will be unauthenticated"
                    );
                }
                let client =
                    OpenAIModerationClient::new(endpoint.clone(), config.moderation.api_key.clone())?;
                engine = engine.with_moderator(Arc::new(client));
            }
            None => tracing::info!("Moderation is disabled"),
        }

        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }
}

async fn setup_store(config: &Config) -> Result<Arc<dyn Store>, Error> {
    match config.store.redis_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => Ok(Arc::new(
            RedisStore::new(url, config.store.timeout()).await?,
        )),
        None => {
            tracing::warn!(
                "No Redis URL configured, usage and devices are kept in process memory and are not shared between instances"
            );
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// All routes, without middleware layers
pub fn build_router(app_state: AppStateData) -> Router {
    Router::new()
        .route(
            "/audit_limit",
            post(endpoints::audit_limit::audit_limit_handler),
        )
        .route("/devices", get(endpoints::devices::list_devices_handler))
        .route(
            "/devices/logout",
            post(endpoints::devices::logout_device_handler),
        )
        .route("/usage", get(endpoints::stats::usage_handler))
        .route("/stats/tokens", get(endpoints::stats::token_stats_handler))
        .route("/stats/usage", get(endpoints::stats::usage_stats_handler))
        .route("/stats/devices", get(endpoints::stats::device_stats_handler))
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .with_state(app_state)
}
