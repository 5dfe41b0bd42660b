pub mod api;
pub mod config;
pub mod logic;
pub mod model;
pub mod resilience;
pub mod store;

use std::sync::Arc;

use anyhow::Context;

use crate::api::{create_router, AppState, Services};
use crate::config::{AppConfig, Backend, ImageProvider, ImagesConfig};
use crate::logic::{
    ActionDispatcher, DirectiveResolver, HierarchyStore, HttpImageGenerator, ImageGenerator,
    PlaceholderImages,
};
use crate::resilience::CircuitBreakerRegistry;
use crate::store::ConnectionSource;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use logic::{ActionContext, ActionOutcome, DispatchError, HierarchyLimits, TreeOps};

// Export all model types
pub use model::*;

pub use store::{MemoryStore, PostgresStore, StoreError, TransactionManager};

/// Breaker name for the image provider
pub const IMAGE_SERVICE: &str = "image-generation";

/// Image source selected by the `images` configuration section
pub fn image_generator(
    config: &ImagesConfig,
    breakers: &CircuitBreakerRegistry,
) -> anyhow::Result<Arc<dyn ImageGenerator>> {
    match config.provider {
        ImageProvider::Placeholder => Ok(Arc::new(PlaceholderImages::new(
            config.placeholder_url.clone(),
            config.width,
            config.height,
        ))),
        ImageProvider::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .context("images.endpoint is required for the http provider")?;
            Ok(Arc::new(HttpImageGenerator::new(
                endpoint,
                config.api_key.clone(),
                config.retry_options(),
                breakers.get(IMAGE_SERVICE),
            )))
        }
    }
}

/// Wire the element store, directive resolver and dispatcher over `source`
pub fn services<S: ConnectionSource>(source: S, config: &AppConfig) -> anyhow::Result<AppState<S>> {
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.images.breaker_config()));
    let generator = image_generator(&config.images, &breakers)?;
    let store = HierarchyStore::new(source, config.transaction.manager(), config.limits);
    let dispatcher = ActionDispatcher::new(
        store,
        DirectiveResolver::new(generator),
        config.transaction.timeout(),
    );
    Ok(Arc::new(Services {
        dispatcher,
        breakers,
    }))
}

/// Router over the configured backend, migrations applied
pub async fn build_app(config: &AppConfig) -> anyhow::Result<axum::Router> {
    match config.database.backend {
        Backend::Memory => {
            log::warn!("Using the in-memory backend, nothing is persisted");
            let state = services(MemoryStore::new(), config)?;
            Ok(create_router().with_state(state))
        }
        Backend::Postgres => {
            let database_url = config.database_url()?;
            let max_connections = config.database.max_connections.unwrap_or(20);
            let store = PostgresStore::new(&database_url, max_connections).await?;
            store.migrate().await?;
            log::info!("Database ready");
            let state = services(store, config)?;
            Ok(create_router().with_state(state))
        }
    }
}

pub async fn run_server(config: &AppConfig) -> anyhow::Result<()> {
    let app = build_app(config).await?;

    let bind_address = config.server_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    log::info!("pagecraft server running on http://{}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_provider_needs_endpoint() {
        let mut images = ImagesConfig::default();
        images.provider = ImageProvider::Http;
        let breakers = CircuitBreakerRegistry::default();
        assert!(image_generator(&images, &breakers).is_err());

        images.endpoint = Some("https://images.test/generate".to_string());
        assert!(image_generator(&images, &breakers).is_ok());
        assert_eq!(breakers.stats().len(), 1);
        assert_eq!(breakers.stats()[0].name, IMAGE_SERVICE);
    }

    #[tokio::test]
    async fn test_memory_backend_builds_without_database() {
        let mut config = AppConfig::default();
        config.database.backend = Backend::Memory;
        assert!(build_app(&config).await.is_ok());
    }
}
