//! Product synchronization pipeline.
//!
//! Products move through three stages (view, image, content), each completing
//! a flag on the product's [`plu::SyncStatus`]. The view stage also publishes
//! the product's PLU hashes, which the reconciler copies into the cache that
//! order creation resolves against.

pub mod api;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod content;
pub mod images;
pub mod materializer;
pub mod metrics_defs;
pub mod reconciler;
pub mod resolver;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testutils;

use crate::api::{ApiServerError, AppState};
use crate::cache::MokaCacheService;
use crate::collaborators::{
    CachingGeocoder, CategoryMapper, CollaboratorError, HttpCategoryMapper, HttpGeocoder,
    StaticCategoryMapper,
};
use crate::config::{CategoryMapper as CategoryMapperConfig, Config, ValidationError};
use crate::resolver::PluResolver;
use crate::scheduler::{Pipeline, Scheduler};
use crate::store::{MemoryDocumentStore, StoreError};
use plu::Sha256Hasher;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error("could not load catalog: {0}")]
    Catalog(#[from] StoreError),
    #[error("could not set up collaborator: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("API server error: {0}")]
    Api(#[from] ApiServerError),
}

fn category_mapper(
    config: &CategoryMapperConfig,
) -> Result<Arc<dyn CategoryMapper>, CollaboratorError> {
    Ok(match config {
        CategoryMapperConfig::Http { url, max_retries } => {
            Arc::new(HttpCategoryMapper::new(url, *max_retries)?)
        }
        CategoryMapperConfig::Static { mappings } => {
            Arc::new(StaticCategoryMapper::new(mappings.clone()))
        }
    })
}

/// Starts the scheduler and serves the API until ctrl-c.
pub async fn run(config: Config) -> Result<(), RunError> {
    config.validate()?;

    let store = match &config.catalog {
        Some(catalog) => {
            let store = MemoryDocumentStore::from_catalog_file(&catalog.seed_file)?;
            tracing::info!(path = %catalog.seed_file.display(), "Loaded catalog");
            Arc::new(store)
        }
        None => Arc::new(MemoryDocumentStore::new()),
    };
    let cache = Arc::new(MokaCacheService::new(config.cache.max_capacity));

    let geocoder = Arc::new(CachingGeocoder::new(
        Arc::new(HttpGeocoder::new(
            &config.geocoder.url,
            config.geocoder.max_retries,
        )?),
        config.cache.place_capacity,
    ));

    let pipeline = Arc::new(Pipeline::new(
        store,
        cache.clone(),
        geocoder,
        category_mapper(&config.category_mapper)?,
        Arc::new(Sha256Hasher),
        config.codec.hash_length,
        config.cache.plu_ttl(),
    ));

    let scheduler = Arc::new(Scheduler::start(
        pipeline.clone(),
        config.scheduler.sync_interval(),
        config.scheduler.reconcile_interval(),
    ));

    let state = AppState {
        resolver: Arc::new(PluResolver::new(cache)),
        pipeline,
        scheduler: scheduler.clone(),
    };

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutting down"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    };

    let served = api::serve(&config.listener, state, shutdown).await;
    scheduler.shutdown().await;
    Ok(served?)
}
