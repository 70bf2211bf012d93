//! View stage: turns a product into its `ProductView` and publishes its PLU
//! hashes.
use crate::cache::{CacheError, CacheService};
use crate::store::{DocumentStore, StoreError};
use plu::{
    CodecError, PluHashMap, PluHasher, Product, ProductId, ProductView, Stage, SyncStatus,
    ViewVariant, expand,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum MaterializeError {
    #[error("PLU integrity error: {0}")]
    Integrity(#[from] CodecError),
    #[error("document store error: {0}")]
    Store(#[from] StoreError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("product {0} not found")]
    ProductNotFound(ProductId),
}

impl MaterializeError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, MaterializeError::Integrity(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Materialized {
    pub view: ProductView,
    pub plu_hashes: PluHashMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub materialized: Materialized,
    pub new_hashes: usize,
    pub status: SyncStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PurgeReport {
    pub retired: usize,
    pub evicted: usize,
}

pub struct Materializer {
    store: Arc<dyn DocumentStore>,
    hasher: Arc<dyn PluHasher>,
    hash_length: usize,
}

impl Materializer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        hasher: Arc<dyn PluHasher>,
        hash_length: usize,
    ) -> Self {
        Materializer {
            store,
            hasher,
            hash_length,
        }
    }

    /// Builds the view and hash map without touching the store.
    pub fn materialize(&self, product: &Product) -> Result<Materialized, MaterializeError> {
        let plu_details = expand(product, self.hasher.as_ref(), self.hash_length)?;

        let variants = product
            .variants()
            .map(|(group, option, item, variant)| ViewVariant {
                group_id: group.group_id,
                option_id: option.option_id,
                item_id: item.item_id,
                variant_id: variant.variant_id,
                name: variant.name.clone(),
                product_option_type_code: option.product_option_type_code,
                refundable: variant.refundable,
                approved: variant.approved,
            })
            .collect();

        let view = ProductView {
            product_id: product.product_id,
            product_version: product.product_version,
            title: product.title.clone(),
            variants,
            plu_details,
        };
        let plu_hashes = view.plu_hashes();

        Ok(Materialized { view, plu_hashes })
    }

    /// Upserts the view, merges the hashes and, once both writes succeeded,
    /// completes the view stage. On any error the stage stays incomplete so
    /// the product is picked up again on the next pass.
    pub async fn publish(&self, product: &Product) -> Result<Published, MaterializeError> {
        let materialized = self.materialize(product)?;

        self.store
            .upsert_product_view(materialized.view.clone())
            .await?;
        let new_hashes = self
            .store
            .merge_plu_hashes(product.product_id, &materialized.plu_hashes)
            .await?;
        let status = self
            .store
            .set_product_flag(product.product_id, product.product_version, Stage::View)
            .await?;

        tracing::debug!(
            product_id = product.product_id,
            product_version = product.product_version,
            plu_count = materialized.plu_hashes.len(),
            new_hashes,
            "Materialized product view"
        );

        Ok(Published {
            materialized,
            new_hashes,
            status,
        })
    }

    /// Drops hashes the product no longer produces from its PLU record and
    /// evicts them from the cache. Not part of the regular view pass, since
    /// in-flight orders may still reference a retired code.
    pub async fn purge_retired(
        &self,
        product_id: ProductId,
        cache: &dyn CacheService,
    ) -> Result<PurgeReport, MaterializeError> {
        let product = self
            .store
            .get_product(product_id)
            .await?
            .ok_or(MaterializeError::ProductNotFound(product_id))?;

        let current = self.materialize(&product)?.plu_hashes;
        let retired = self.store.replace_plu_hashes(product_id, current).await?;

        let mut report = PurgeReport {
            retired: retired.len(),
            evicted: 0,
        };
        for hash in retired.keys() {
            if cache.delete(hash).await? {
                report.evicted += 1;
            }
        }

        tracing::info!(
            product_id,
            retired = report.retired,
            evicted = report.evicted,
            "Purged retired PLU hashes"
        );
        Ok(report)
    }
}
