//! Content stage: builds the partner syndication payload for a product.
use crate::cache::{CacheError, CacheService};
use crate::collaborators::{CategoryMapper, CollaboratorError, Geocoder};
use crate::images::ImageRecord;
use crate::store::{DocumentStore, StoreError};
use plu::{
    CanonicalPlu, CodecError, PluHasher, Product, ProductId, Stage, SyncStatus, VariantId, expand,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationPolicy {
    #[serde(rename = "Free_Cancel")]
    FreeCancel,
    #[serde(rename = "Non_Cancellable")]
    NonCancellable,
}

impl CancellationPolicy {
    /// Free cancellation as soon as one variant is both refundable and
    /// approved.
    pub fn for_product(product: &Product) -> Self {
        let free = product
            .variants()
            .any(|(_, _, _, variant)| variant.refundable && variant.approved);
        if free {
            CancellationPolicy::FreeCancel
        } else {
            CancellationPolicy::NonCancellable
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointOfInterest {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub place_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductContent {
    pub product_id: ProductId,
    pub product_version: i32,
    pub title: String,
    pub categories: Vec<String>,
    pub points_of_interest: Vec<PointOfInterest>,
    pub cancellation_policy: CancellationPolicy,
    pub image_ids: Vec<String>,
}

/// One sellable unit as the partner sees it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageUnit {
    pub plu_hash: String,
    pub plu: String,
    pub variant_id: VariantId,
    pub variant_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageContent {
    pub product_id: ProductId,
    pub units: Vec<PackageUnit>,
}

#[derive(thiserror::Error, Debug)]
pub enum ContentError {
    #[error("document store error: {0}")]
    Store(#[from] StoreError),
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("PLU integrity error: {0}")]
    Codec(#[from] CodecError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    /// The cache does not (yet) map the hash to the expected PLU. Clears once
    /// the reconciler has run.
    #[error("PLU hash {hash} does not resolve to {expected}")]
    UnresolvedPlu { hash: String, expected: String },
    #[error("payload build panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentOutcome {
    pub units: usize,
    pub status: SyncStatus,
}

pub struct ContentProcessor {
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn CacheService>,
    geocoder: Arc<dyn Geocoder>,
    categories: Arc<dyn CategoryMapper>,
    hasher: Arc<dyn PluHasher>,
    hash_length: usize,
}

impl ContentProcessor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn CacheService>,
        geocoder: Arc<dyn Geocoder>,
        categories: Arc<dyn CategoryMapper>,
        hasher: Arc<dyn PluHasher>,
        hash_length: usize,
    ) -> Self {
        ContentProcessor {
            store,
            cache,
            geocoder,
            categories,
            hasher,
            hash_length,
        }
    }

    pub async fn build_syndication_payload(
        &self,
        product: &Product,
    ) -> Result<(ProductContent, PackageContent), ContentError> {
        let categories = self
            .categories
            .lookup_partner_categories(&product.category_codes)
            .await?;

        let mut points_of_interest = Vec::with_capacity(product.facilities.len());
        for facility in &product.facilities {
            let place_id = self
                .geocoder
                .resolve_place_id(facility.latitude, facility.longitude)
                .await?;
            points_of_interest.push(PointOfInterest {
                name: facility.name.clone(),
                latitude: facility.latitude,
                longitude: facility.longitude,
                place_id,
            });
        }

        let image_ids = self
            .store
            .find_queued_images(product.product_id)
            .await?
            .into_iter()
            .filter_map(|record: ImageRecord| record.trip_image_id)
            .collect();

        let units = self.package_units(product).await?;

        let product_content = ProductContent {
            product_id: product.product_id,
            product_version: product.product_version,
            title: product.title.clone(),
            categories,
            points_of_interest,
            cancellation_policy: CancellationPolicy::for_product(product),
            image_ids,
        };
        let package_content = PackageContent {
            product_id: product.product_id,
            units,
        };
        Ok((product_content, package_content))
    }

    /// Re-derives the sellable units and checks every hash against the cache.
    async fn package_units(&self, product: &Product) -> Result<Vec<PackageUnit>, ContentError> {
        let variant_names: HashMap<VariantId, &str> = product
            .variants()
            .map(|(_, _, _, variant)| (variant.variant_id, variant.name.as_str()))
            .collect();

        let details = expand(product, self.hasher.as_ref(), self.hash_length)?;
        let mut units = Vec::new();

        for detail in details {
            let hashes: HashMap<&str, &str> = detail
                .plu_hash
                .iter()
                .map(|(hash, plu)| (plu.as_str(), hash.as_str()))
                .collect();

            for plu in &detail.plus {
                let Some(&plu_hash) = hashes.get(plu.as_str()) else {
                    continue;
                };
                let plu_hash = plu_hash.to_string();
                let plu = plu.clone();

                match self.cache.get(&plu_hash).await? {
                    Some(cached) if cached == plu => {}
                    _ => {
                        return Err(ContentError::UnresolvedPlu {
                            hash: plu_hash,
                            expected: plu,
                        });
                    }
                }

                let canonical: CanonicalPlu = plu.parse().map_err(|source| {
                    CodecError::MalformedPlu {
                        option_id: detail.option_id,
                        source,
                    }
                })?;
                units.push(PackageUnit {
                    variant_name: variant_names
                        .get(&canonical.variant_id)
                        .map(|name| name.to_string())
                        .unwrap_or_default(),
                    variant_id: canonical.variant_id,
                    schedule: Some(canonical.schedule).filter(|s| !s.is_empty()),
                    round: Some(canonical.round).filter(|r| !r.is_empty()),
                    plu_hash,
                    plu,
                });
            }
        }

        Ok(units)
    }

    /// Builds and stores the payload, then completes the content stage. The
    /// build runs on its own task so a panic fails only this product.
    pub async fn process(self: &Arc<Self>, product: &Product) -> Result<ContentOutcome, ContentError> {
        let processor = Arc::clone(self);
        let owned = product.clone();
        let build = tokio::spawn(async move { processor.build_syndication_payload(&owned).await });

        let (product_content, package_content) = match build.await {
            Ok(result) => result?,
            Err(e) if e.is_panic() => {
                let panic = e.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                return Err(ContentError::Panicked(message));
            }
            Err(e) => return Err(ContentError::Panicked(e.to_string())),
        };

        let units = package_content.units.len();
        self.store
            .upsert_syndication_content(product_content, package_content)
            .await?;
        let status = self
            .store
            .set_product_flag(product.product_id, product.product_version, Stage::Content)
            .await?;

        tracing::debug!(
            product_id = product.product_id,
            units,
            "Synced product content"
        );

        Ok(ContentOutcome { units, status })
    }
}
