//! Document store seam and the in-memory implementation used by the service
//! and the tests.
//!
//! Products are the source of truth. Views, PLU records, queued images and
//! syndication content are derived from them and owned by the stage that
//! writes them.

use crate::content::{PackageContent, ProductContent};
use crate::images::ImageRecord;
use async_trait::async_trait;
use parking_lot::RwLock;
use plu::{PluHashMap, Product, ProductId, ProductView, Stage, SyncStatus, TransitionError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("product {product_id} is at version {actual}, expected {expected}")]
    VersionConflict {
        product_id: ProductId,
        expected: i32,
        actual: i32,
    },

    #[error("invalid status change: {0}")]
    Transition(#[from] TransitionError),

    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("catalog decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Durable PLU hashes of one product.
#[derive(Clone, Debug, PartialEq)]
pub struct PluRecord {
    pub product_id: ProductId,
    pub hashes: PluHashMap,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Products whose completion flag for `stage` equals `value`.
    async fn find_products_by_flag(
        &self,
        stage: Stage,
        value: bool,
    ) -> Result<Vec<Product>, StoreError>;

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Catalog ingestion. Replacing a product with different content moves
    /// its status to `NeedsResync`; re-sending identical content keeps the
    /// current status.
    async fn upsert_product(&self, product: Product) -> Result<SyncStatus, StoreError>;

    /// Marks `stage` complete on the product, provided it is still at
    /// `expected_version`.
    async fn set_product_flag(
        &self,
        product_id: ProductId,
        expected_version: i32,
        stage: Stage,
    ) -> Result<SyncStatus, StoreError>;

    async fn upsert_product_view(&self, view: ProductView) -> Result<(), StoreError>;

    async fn get_product_view(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductView>, StoreError>;

    /// Additive union into the product's PLU record. Returns the number of
    /// hashes that were not present before.
    async fn merge_plu_hashes(
        &self,
        product_id: ProductId,
        hashes: &PluHashMap,
    ) -> Result<usize, StoreError>;

    /// Replaces the product's PLU record and returns the entries removed.
    async fn replace_plu_hashes(
        &self,
        product_id: ProductId,
        hashes: PluHashMap,
    ) -> Result<PluHashMap, StoreError>;

    async fn load_plu_records(&self) -> Result<Vec<PluRecord>, StoreError>;

    async fn find_queued_images(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<ImageRecord>, StoreError>;

    async fn insert_images(&self, records: Vec<ImageRecord>) -> Result<(), StoreError>;

    async fn upsert_syndication_content(
        &self,
        product_content: ProductContent,
        package_content: PackageContent,
    ) -> Result<(), StoreError>;

    async fn get_syndication_content(
        &self,
        product_id: ProductId,
    ) -> Result<Option<(ProductContent, PackageContent)>, StoreError>;
}

#[derive(Default)]
struct StoreData {
    products: BTreeMap<ProductId, Product>,
    views: HashMap<ProductId, ProductView>,
    plu_records: BTreeMap<ProductId, PluHashMap>,
    images: Vec<ImageRecord>,
    syndication: HashMap<ProductId, (ProductContent, PackageContent)>,
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    data: RwLock<StoreData>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store from a JSON array of products.
    pub fn from_catalog_file(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        let products: Vec<Product> = serde_json::from_reader(io::BufReader::new(file))?;

        let store = MemoryDocumentStore::new();
        {
            let mut data = store.data.write();
            for product in products {
                data.products.insert(product.product_id, product);
            }
        }
        Ok(store)
    }

    /// Records the identifier the image processor assigned to a queued image.
    pub fn assign_trip_image_id(&self, product_id: ProductId, url: &str, trip_image_id: &str) -> bool {
        let mut data = self.data.write();
        let mut assigned = false;
        for record in data
            .images
            .iter_mut()
            .filter(|r| r.product_id == product_id && r.url == url)
        {
            record.trip_image_id = Some(trip_image_id.to_string());
            assigned = true;
        }
        assigned
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_products_by_flag(
        &self,
        stage: Stage,
        value: bool,
    ) -> Result<Vec<Product>, StoreError> {
        let data = self.data.read();
        Ok(data
            .products
            .values()
            .filter(|p| p.status.is_complete(stage) == value)
            .cloned()
            .collect())
    }

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.data.read().products.get(&product_id).cloned())
    }

    async fn upsert_product(&self, mut product: Product) -> Result<SyncStatus, StoreError> {
        let mut data = self.data.write();
        if let Some(existing) = data.products.get(&product.product_id) {
            product.status = existing.status;
            if product != *existing {
                product.status = existing.status.resync(existing.product_version);
            }
        }
        let status = product.status;
        data.products.insert(product.product_id, product);
        Ok(status)
    }

    async fn set_product_flag(
        &self,
        product_id: ProductId,
        expected_version: i32,
        stage: Stage,
    ) -> Result<SyncStatus, StoreError> {
        let mut data = self.data.write();
        let product = data
            .products
            .get_mut(&product_id)
            .ok_or(StoreError::ProductNotFound(product_id))?;

        if product.product_version != expected_version {
            return Err(StoreError::VersionConflict {
                product_id,
                expected: expected_version,
                actual: product.product_version,
            });
        }

        product.status = product.status.complete(stage)?;
        Ok(product.status)
    }

    async fn upsert_product_view(&self, view: ProductView) -> Result<(), StoreError> {
        self.data.write().views.insert(view.product_id, view);
        Ok(())
    }

    async fn get_product_view(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductView>, StoreError> {
        Ok(self.data.read().views.get(&product_id).cloned())
    }

    async fn merge_plu_hashes(
        &self,
        product_id: ProductId,
        hashes: &PluHashMap,
    ) -> Result<usize, StoreError> {
        let mut data = self.data.write();
        let record = data.plu_records.entry(product_id).or_default();
        let before = record.len();
        record.extend(hashes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(record.len() - before)
    }

    async fn replace_plu_hashes(
        &self,
        product_id: ProductId,
        hashes: PluHashMap,
    ) -> Result<PluHashMap, StoreError> {
        let mut data = self.data.write();
        let previous = data.plu_records.insert(product_id, hashes).unwrap_or_default();
        let current = &data.plu_records[&product_id];
        Ok(previous
            .into_iter()
            .filter(|(hash, _)| !current.contains_key(hash))
            .collect())
    }

    async fn load_plu_records(&self) -> Result<Vec<PluRecord>, StoreError> {
        Ok(self
            .data
            .read()
            .plu_records
            .iter()
            .map(|(product_id, hashes)| PluRecord {
                product_id: *product_id,
                hashes: hashes.clone(),
            })
            .collect())
    }

    async fn find_queued_images(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(self
            .data
            .read()
            .images
            .iter()
            .filter(|r| r.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn insert_images(&self, records: Vec<ImageRecord>) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let existing: HashSet<_> = data.images.iter().map(ImageRecord::key).collect();
        let new: Vec<ImageRecord> = records
            .into_iter()
            .filter(|r| !existing.contains(&r.key()))
            .collect();
        data.images.extend(new);
        Ok(())
    }

    async fn upsert_syndication_content(
        &self,
        product_content: ProductContent,
        package_content: PackageContent,
    ) -> Result<(), StoreError> {
        self.data.write().syndication.insert(
            product_content.product_id,
            (product_content, package_content),
        );
        Ok(())
    }

    async fn get_syndication_content(
        &self,
        product_id: ProductId,
    ) -> Result<Option<(ProductContent, PackageContent)>, StoreError> {
        Ok(self.data.read().syndication.get(&product_id).cloned())
    }
}
