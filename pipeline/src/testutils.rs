use crate::cache::{CacheError, CacheService};
use crate::collaborators::{CollaboratorError, Geocoder};
use crate::content::{PackageContent, ProductContent};
use crate::images::ImageRecord;
use crate::store::{DocumentStore, MemoryDocumentStore, PluRecord, StoreError};
use async_trait::async_trait;
use plu::{
    CodecError, OptionGroup, OptionItem, PluHashMap, PluHasher, Product, ProductId, ProductImage,
    ProductOption, ProductOptionTypeCode, ProductView, Stage, SyncStatus, Variant,
};
use std::sync::Arc;
use std::time::Duration;

fn single_option_product(
    product_id: ProductId,
    product_version: i32,
    variant_id: i64,
    code: ProductOptionTypeCode,
    schedules: &[&str],
    rounds: &[&str],
) -> Product {
    Product {
        product_id,
        product_version,
        title: format!("product {product_id}"),
        category_codes: vec![],
        option_groups: vec![OptionGroup {
            group_id: 1,
            name: "group".into(),
            options: vec![ProductOption {
                option_id: 1,
                name: "option".into(),
                product_option_type_code: code,
                items: vec![OptionItem {
                    item_id: 1,
                    name: "item".into(),
                    variants: vec![Variant {
                        variant_id,
                        name: format!("variant {variant_id}"),
                        refundable: false,
                        approved: false,
                        images: vec![],
                    }],
                    schedules: schedules.iter().map(|s| s.to_string()).collect(),
                    rounds: rounds.iter().map(|r| r.to_string()).collect(),
                }],
            }],
        }],
        facilities: vec![],
        images: vec![],
        status: SyncStatus::Pending,
    }
}

/// One LIST option with a single variant.
pub fn list_product(product_id: ProductId, product_version: i32, variant_id: i64) -> Product {
    single_option_product(
        product_id,
        product_version,
        variant_id,
        ProductOptionTypeCode::List,
        &[],
        &[],
    )
}

/// One ROUND option with a single schedule and two rounds.
pub fn round_product(product_id: ProductId, product_version: i32, variant_id: i64) -> Product {
    single_option_product(
        product_id,
        product_version,
        variant_id,
        ProductOptionTypeCode::Round,
        &["2025-01-01"],
        &["09:00", "13:00"],
    )
}

pub fn image(url: &str, image_type_code: &str) -> ProductImage {
    ProductImage {
        url: url.into(),
        image_type_code: image_type_code.into(),
    }
}

/// Maps every PLU to the same code.
pub struct ConstantHasher;

impl PluHasher for ConstantHasher {
    fn hash(&self, _canonical: &str, length: usize) -> Result<String, CodecError> {
        Ok("0".repeat(length))
    }
}

pub struct StubGeocoder;

#[async_trait]
impl Geocoder for StubGeocoder {
    async fn resolve_place_id(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<String, CollaboratorError> {
        Ok(format!("place:{latitude}:{longitude}"))
    }
}

pub struct FailingGeocoder;

#[async_trait]
impl Geocoder for FailingGeocoder {
    async fn resolve_place_id(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::PlaceNotFound {
            latitude,
            longitude,
        })
    }
}

/// Cache whose every call fails.
pub struct FailingCache;

#[async_trait]
impl CacheService for FailingCache {
    async fn set_if_absent(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<bool, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operation {
    FindProducts,
    UpsertView,
    MergePluHashes,
    LoadPluRecords,
    InsertImages,
}

/// Delegates to a memory store, failing the listed operations.
pub struct FailingStore {
    inner: Arc<MemoryDocumentStore>,
    failing: Vec<Operation>,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryDocumentStore>, failing: &[Operation]) -> Self {
        FailingStore {
            inner,
            failing: failing.to_vec(),
        }
    }

    fn check(&self, operation: Operation) -> Result<(), StoreError> {
        if self.failing.contains(&operation) {
            return Err(StoreError::Unavailable(format!("{operation:?} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FailingStore {
    async fn find_products_by_flag(
        &self,
        stage: Stage,
        value: bool,
    ) -> Result<Vec<Product>, StoreError> {
        self.check(Operation::FindProducts)?;
        self.inner.find_products_by_flag(stage, value).await
    }

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        self.inner.get_product(product_id).await
    }

    async fn upsert_product(&self, product: Product) -> Result<SyncStatus, StoreError> {
        self.inner.upsert_product(product).await
    }

    async fn set_product_flag(
        &self,
        product_id: ProductId,
        expected_version: i32,
        stage: Stage,
    ) -> Result<SyncStatus, StoreError> {
        self.inner
            .set_product_flag(product_id, expected_version, stage)
            .await
    }

    async fn upsert_product_view(&self, view: ProductView) -> Result<(), StoreError> {
        self.check(Operation::UpsertView)?;
        self.inner.upsert_product_view(view).await
    }

    async fn get_product_view(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductView>, StoreError> {
        self.inner.get_product_view(product_id).await
    }

    async fn merge_plu_hashes(
        &self,
        product_id: ProductId,
        hashes: &PluHashMap,
    ) -> Result<usize, StoreError> {
        self.check(Operation::MergePluHashes)?;
        self.inner.merge_plu_hashes(product_id, hashes).await
    }

    async fn replace_plu_hashes(
        &self,
        product_id: ProductId,
        hashes: PluHashMap,
    ) -> Result<PluHashMap, StoreError> {
        self.inner.replace_plu_hashes(product_id, hashes).await
    }

    async fn load_plu_records(&self) -> Result<Vec<PluRecord>, StoreError> {
        self.check(Operation::LoadPluRecords)?;
        self.inner.load_plu_records().await
    }

    async fn find_queued_images(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        self.inner.find_queued_images(product_id).await
    }

    async fn insert_images(&self, records: Vec<ImageRecord>) -> Result<(), StoreError> {
        self.check(Operation::InsertImages)?;
        self.inner.insert_images(records).await
    }

    async fn upsert_syndication_content(
        &self,
        product_content: ProductContent,
        package_content: PackageContent,
    ) -> Result<(), StoreError> {
        self.inner
            .upsert_syndication_content(product_content, package_content)
            .await
    }

    async fn get_syndication_content(
        &self,
        product_id: ProductId,
    ) -> Result<Option<(ProductContent, PackageContent)>, StoreError> {
        self.inner.get_syndication_content(product_id).await
    }
}
