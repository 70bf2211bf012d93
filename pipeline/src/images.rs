//! Image stage: queues every image URL of a product for the external image
//! processor.
use crate::store::{DocumentStore, StoreError};
use indexmap::IndexSet;
use plu::{Product, ProductId, Stage, SyncStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub product_id: ProductId,
    pub url: String,
    pub image_type_code: String,
    /// Assigned by the image processor once the image has been imported.
    #[serde(default)]
    pub trip_image_id: Option<String>,
}

impl ImageRecord {
    /// Deduplication key.
    pub fn key(&self) -> (ProductId, String, String) {
        (
            self.product_id,
            self.url.clone(),
            self.image_type_code.clone(),
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("document store error: {0}")]
    Store(#[from] StoreError),
}

/// Every image on the product and its variants, first occurrence first.
pub fn extract_images(product: &Product) -> Vec<ImageRecord> {
    let variant_images = product
        .variants()
        .flat_map(|(_, _, _, variant)| variant.images.iter());

    let unique: IndexSet<(&str, &str)> = product
        .images
        .iter()
        .chain(variant_images)
        .map(|image| (image.url.as_str(), image.image_type_code.as_str()))
        .collect();

    unique
        .into_iter()
        .map(|(url, image_type_code)| ImageRecord {
            product_id: product.product_id,
            url: url.to_string(),
            image_type_code: image_type_code.to_string(),
            trip_image_id: None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageOutcome {
    pub queued: usize,
    pub already_queued: usize,
    pub status: SyncStatus,
}

pub struct ImageProcessor {
    store: Arc<dyn DocumentStore>,
}

impl ImageProcessor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        ImageProcessor { store }
    }

    /// Queues images not queued yet and completes the image stage.
    pub async fn process(&self, product: &Product) -> Result<ImageOutcome, ImageError> {
        let existing: HashSet<_> = self
            .store
            .find_queued_images(product.product_id)
            .await?
            .iter()
            .map(ImageRecord::key)
            .collect();

        let (already_queued, new): (Vec<_>, Vec<_>) = extract_images(product)
            .into_iter()
            .partition(|record| existing.contains(&record.key()));

        let queued = new.len();
        if !new.is_empty() {
            self.store.insert_images(new).await?;
        }

        let status = self
            .store
            .set_product_flag(product.product_id, product.product_version, Stage::Image)
            .await?;

        tracing::debug!(
            product_id = product.product_id,
            queued,
            already_queued = already_queued.len(),
            "Queued product images"
        );

        Ok(ImageOutcome {
            queued,
            already_queued: already_queued.len(),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use crate::testutils::{FailingStore, Operation, image, list_product};

    fn product_with_images() -> Product {
        let mut product = list_product(1, 1, 7);
        product.images = vec![image("https://img/a.jpg", "MAIN"), image("https://img/b.jpg", "GALLERY")];
        product.option_groups[0].options[0].items[0].variants[0].images = vec![
            image("https://img/a.jpg", "MAIN"),
            image("https://img/a.jpg", "THUMB"),
            image("https://img/c.jpg", "GALLERY"),
        ];
        product
    }

    #[test]
    fn test_extract_images_dedups_on_url_and_type() {
        let records = extract_images(&product_with_images());
        let keys: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.url.as_str(), r.image_type_code.as_str()))
            .collect();

        assert_eq!(
            keys,
            vec![
                ("https://img/a.jpg", "MAIN"),
                ("https://img/b.jpg", "GALLERY"),
                ("https://img/a.jpg", "THUMB"),
                ("https://img/c.jpg", "GALLERY"),
            ]
        );
        assert!(records.iter().all(|r| r.product_id == 1 && r.trip_image_id.is_none()));
    }

    #[tokio::test]
    async fn test_process_queues_only_new_images() {
        let store = Arc::new(MemoryDocumentStore::new());
        let product = product_with_images();
        store.upsert_product(product.clone()).await.unwrap();
        store
            .set_product_flag(1, 1, Stage::View)
            .await
            .unwrap();
        store
            .insert_images(vec![ImageRecord {
                product_id: 1,
                url: "https://img/a.jpg".into(),
                image_type_code: "MAIN".into(),
                trip_image_id: Some("trip-a".into()),
            }])
            .await
            .unwrap();

        let processor = ImageProcessor::new(store.clone());
        let outcome = processor.process(&product).await.unwrap();

        assert_eq!(outcome.queued, 3);
        assert_eq!(outcome.already_queued, 1);
        assert_eq!(outcome.status, SyncStatus::ImageReady);
        assert_eq!(store.find_queued_images(1).await.unwrap().len(), 4);

        let product = store.get_product(1).await.unwrap().unwrap();
        assert!(product.image_schedule_status());
    }

    #[tokio::test]
    async fn test_process_leaves_flag_unset_on_store_failure() {
        let memory = Arc::new(MemoryDocumentStore::new());
        let product = product_with_images();
        memory.upsert_product(product.clone()).await.unwrap();
        memory.set_product_flag(1, 1, Stage::View).await.unwrap();

        let store = Arc::new(FailingStore::new(memory.clone(), &[Operation::InsertImages]));
        let processor = ImageProcessor::new(store);
        assert!(matches!(
            processor.process(&product).await,
            Err(ImageError::Store(StoreError::Unavailable(_)))
        ));

        let product = memory.get_product(1).await.unwrap().unwrap();
        assert!(!product.image_schedule_status());
        assert_eq!(product.status, SyncStatus::ViewReady);
        assert!(memory.find_queued_images(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_requires_view_stage() {
        let store = Arc::new(MemoryDocumentStore::new());
        let product = product_with_images();
        store.upsert_product(product.clone()).await.unwrap();

        let processor = ImageProcessor::new(store.clone());
        assert!(matches!(
            processor.process(&product).await,
            Err(ImageError::Store(StoreError::Transition(_)))
        ));
    }
}
