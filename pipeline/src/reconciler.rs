//! Copies the durable PLU hashes into the cache service.
//!
//! The cache is append-only from here: existing keys are never overwritten,
//! so a slow pass cannot clobber a value an order is relying on. Fixing a bad
//! cached value requires deleting it first.
use crate::cache::CacheService;
use crate::metrics_defs::{
    RECONCILE_CONFLICT, RECONCILE_CREATED, RECONCILE_DURATION, RECONCILE_FAILED, RECONCILE_KEYS,
};
use crate::store::{DocumentStore, StoreError};
use plu::{PluHashMap, ProductId};
use shared::{counter, histogram};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("could not load PLU hashes: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileReport {
    pub total: usize,
    pub created: usize,
    pub existing: usize,
    pub conflicts: usize,
    pub failed: usize,
}

pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn CacheService>,
    ttl: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<dyn CacheService>, ttl: Duration) -> Self {
        Reconciler { store, cache, ttl }
    }

    /// Flattens the per-product records into one map. A hash claimed by two
    /// products with different PLUs is left out and counted as a conflict.
    async fn load_hashes(&self) -> Result<(PluHashMap, usize), ReconcileError> {
        let mut owners: BTreeMap<String, (ProductId, String)> = BTreeMap::new();
        let mut contested: Vec<String> = Vec::new();

        for record in self.store.load_plu_records().await? {
            for (hash, plu) in record.hashes {
                match owners.get(&hash) {
                    Some((owner, existing)) if *existing != plu => {
                        tracing::error!(
                            hash = %hash,
                            product_id = record.product_id,
                            other_product_id = *owner,
                            "PLU hash claimed by two products"
                        );
                        contested.push(hash);
                    }
                    Some(_) => {}
                    None => {
                        owners.insert(hash, (record.product_id, plu));
                    }
                }
            }
        }

        contested.sort();
        contested.dedup();
        for hash in &contested {
            owners.remove(hash);
        }

        let hashes = owners
            .into_iter()
            .map(|(hash, (_, plu))| (hash, plu))
            .collect();
        Ok((hashes, contested.len()))
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let start = Instant::now();
        let (hashes, contested) = self.load_hashes().await?;

        let mut report = ReconcileReport {
            total: hashes.len(),
            conflicts: contested,
            ..Default::default()
        };

        for (hash, plu) in &hashes {
            match self.cache.set_if_absent(hash, plu, self.ttl).await {
                Ok(true) => report.created += 1,
                Ok(false) => {
                    report.existing += 1;
                    match self.cache.get(hash).await {
                        Ok(Some(cached)) if cached != *plu => {
                            tracing::warn!(
                                hash = %hash,
                                cached = %cached,
                                expected = %plu,
                                "Cached PLU differs from the durable mapping"
                            );
                            report.conflicts += 1;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(hash = %hash, error = %e, "Could not verify cached PLU");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(hash = %hash, error = %e, "Failed to cache PLU hash");
                    report.failed += 1;
                }
            }
        }

        histogram!(RECONCILE_DURATION).record(start.elapsed().as_secs_f64());
        histogram!(RECONCILE_KEYS).record(report.total as f64);
        counter!(RECONCILE_CREATED).increment(report.created as u64);
        counter!(RECONCILE_CONFLICT).increment(report.conflicts as u64);
        counter!(RECONCILE_FAILED).increment(report.failed as u64);

        tracing::info!(
            total = report.total,
            created = report.created,
            existing = report.existing,
            conflicts = report.conflicts,
            failed = report.failed,
            "Reconciled PLU cache"
        );

        Ok(report)
    }
}
