//! Hash lookup used at order creation.
use crate::cache::{CacheError, CacheService};
use crate::metrics_defs::PLU_RESOLVE;
use plu::codec::{ALPHABET, MAX_HASH_LENGTH};
use shared::counter;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ResolveError {
    #[error("unknown PLU hash")]
    NotFound,
    #[error("malformed PLU hash")]
    InvalidHash,
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl ResolveError {
    fn as_label(&self) -> &'static str {
        match self {
            ResolveError::NotFound => "not_found",
            ResolveError::InvalidHash => "invalid",
            ResolveError::Cache(_) => "error",
        }
    }
}

pub struct PluResolver {
    cache: Arc<dyn CacheService>,
}

impl PluResolver {
    pub fn new(cache: Arc<dyn CacheService>) -> Self {
        PluResolver { cache }
    }

    /// Canonical PLU for `hash`. A miss is reported as `NotFound` and never
    /// recomputed here: the reconciler owns populating the cache.
    pub async fn resolve_plu(&self, hash: &str) -> Result<String, ResolveError> {
        let result = self.lookup(hash).await;
        let label = match &result {
            Ok(_) => "hit",
            Err(e) => e.as_label(),
        };
        counter!(PLU_RESOLVE, "result" => label).increment(1);
        result
    }

    async fn lookup(&self, hash: &str) -> Result<String, ResolveError> {
        let well_formed = !hash.is_empty()
            && hash.len() <= MAX_HASH_LENGTH
            && hash.bytes().all(|b| ALPHABET.contains(&b));
        if !well_formed {
            return Err(ResolveError::InvalidHash);
        }

        self.cache.get(hash).await?.ok_or(ResolveError::NotFound)
    }
}
