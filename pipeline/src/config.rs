use crate::collaborators::MAX_RETRIES;
use plu::codec::MAX_HASH_LENGTH;
use plu::DEFAULT_HASH_LENGTH;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Hash length must be between 1 and 51, got {0}")]
    InvalidHashLength(usize),

    #[error("Interval {0} cannot be 0")]
    ZeroInterval(&'static str),

    #[error("Cache capacity cannot be 0")]
    ZeroCapacity,

    #[error("Empty partner category list for {0}")]
    EmptyCategoryMapping(String),

    #[error("max_retries must be at most 10, got {0}")]
    TooManyRetries(u32),
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Catalog {
    /// JSON array of products loaded into the document store at startup.
    pub seed_file: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Codec {
    #[serde(default = "default_hash_length")]
    pub hash_length: usize,
}

fn default_hash_length() -> usize {
    DEFAULT_HASH_LENGTH
}

impl Default for Codec {
    fn default() -> Self {
        Codec {
            hash_length: DEFAULT_HASH_LENGTH,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Scheduler {
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler {
            sync_interval_secs: default_sync_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl Scheduler {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Cache {
    /// TTL of each `hash -> PLU` entry written by the reconciler.
    #[serde(default = "default_plu_ttl_secs")]
    pub plu_ttl_secs: u64,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    /// Bound on memoized geocoding results.
    #[serde(default = "default_place_capacity")]
    pub place_capacity: u64,
}

fn default_plu_ttl_secs() -> u64 {
    600
}

fn default_max_capacity() -> u64 {
    1_000_000
}

fn default_place_capacity() -> u64 {
    10_000
}

impl Default for Cache {
    fn default() -> Self {
        Cache {
            plu_ttl_secs: default_plu_ttl_secs(),
            max_capacity: default_max_capacity(),
            place_capacity: default_place_capacity(),
        }
    }
}

impl Cache {
    pub fn plu_ttl(&self) -> Duration {
        Duration::from_secs(self.plu_ttl_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Geocoder {
    pub url: Url,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum CategoryMapper {
    Http {
        url: Url,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
    },
    /// Keys are `CATEGORY` or `CATEGORY/SUB_CATEGORY`.
    Static {
        mappings: HashMap<String, Vec<String>>,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub catalog: Option<Catalog>,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub scheduler: Scheduler,
    #[serde(default)]
    pub cache: Cache,
    pub geocoder: Geocoder,
    pub category_mapper: CategoryMapper,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if !(1..=MAX_HASH_LENGTH).contains(&self.codec.hash_length) {
            return Err(ValidationError::InvalidHashLength(self.codec.hash_length));
        }

        if self.scheduler.sync_interval_secs == 0 {
            return Err(ValidationError::ZeroInterval("sync_interval_secs"));
        }
        if self.scheduler.reconcile_interval_secs == 0 {
            return Err(ValidationError::ZeroInterval("reconcile_interval_secs"));
        }
        if self.cache.plu_ttl_secs == 0 {
            return Err(ValidationError::ZeroInterval("plu_ttl_secs"));
        }

        if self.cache.max_capacity == 0 || self.cache.place_capacity == 0 {
            return Err(ValidationError::ZeroCapacity);
        }

        let mapper_retries = match &self.category_mapper {
            CategoryMapper::Http { max_retries, .. } => *max_retries,
            CategoryMapper::Static { .. } => 0,
        };
        for retries in [self.geocoder.max_retries, mapper_retries] {
            if retries > MAX_RETRIES {
                return Err(ValidationError::TooManyRetries(retries));
            }
        }

        if let CategoryMapper::Static { mappings } = &self.category_mapper
            && let Some((key, _)) = mappings.iter().find(|(_, partner)| partner.is_empty())
        {
            return Err(ValidationError::EmptyCategoryMapping(key.clone()));
        }

        Ok(())
    }
}
