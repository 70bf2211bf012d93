//! External collaborators of the content stage: the geocoder and the partner
//! category mapping.
use crate::metrics_defs::{PLACE_CACHE_HIT, PLACE_CACHE_MISS};
use async_trait::async_trait;
use indexmap::IndexSet;
use moka::sync::Cache;
use plu::CategoryFilter;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use url::Url;

const BASE_DELAY_MS: u64 = 500;

/// Caps a single backoff at `BASE_DELAY_MS * 2^6`.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Upper bound accepted for configured retries.
pub const MAX_RETRIES: u32 = 10;

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

#[derive(thiserror::Error, Debug)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("retries exceeded, last status {0}")]
    RetriesExceeded(StatusCode),
    #[error("no place found at ({latitude}, {longitude})")]
    PlaceNotFound { latitude: f64, longitude: f64 },
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve_place_id(&self, latitude: f64, longitude: f64)
    -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait CategoryMapper: Send + Sync {
    /// Partner category codes for the product's own categories, without
    /// duplicates.
    async fn lookup_partner_categories(
        &self,
        codes: &[CategoryFilter],
    ) -> Result<Vec<String>, CollaboratorError>;
}

/// Exponential backoff on retriable status codes.
#[derive(Clone, Debug)]
struct Retry {
    max_retries: u32,
    base_delay: Duration,
}

impl Retry {
    fn delay(&self, retries: u32) -> Duration {
        self.base_delay * 2_u32.pow(retries.min(MAX_BACKOFF_EXPONENT))
    }

    async fn send(
        &self,
        request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, CollaboratorError> {
        let mut retries = 0;
        loop {
            let response = request().send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if !RETRIABLE_STATUS_CODES.contains(&status) {
                return Err(CollaboratorError::Status(status));
            }
            if retries >= self.max_retries {
                return Err(CollaboratorError::RetriesExceeded(status));
            }
            sleep(self.delay(retries)).await;
            retries += 1;
        }
    }
}

#[derive(Deserialize)]
struct PlaceResponse {
    place_id: Option<String>,
}

pub struct HttpGeocoder {
    client: reqwest::Client,
    url: Url,
    retry: Retry,
}

impl HttpGeocoder {
    pub fn new(base_url: &Url, max_retries: u32) -> Result<Self, CollaboratorError> {
        let url = Url::parse(&format!(
            "{}/{}",
            base_url.as_str().trim_end_matches('/'),
            "place-id"
        ))?;

        Ok(HttpGeocoder {
            client: reqwest::Client::new(),
            url,
            retry: Retry {
                max_retries,
                base_delay: Duration::from_millis(BASE_DELAY_MS),
            },
        })
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn resolve_place_id(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<String, CollaboratorError> {
        let lat = latitude.to_string();
        let lon = longitude.to_string();
        let response = self
            .retry
            .send(|| {
                self.client
                    .get(self.url.clone())
                    .query(&[("lat", lat.as_str()), ("lon", lon.as_str())])
            })
            .await?;

        response
            .json::<PlaceResponse>()
            .await?
            .place_id
            .ok_or(CollaboratorError::PlaceNotFound {
                latitude,
                longitude,
            })
    }
}

/// Coordinates rounded to 1e-6 degrees.
type PlaceKey = (i64, i64);

fn place_key(latitude: f64, longitude: f64) -> PlaceKey {
    (
        (latitude * 1e6).round() as i64,
        (longitude * 1e6).round() as i64,
    )
}

/// Memoizes geocoding results so each facility location is resolved once.
pub struct CachingGeocoder {
    inner: Arc<dyn Geocoder>,
    places: Cache<PlaceKey, String>,
}

impl CachingGeocoder {
    pub fn new(inner: Arc<dyn Geocoder>, max_capacity: u64) -> Self {
        CachingGeocoder {
            inner,
            places: Cache::builder().max_capacity(max_capacity).build(),
        }
    }
}

#[async_trait]
impl Geocoder for CachingGeocoder {
    async fn resolve_place_id(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<String, CollaboratorError> {
        let key = place_key(latitude, longitude);
        if let Some(place_id) = self.places.get(&key) {
            counter!(PLACE_CACHE_HIT).increment(1);
            return Ok(place_id);
        }

        counter!(PLACE_CACHE_MISS).increment(1);
        let place_id = self.inner.resolve_place_id(latitude, longitude).await?;
        self.places.insert(key, place_id.clone());
        Ok(place_id)
    }
}

#[derive(Serialize)]
struct CategoryRequest<'a> {
    categories: &'a [CategoryFilter],
}

#[derive(Deserialize)]
struct CategoryResponse {
    categories: Vec<String>,
}

pub struct HttpCategoryMapper {
    client: reqwest::Client,
    url: Url,
    retry: Retry,
}

impl HttpCategoryMapper {
    pub fn new(base_url: &Url, max_retries: u32) -> Result<Self, CollaboratorError> {
        let url = Url::parse(&format!(
            "{}/{}",
            base_url.as_str().trim_end_matches('/'),
            "category-mappings"
        ))?;

        Ok(HttpCategoryMapper {
            client: reqwest::Client::new(),
            url,
            retry: Retry {
                max_retries,
                base_delay: Duration::from_millis(BASE_DELAY_MS),
            },
        })
    }
}

#[async_trait]
impl CategoryMapper for HttpCategoryMapper {
    async fn lookup_partner_categories(
        &self,
        codes: &[CategoryFilter],
    ) -> Result<Vec<String>, CollaboratorError> {
        if codes.is_empty() {
            return Ok(vec![]);
        }

        let body = CategoryRequest { categories: codes };
        let response = self
            .retry
            .send(|| self.client.post(self.url.clone()).json(&body))
            .await?;

        let categories: IndexSet<String> = response
            .json::<CategoryResponse>()
            .await?
            .categories
            .into_iter()
            .collect();
        Ok(categories.into_iter().collect())
    }
}

/// Category mapping from configuration. Keys are either `category` or
/// `category/sub_category`; the more specific key wins.
pub struct StaticCategoryMapper {
    mappings: HashMap<String, Vec<String>>,
}

impl StaticCategoryMapper {
    pub fn new(mappings: HashMap<String, Vec<String>>) -> Self {
        StaticCategoryMapper { mappings }
    }
}

#[async_trait]
impl CategoryMapper for StaticCategoryMapper {
    async fn lookup_partner_categories(
        &self,
        codes: &[CategoryFilter],
    ) -> Result<Vec<String>, CollaboratorError> {
        let mut categories = IndexSet::new();
        for filter in codes {
            let specific = filter
                .sub_category_code
                .as_ref()
                .and_then(|sub| {
                    self.mappings
                        .get(&format!("{}/{}", filter.category_code, sub))
                });

            if let Some(partner) = specific.or_else(|| self.mappings.get(&filter.category_code)) {
                categories.extend(partner.iter().cloned());
            }
        }
        Ok(categories.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_retry_delay_is_capped() {
        let retry = Retry {
            max_retries: u32::MAX,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
        };
        assert_eq!(retry.delay(0), Duration::from_millis(500));
        assert_eq!(retry.delay(3), Duration::from_millis(4000));
        assert_eq!(retry.delay(MAX_BACKOFF_EXPONENT), retry.delay(40));
        assert_eq!(retry.delay(u32::MAX), Duration::from_millis(32_000));
    }

    struct CountingGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        async fn resolve_place_id(
            &self,
            latitude: f64,
            longitude: f64,
        ) -> Result<String, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("place:{latitude}:{longitude}"))
        }
    }

    fn filter(code: &str, sub: Option<&str>) -> CategoryFilter {
        CategoryFilter {
            category_code: code.into(),
            sub_category_code: sub.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_caching_geocoder() {
        let inner = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
        });
        let geocoder = CachingGeocoder::new(inner.clone(), 100);

        let first = geocoder.resolve_place_id(37.5665, 126.978).await.unwrap();
        let second = geocoder.resolve_place_id(37.5665, 126.978).await.unwrap();
        geocoder.resolve_place_id(35.1796, 129.0756).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_static_category_mapper() {
        let mapper = StaticCategoryMapper::new(HashMap::from([
            ("TOUR".to_string(), vec!["tours".to_string()]),
            ("TOUR/CITY".to_string(), vec!["city-tours".to_string()]),
            ("FOOD".to_string(), vec!["food".to_string(), "tours".to_string()]),
        ]));

        let categories = mapper
            .lookup_partner_categories(&[
                filter("TOUR", Some("CITY")),
                filter("TOUR", Some("BOAT")),
                filter("FOOD", None),
                filter("UNKNOWN", None),
            ])
            .await
            .unwrap();

        assert_eq!(categories, vec!["city-tours", "tours", "food"]);
    }

    #[tokio::test]
    async fn test_http_geocoder() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/place-id"))
            .and(query_param("lat", "37.5"))
            .and(query_param("lon", "127"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"place_id": "ChIJ123"}"#),
            )
            .mount(&mock_server)
            .await;

        let base = Url::parse(&mock_server.uri()).unwrap();
        let geocoder = HttpGeocoder::new(&base, 0).unwrap();
        assert_eq!(
            geocoder.resolve_place_id(37.5, 127.0).await.unwrap(),
            "ChIJ123"
        );
    }

    #[tokio::test]
    async fn test_http_geocoder_not_found() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/place-id"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"place_id": null}"#))
            .mount(&mock_server)
            .await;

        let base = Url::parse(&mock_server.uri()).unwrap();
        let geocoder = HttpGeocoder::new(&base, 0).unwrap();
        assert!(matches!(
            geocoder.resolve_place_id(1.0, 2.0).await,
            Err(CollaboratorError::PlaceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/place-id"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/category-mappings"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let base = Url::parse(&mock_server.uri()).unwrap();

        let geocoder = HttpGeocoder::new(&base, 1).unwrap();
        assert!(matches!(
            geocoder.resolve_place_id(1.0, 2.0).await,
            Err(CollaboratorError::RetriesExceeded(StatusCode::SERVICE_UNAVAILABLE))
        ));

        let mapper = HttpCategoryMapper::new(&base, 1).unwrap();
        assert!(matches!(
            mapper
                .lookup_partner_categories(&[filter("TOUR", None)])
                .await,
            Err(CollaboratorError::Status(StatusCode::NOT_FOUND))
        ));
    }

    #[tokio::test]
    async fn test_http_category_mapper() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/category-mappings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"categories": ["tours", "food", "tours"]}"#),
            )
            .mount(&mock_server)
            .await;

        let base = Url::parse(&mock_server.uri()).unwrap();
        let mapper = HttpCategoryMapper::new(&base, 0).unwrap();
        let categories = mapper
            .lookup_partner_categories(&[filter("TOUR", None)])
            .await
            .unwrap();
        assert_eq!(categories, vec!["tours", "food"]);

        // No request for a product without categories
        assert!(mapper.lookup_partner_categories(&[]).await.unwrap().is_empty());
    }
}
