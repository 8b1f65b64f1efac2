use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::kv::KvStore;

const HTTP_TIMEOUT_SECS: u64 = 10;
const BASE_BACKOFF_MS: u64 = 250;
const CACHE_KEY_PREFIX: &str = "geocode";

/// Structured street address extracted from a reverse-geocoding response.
/// Every field is independently optional; missing data in the provider
/// response is normal, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub number: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub zipcode: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    #[serde(default)]
    address_components: Vec<AddressComponent>,
}

#[derive(Debug, Deserialize)]
struct AddressComponent {
    long_name: Option<String>,
    short_name: Option<String>,
    #[serde(default)]
    types: Vec<String>,
}

#[derive(Clone, Copy)]
enum ComponentField {
    LongName,
    ShortName,
}

/// TTL'd cache of resolution outcomes, keyed by coordinate pair.
///
/// A stored value is `Option<Address>`: `None` records a definitive
/// ZERO_RESULTS and is just as final as an address. The outer `Option`
/// returned by [`ResolutionCache::get`] distinguishes "not cached" from
/// "cached no-result".
#[derive(Clone)]
pub struct ResolutionCache {
    kv: KvStore,
    ttl_secs: u64,
}

impl ResolutionCache {
    pub fn new(kv: KvStore, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    pub fn get(&self, lat: f64, lng: f64) -> AppResult<Option<Option<Address>>> {
        match self.kv.get(&cache_key(lat, lng))? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, lat: f64, lng: f64, outcome: &Option<Address>) -> AppResult<()> {
        let payload = serde_json::to_string(outcome)?;
        self.kv.set_ex(&cache_key(lat, lng), &payload, self.ttl_secs)
    }
}

fn cache_key(lat: f64, lng: f64) -> String {
    format!("{CACHE_KEY_PREFIX}:{lat},{lng}")
}

/// Client for one reverse-geocoding lineage: wraps the HTTP call, the
/// resolution cache, credential rotation, and bounded retry.
///
/// Each pipeline worker owns its own `Geocoder`, so the "current key" is a
/// per-worker decision with no cross-worker coordination.
pub struct Geocoder {
    http: reqwest::Client,
    endpoint: String,
    keys: Vec<SecretString>,
    current_key: usize,
    cache: ResolutionCache,
    retry_budget: Duration,
    rng: StdRng,
}

impl Geocoder {
    pub fn new(config: &AppConfig, cache: ResolutionCache) -> AppResult<Self> {
        Self::with_rng(config, cache, StdRng::from_entropy())
    }

    /// Seedable constructor so tests get a deterministic key lineage.
    pub fn with_rng(config: &AppConfig, cache: ResolutionCache, mut rng: StdRng) -> AppResult<Self> {
        if config.geocoder_api_keys.is_empty() {
            return Err(AppError::Config(
                "geocoder requires at least one API key (GEOCODER_API_KEYS)".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        let current_key = rng.gen_range(0..config.geocoder_api_keys.len());
        Ok(Self {
            http,
            endpoint: config.geocoder_endpoint.clone(),
            keys: config.geocoder_api_keys.clone(),
            current_key,
            cache,
            retry_budget: Duration::from_secs(config.retry_max_secs),
            rng,
        })
    }

    /// Resolves one coordinate pair to an address, or `None` when the
    /// provider definitively knows nothing there.
    ///
    /// Makes at most one network call per distinct pair within the cache
    /// TTL; both outcomes are cached, transient failures never are.
    pub async fn address(&mut self, lat: f64, lng: f64) -> AppResult<Option<Address>> {
        if let Some(outcome) = self.cache.get(lat, lng)? {
            trace!(lat, lng, "resolution cache hit");
            return Ok(outcome);
        }

        let outcome = self.fetch_with_backoff(lat, lng).await?;
        self.cache.put(lat, lng, &outcome)?;
        Ok(outcome)
    }

    async fn fetch_with_backoff(&mut self, lat: f64, lng: f64) -> AppResult<Option<Address>> {
        let deadline = Instant::now() + self.retry_budget;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(lat, lng).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() => {
                    let delay = self.backoff_delay(attempt);
                    if Instant::now() + delay >= deadline {
                        return Err(AppError::RetryBudgetExceeded(self.retry_budget));
                    }
                    warn!(
                        lat,
                        lng,
                        attempt,
                        %err,
                        "geocoding attempt failed; retrying after {delay:?}"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One HTTP round trip, classified by provider status.
    async fn fetch_once(&mut self, lat: f64, lng: f64) -> AppResult<Option<Address>> {
        let latlng = format!("{lat},{lng}");
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("latlng", latlng.as_str()),
                ("key", self.keys[self.current_key].expose_secret()),
            ])
            .send()
            .await?;
        let body: GeocodeResponse = response.json().await?;

        match body.status.as_str() {
            "OK" => {
                let components = body
                    .results
                    .first()
                    .map(|result| result.address_components.as_slice())
                    .unwrap_or_default();
                Ok(Some(extract_address(components)))
            }
            "ZERO_RESULTS" => Ok(None),
            "OVER_QUERY_LIMIT" => {
                debug!(lat, lng, "current key over quota; rotating");
                self.rotate_key();
                Err(AppError::QuotaExhausted)
            }
            other => Err(AppError::Provider(other.to_string())),
        }
    }

    /// Switches to a different key from the pool. With a single-key pool
    /// there is nothing to rotate to and the current key is kept.
    fn rotate_key(&mut self) {
        if self.keys.len() < 2 {
            return;
        }
        let offset = self.rng.gen_range(1..self.keys.len());
        self.current_key = (self.current_key + offset) % self.keys.len();
    }

    fn backoff_delay(&mut self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter = Duration::from_millis(self.rng.gen_range(0..BASE_BACKOFF_MS));
        base + jitter
    }
}

/// First matching component wins for each semantic slot. The neighborhood
/// slot deliberately mirrors the street number: the downstream loader keys
/// on that duplication and it must survive the resolution stage intact.
fn extract_address(components: &[AddressComponent]) -> Address {
    Address {
        street: filter_by_type(components, "route", ComponentField::LongName),
        number: filter_by_type(components, "street_number", ComponentField::LongName),
        neighborhood: filter_by_type(components, "street_number", ComponentField::LongName),
        city: filter_by_type(
            components,
            "administrative_area_level_2",
            ComponentField::LongName,
        ),
        zipcode: filter_by_type(components, "postal_code", ComponentField::LongName),
        state: filter_by_type(
            components,
            "administrative_area_level_1",
            ComponentField::ShortName,
        ),
        country: filter_by_type(components, "country", ComponentField::LongName),
    }
}

fn filter_by_type(
    components: &[AddressComponent],
    type_name: &str,
    field: ComponentField,
) -> Option<String> {
    components
        .iter()
        .find(|component| component.types.iter().any(|t| t == type_name))
        .and_then(|component| match field {
            ComponentField::LongName => component.long_name.clone(),
            ComponentField::ShortName => component.short_name.clone(),
        })
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{cycle, json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;

    fn sample_components_json() -> serde_json::Value {
        json!([
            {"long_name": "1280", "short_name": "1280", "types": ["street_number"]},
            {"long_name": "Avenida Ipiranga", "short_name": "Av. Ipiranga", "types": ["route"]},
            {"long_name": "Porto Alegre", "short_name": "Porto Alegre",
             "types": ["administrative_area_level_2", "political"]},
            {"long_name": "Rio Grande do Sul", "short_name": "RS",
             "types": ["administrative_area_level_1", "political"]},
            {"long_name": "90160-093", "short_name": "90160-093", "types": ["postal_code"]},
            {"long_name": "Brazil", "short_name": "BR", "types": ["country", "political"]}
        ])
    }

    fn sample_components() -> Vec<AddressComponent> {
        serde_json::from_value(sample_components_json()).unwrap()
    }

    fn test_config(endpoint: String, keys: &[&str]) -> AppConfig {
        AppConfig {
            geocoder_endpoint: endpoint,
            geocoder_api_keys: keys
                .iter()
                .map(|key| SecretString::from(key.to_string()))
                .collect(),
            max_concurrent: 2,
            cache_expire_secs: 60,
            retry_max_secs: 5,
            intermediate_batch_sz: 250,
            intermediate_expire_secs: 60,
            database_file_name: "unused.db".into(),
        }
    }

    fn ok_body(components: serde_json::Value) -> serde_json::Value {
        json!({"status": "OK", "results": [{"address_components": components}]})
    }

    #[test]
    fn extracts_all_address_slots() {
        let address = extract_address(&sample_components());
        assert_eq!(address.street.as_deref(), Some("Avenida Ipiranga"));
        assert_eq!(address.number.as_deref(), Some("1280"));
        assert_eq!(address.neighborhood.as_deref(), Some("1280"));
        assert_eq!(address.city.as_deref(), Some("Porto Alegre"));
        assert_eq!(address.zipcode.as_deref(), Some("90160-093"));
        assert_eq!(address.state.as_deref(), Some("RS"));
        assert_eq!(address.country.as_deref(), Some("Brazil"));
    }

    #[test]
    fn extraction_tolerates_missing_components() {
        let address = extract_address(&[]);
        assert_eq!(
            address,
            Address {
                street: None,
                number: None,
                neighborhood: None,
                city: None,
                zipcode: None,
                state: None,
                country: None,
            }
        );
    }

    #[test]
    fn cache_distinguishes_no_result_from_miss() {
        let cache = ResolutionCache::new(KvStore::in_memory().unwrap(), 60);
        assert!(cache.get(1.0, 2.0).unwrap().is_none());

        cache.put(1.0, 2.0, &None).unwrap();
        assert_eq!(cache.get(1.0, 2.0).unwrap(), Some(None));
    }

    #[test]
    fn rotation_always_lands_on_a_different_key() {
        let kv = KvStore::in_memory().unwrap();
        let config = test_config("http://unused.invalid".into(), &["k0", "k1", "k2"]);
        let mut geocoder = Geocoder::with_rng(
            &config,
            ResolutionCache::new(kv, 60),
            StdRng::seed_from_u64(7),
        )
        .unwrap();

        for _ in 0..32 {
            let before = geocoder.current_key;
            geocoder.rotate_key();
            assert_ne!(geocoder.current_key, before);
        }
    }

    #[test]
    fn rotation_is_a_noop_with_a_single_key() {
        let kv = KvStore::in_memory().unwrap();
        let config = test_config("http://unused.invalid".into(), &["only"]);
        let mut geocoder = Geocoder::with_rng(
            &config,
            ResolutionCache::new(kv, 60),
            StdRng::seed_from_u64(7),
        )
        .unwrap();
        geocoder.rotate_key();
        assert_eq!(geocoder.current_key, 0);
    }

    #[tokio::test]
    async fn second_resolution_is_cache_only() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of!(
                request::method("GET"),
                request::query(url_decoded(contains(("latlng", "-30.05,-51.17")))),
            ))
            .times(1)
            .respond_with(json_encoded(ok_body(sample_components_json()))),
        );

        let config = test_config(server.url("/geocode").to_string(), &["key"]);
        let cache = ResolutionCache::new(KvStore::in_memory().unwrap(), 60);
        let mut geocoder =
            Geocoder::with_rng(&config, cache, StdRng::seed_from_u64(1)).unwrap();

        let first = geocoder.address(-30.05, -51.17).await.unwrap();
        let second = geocoder.address(-30.05, -51.17).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.unwrap().street.as_deref(),
            Some("Avenida Ipiranga")
        );
    }

    #[tokio::test]
    async fn zero_results_is_cached_like_a_success() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET"))
                .times(1)
                .respond_with(json_encoded(json!({"status": "ZERO_RESULTS", "results": []}))),
        );

        let config = test_config(server.url("/geocode").to_string(), &["key"]);
        let cache = ResolutionCache::new(KvStore::in_memory().unwrap(), 60);
        let mut geocoder =
            Geocoder::with_rng(&config, cache, StdRng::seed_from_u64(1)).unwrap();

        assert_eq!(geocoder.address(0.0, 0.0).await.unwrap(), None);
        // Second call must be served from cache; the expectation above
        // only allows one request.
        assert_eq!(geocoder.address(0.0, 0.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn over_query_limit_rotates_and_recovers() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of!(
                request::method("GET"),
                request::query(url_decoded(contains(("key", "key-zero")))),
            ))
            .times(1)
            .respond_with(json_encoded(
                json!({"status": "OVER_QUERY_LIMIT", "results": []}),
            )),
        );
        server.expect(
            Expectation::matching(all_of!(
                request::method("GET"),
                request::query(url_decoded(contains(("key", "key-one")))),
            ))
            .times(1)
            .respond_with(json_encoded(ok_body(sample_components_json()))),
        );

        let config = test_config(server.url("/geocode").to_string(), &["key-zero", "key-one"]);
        let cache = ResolutionCache::new(KvStore::in_memory().unwrap(), 60);
        let mut geocoder =
            Geocoder::with_rng(&config, cache, StdRng::seed_from_u64(1)).unwrap();
        // Pin the starting key so the expectations above are deterministic;
        // with a two-key pool rotation must land on the other key.
        geocoder.current_key = 0;

        let resolved = geocoder.address(10.0, 20.0).await.unwrap();
        assert_eq!(resolved.unwrap().country.as_deref(), Some("Brazil"));
    }

    #[tokio::test]
    async fn unrecognized_status_is_fatal() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET"))
                .times(1)
                .respond_with(json_encoded(json!({"status": "REQUEST_DENIED", "results": []}))),
        );

        let config = test_config(server.url("/geocode").to_string(), &["key"]);
        let cache = ResolutionCache::new(KvStore::in_memory().unwrap(), 60);
        let mut geocoder =
            Geocoder::with_rng(&config, cache, StdRng::seed_from_u64(1)).unwrap();

        match geocoder.address(1.0, 1.0).await {
            Err(AppError::Provider(status)) => assert_eq!(status, "REQUEST_DENIED"),
            other => panic!("expected provider error, got {other:?}"),
        }
        // Fatal outcomes are never cached.
        assert!(geocoder.cache.get(1.0, 1.0).unwrap().is_none());
    }

    #[tokio::test]
    async fn transport_failure_retries_and_recovers() {
        let server = Server::run();
        // First attempt gets a non-JSON 502, which surfaces as a transport
        // error; the retry must succeed.
        server.expect(
            Expectation::matching(request::method("GET"))
                .times(2)
                .respond_with(cycle![
                    status_code(502),
                    json_encoded(ok_body(sample_components_json())),
                ]),
        );

        let config = test_config(server.url("/geocode").to_string(), &["key"]);
        let cache = ResolutionCache::new(KvStore::in_memory().unwrap(), 60);
        let mut geocoder =
            Geocoder::with_rng(&config, cache, StdRng::seed_from_u64(1)).unwrap();

        let resolved = geocoder.address(3.0, 4.0).await.unwrap();
        assert_eq!(
            resolved.unwrap().street.as_deref(),
            Some("Avenida Ipiranga")
        );
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_surfaces() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("GET"))
                .times(1..)
                .respond_with(json_encoded(
                    json!({"status": "OVER_QUERY_LIMIT", "results": []}),
                )),
        );

        let mut config = test_config(server.url("/geocode").to_string(), &["a", "b"]);
        config.retry_max_secs = 1;
        let cache = ResolutionCache::new(KvStore::in_memory().unwrap(), 60);
        let mut geocoder =
            Geocoder::with_rng(&config, cache, StdRng::seed_from_u64(1)).unwrap();

        match geocoder.address(5.0, 5.0).await {
            Err(AppError::RetryBudgetExceeded(_)) => {}
            other => panic!("expected retry budget error, got {other:?}"),
        }
    }
}
