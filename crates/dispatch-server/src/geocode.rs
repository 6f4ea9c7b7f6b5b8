/// Geocoder with provider fallback, two cache tiers, and per-key
/// singleflight.
///
/// Lookup path: in-process LRU (24 h TTL) → persistent cache table →
/// providers in configured order. Negative results cache for 1 h so a
/// bad address does not hammer the providers.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, warn};

use dispatch_protocol::error::PipelineError;
use dispatch_store::CallStore;

use crate::config::GeocoderSection;
use crate::health::HealthCollector;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);
const PER_PROVIDER_CONCURRENCY: usize = 2;
const MEMORY_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted: String,
}

struct Provider {
    name: String,
    template: String,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

struct MemoryEntry {
    result: Option<GeocodeResult>,
    stored_at: Instant,
    ttl: Duration,
}

pub struct Geocoder {
    providers: Vec<Provider>,
    store: Arc<CallStore>,
    health: Arc<HealthCollector>,
    memory: Mutex<(HashMap<String, MemoryEntry>, VecDeque<String>)>,
    inflight: Mutex<HashMap<String, Arc<OnceCell<Option<GeocodeResult>>>>>,
    default_suffix: Option<String>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl Geocoder {
    pub fn new(config: &GeocoderSection, store: Arc<CallStore>, health: Arc<HealthCollector>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .user_agent("dispatch-intel/0.1")
            .build()
            .unwrap_or_default();

        let mut providers = vec![Provider {
            name: "primary".into(),
            template: config.primary.clone(),
            client: client.clone(),
            permits: Arc::new(Semaphore::new(PER_PROVIDER_CONCURRENCY)),
        }];
        if let Some(fallback) = config.fallback.as_ref() {
            providers.push(Provider {
                name: "fallback".into(),
                template: fallback.clone(),
                client,
                permits: Arc::new(Semaphore::new(PER_PROVIDER_CONCURRENCY)),
            });
        }

        Self {
            providers,
            store,
            health,
            memory: Mutex::new((HashMap::new(), VecDeque::new())),
            inflight: Mutex::new(HashMap::new()),
            default_suffix: config.default_suffix.clone(),
            positive_ttl: Duration::from_secs(config.cache_ttl_seconds.max(0) as u64),
            negative_ttl: Duration::from_secs(config.negative_ttl_seconds.max(0) as u64),
        }
    }

    pub async fn geocode(&self, address: &str) -> Option<GeocodeResult> {
        let key = self.normalize(address);
        if key.is_empty() {
            return None;
        }
        self.health
            .geocode_lookups
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if let Some(cached) = self.memory_get(&key) {
            self.count_hit();
            return cached;
        }

        if let Ok(Some(entry)) = self.store.geocode_cache_get(&key, Utc::now()) {
            self.count_hit();
            let result = entry.coords.map(|(lat, lng, formatted)| GeocodeResult {
                latitude: lat,
                longitude: lng,
                formatted,
            });
            let negative = result.is_none();
            self.memory_put(&key, result.clone(), negative);
            return result;
        }

        // Singleflight: concurrent lookups for the same key share one
        // provider call.
        let cell = {
            let mut inflight = self.inflight.lock().unwrap();
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };
        let result = cell
            .get_or_init(|| self.lookup_and_cache(key.clone()))
            .await
            .clone();
        self.inflight.lock().unwrap().remove(&key);
        result
    }

    async fn lookup_and_cache(&self, key: String) -> Option<GeocodeResult> {
        for provider in &self.providers {
            match self.query_provider(provider, &key).await {
                Ok(Some(result)) => {
                    let _ = self.store.geocode_cache_put(
                        &key,
                        Some((result.latitude, result.longitude, result.formatted.as_str())),
                        self.positive_ttl.as_secs() as i64,
                        Utc::now(),
                    );
                    self.memory_put(&key, Some(result.clone()), false);
                    return Some(result);
                }
                Ok(None) => {
                    // Authoritative miss: cache the negative and stop.
                    let _ = self.store.geocode_cache_put(
                        &key,
                        None,
                        self.negative_ttl.as_secs() as i64,
                        Utc::now(),
                    );
                    self.memory_put(&key, None, true);
                    return None;
                }
                Err(e) if e.is_transient() => {
                    warn!(provider = %provider.name, error = %e, "geocode provider unavailable");
                    continue;
                }
                Err(e) => {
                    warn!(provider = %provider.name, error = %e, "geocode request rejected");
                    continue;
                }
            }
        }
        // Every provider failed; do not cache so the next call retries.
        None
    }

    async fn query_provider(
        &self,
        provider: &Provider,
        query: &str,
    ) -> Result<Option<GeocodeResult>, PipelineError> {
        let _permit = provider
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::Unexpected("geocoder semaphore closed".into()))?;

        let url = provider
            .template
            .replace("{query}", &percent_encode(query));

        let mut last_err = PipelineError::Dependency("no attempt made".into());
        // One retry, only on transient failures.
        for attempt in 0..2 {
            match provider.client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if resp.status().is_success() {
                        let body: serde_json::Value = resp.json().await.map_err(|e| {
                            PipelineError::Permanent(format!("bad geocode body: {e}"))
                        })?;
                        return Ok(parse_geocode_body(&body));
                    }
                    let err = PipelineError::from_status(status, &provider.name);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    last_err = err;
                }
                Err(e) => {
                    last_err = PipelineError::Transient(format!("{}: {e}", provider.name));
                }
            }
            if attempt == 0 {
                debug!(provider = %provider.name, "retrying geocode request");
            }
        }
        Err(last_err)
    }

    /// Lowercase, collapse whitespace, append the jurisdiction suffix to
    /// bare street addresses.
    pub fn normalize(&self, address: &str) -> String {
        let mut normalized = address
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if normalized.is_empty() {
            return normalized;
        }
        if let Some(suffix) = self.default_suffix.as_ref() {
            if !normalized.contains(',') {
                normalized = format!("{normalized}, {}", suffix.to_lowercase());
            }
        }
        normalized
    }

    fn memory_get(&self, key: &str) -> Option<Option<GeocodeResult>> {
        let mut memory = self.memory.lock().unwrap();
        let (map, _) = &mut *memory;
        match map.get(key) {
            Some(entry) if entry.stored_at.elapsed() < entry.ttl => Some(entry.result.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    fn memory_put(&self, key: &str, result: Option<GeocodeResult>, negative: bool) {
        let ttl = if negative {
            self.negative_ttl
        } else {
            self.positive_ttl
        };
        let mut memory = self.memory.lock().unwrap();
        let (map, order) = &mut *memory;
        while map.len() >= MEMORY_CACHE_CAPACITY {
            let Some(oldest) = order.pop_front() else {
                break;
            };
            map.remove(&oldest);
        }
        let fresh = map
            .insert(
                key.to_string(),
                MemoryEntry {
                    result,
                    stored_at: Instant::now(),
                    ttl,
                },
            )
            .is_none();
        if fresh {
            order.push_back(key.to_string());
        }
    }

    fn count_hit(&self) {
        self.health
            .geocode_cache_hits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Accepts the provider body shapes seen in the wild: a bare array of
/// `{lat, lon, display_name}` (string or number coordinates), or an
/// object wrapping the same under `results`.
fn parse_geocode_body(body: &serde_json::Value) -> Option<GeocodeResult> {
    let candidate = match body {
        serde_json::Value::Array(items) => items.first()?,
        serde_json::Value::Object(map) => map.get("results")?.as_array()?.first()?,
        _ => return None,
    };

    let latitude = number_field(candidate, &["lat", "latitude"])?;
    let longitude = number_field(candidate, &["lon", "lng", "longitude"])?;
    let formatted = candidate
        .get("display_name")
        .or_else(|| candidate.get("formatted"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Some(GeocodeResult {
        latitude,
        longitude,
        formatted,
    })
}

fn number_field(value: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(v) = value.get(key) {
            if let Some(n) = v.as_f64() {
                return Some(n);
            }
            if let Some(s) = v.as_str() {
                if let Ok(n) = s.parse::<f64>() {
                    return Some(n);
                }
            }
        }
    }
    None
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geocoder(suffix: Option<&str>) -> Geocoder {
        let config = GeocoderSection {
            primary: "http://127.0.0.1:1/search?q={query}".into(),
            fallback: None,
            cache_ttl_seconds: 86_400,
            negative_ttl_seconds: 3_600,
            default_suffix: suffix.map(Into::into),
        };
        Geocoder::new(
            &config,
            Arc::new(CallStore::open_in_memory().unwrap()),
            Arc::new(HealthCollector::new()),
        )
    }

    #[test]
    fn test_normalization_appends_suffix_once() {
        let g = geocoder(Some("Indianapolis, IN"));
        assert_eq!(
            g.normalize("1555  South Harding Street"),
            "1555 south harding street, indianapolis, in"
        );
        // Already-qualified addresses keep their jurisdiction.
        assert_eq!(
            g.normalize("10 Main St, Carmel, IN"),
            "10 main st, carmel, in"
        );
    }

    #[test]
    fn test_parse_nominatim_array_body() {
        let body = serde_json::json!([
            {"lat": "39.7516", "lon": "-86.1919", "display_name": "1555 S Harding St"}
        ]);
        let parsed = parse_geocode_body(&body).unwrap();
        assert!((parsed.latitude - 39.7516).abs() < 1e-9);
        assert_eq!(parsed.formatted, "1555 S Harding St");
    }

    #[test]
    fn test_parse_wrapped_results_body() {
        let body = serde_json::json!({
            "results": [{"latitude": 39.7, "longitude": -86.1, "formatted": "somewhere"}]
        });
        let parsed = parse_geocode_body(&body).unwrap();
        assert_eq!(parsed.formatted, "somewhere");
        assert!(parse_geocode_body(&serde_json::json!([])).is_none());
    }

    #[test]
    fn test_percent_encoding() {
        assert_eq!(
            percent_encode("1555 harding st, indy"),
            "1555%20harding%20st%2C%20indy"
        );
    }

    #[tokio::test]
    async fn test_persistent_cache_short_circuits_providers() {
        // The provider URL is unroutable, so a hit proves the cache path.
        let g = geocoder(None);
        g.store
            .geocode_cache_put(
                "1555 south harding street",
                Some((39.75, -86.19, "1555 S Harding St")),
                86_400,
                Utc::now(),
            )
            .unwrap();

        let result = g.geocode("1555 South Harding Street").await.unwrap();
        assert!((result.latitude - 39.75).abs() < 1e-9);

        // Second call lands in the in-process tier.
        let again = g.geocode("1555 south  harding street").await.unwrap();
        assert_eq!(again, result);
    }
}
