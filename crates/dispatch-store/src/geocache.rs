/// Persistent geocode cache keyed by normalized address. Negative
/// results cache too, with their own (shorter) TTL.
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::{from_epoch_ms, to_epoch_ms, CallStore, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedGeocode {
    /// None for a cached negative result.
    pub coords: Option<(f64, f64, String)>,
    pub cached_at: DateTime<Utc>,
}

impl CallStore {
    /// Fetch a cache entry if it exists and has not outlived its TTL.
    pub fn geocode_cache_get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CachedGeocode>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT latitude, longitude, formatted, found, cached_at, ttl_seconds
                     FROM geocode_cache WHERE address_key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, Option<f64>>(0)?,
                            row.get::<_, Option<f64>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;

            let Some((lat, lng, formatted, found, cached_at_ms, ttl_seconds)) = row else {
                return Ok(None);
            };
            let cached_at = from_epoch_ms(cached_at_ms);
            if (now - cached_at).num_seconds() >= ttl_seconds {
                return Ok(None);
            }

            let coords = match (found, lat, lng) {
                (true, Some(lat), Some(lng)) => {
                    Some((lat, lng, formatted.unwrap_or_default()))
                }
                _ => None,
            };
            Ok(Some(CachedGeocode { coords, cached_at }))
        })
    }

    pub fn geocode_cache_put(
        &self,
        key: &str,
        result: Option<(f64, f64, &str)>,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO geocode_cache
                 (address_key, latitude, longitude, formatted, found, cached_at, ttl_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key,
                    result.map(|r| r.0),
                    result.map(|r| r.1),
                    result.map(|r| r.2),
                    result.is_some(),
                    to_epoch_ms(now),
                    ttl_seconds,
                ],
            )?;
            Ok(())
        })
    }

    pub fn geocode_cache_purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM geocode_cache
                 WHERE cached_at + ttl_seconds * 1000 <= ?1",
                params![to_epoch_ms(now)],
            )?;
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_positive_entry_round_trip_and_ttl() {
        let store = CallStore::open_in_memory().unwrap();
        store
            .geocode_cache_put(
                "1555 south harding street",
                Some((39.75, -86.19, "1555 S Harding St")),
                86_400,
                t0(),
            )
            .unwrap();

        let hit = store
            .geocode_cache_get("1555 south harding street", t0() + Duration::hours(1))
            .unwrap()
            .unwrap();
        assert_eq!(
            hit.coords,
            Some((39.75, -86.19, "1555 S Harding St".to_string()))
        );

        // Past the TTL the entry no longer serves.
        assert!(store
            .geocode_cache_get("1555 south harding street", t0() + Duration::days(2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_negative_entry_caches() {
        let store = CallStore::open_in_memory().unwrap();
        store
            .geocode_cache_put("nowhere at all", None, 3_600, t0())
            .unwrap();

        let hit = store
            .geocode_cache_get("nowhere at all", t0() + Duration::minutes(30))
            .unwrap()
            .unwrap();
        assert!(hit.coords.is_none());

        assert!(store
            .geocode_cache_get("nowhere at all", t0() + Duration::hours(2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_purge_expired() {
        let store = CallStore::open_in_memory().unwrap();
        store
            .geocode_cache_put("a", Some((1.0, 2.0, "a")), 60, t0())
            .unwrap();
        store
            .geocode_cache_put("b", Some((3.0, 4.0, "b")), 86_400, t0())
            .unwrap();

        let purged = store
            .geocode_cache_purge_expired(t0() + Duration::hours(1))
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store
            .geocode_cache_get("b", t0() + Duration::hours(1))
            .unwrap()
            .is_some());
    }
}
