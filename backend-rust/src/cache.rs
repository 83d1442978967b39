//! # cache
//!
//! Realtime cache interface: pub/sub fan-out plus latest-state keys. The
//! production implementation speaks Redis through a connection manager; the
//! in-memory implementation backs tests.
//!
//! Command surface per record kind:
//! - vessels: `SET vessel:last:<key> <json> EX 600`, `GEOADD ais:vessels:geo`,
//!   `HSET ais:vessel:<mmsi> …`, `ZADD ais:vessels:active <event_ts> <mmsi>`
//! - aircraft: `HSET adsb:current_flights <hexident> <json>` + `EXPIRE`
//! - both: `PUBLISH {vessel|aircraft}:position:update <json>`

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use telemetry_types::{FusedRecord, ObjectKind};
use thiserror::Error;
use tokio::time::timeout;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);
const LAST_STATE_TTL_S: u64 = 600;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache operation timed out")]
    Timeout,
}

#[async_trait]
pub trait RealtimeCache: Send + Sync {
    /// `PUBLISH <channel> <payload>`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError>;

    /// Cache the latest state for a published record (kind-specific keys).
    async fn cache_record(&self, rec: &FusedRecord, payload: &str) -> Result<(), CacheError>;

    /// `HSET <hash_key> <hexident> <payload>` + `EXPIRE <hash_key> <ttl>`.
    async fn upsert_flight_hash(
        &self,
        hash_key: &str,
        hexident: &str,
        payload: &str,
        ttl_s: u64,
    ) -> Result<(), CacheError>;
}

// ── Redis implementation ──────────────────────────────────────────────────────

pub struct RedisCache {
    conn: ConnectionManager,
    adsb_hash_key: String,
    adsb_ttl_s: u64,
}

impl RedisCache {
    pub async fn connect(
        url: &str,
        adsb_hash_key: String,
        adsb_ttl_s: u64,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            adsb_hash_key,
            adsb_ttl_s,
        })
    }

    async fn run(&self, pipe: redis::Pipeline) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let res: Result<Result<(), redis::RedisError>, _> =
            timeout(PUBLISH_TIMEOUT, pipe.query_async(&mut conn)).await;
        match res {
            Err(_) => Err(CacheError::Timeout),
            Ok(inner) => inner.map_err(CacheError::from),
        }
    }
}

#[async_trait]
impl RealtimeCache for RedisCache {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        let mut pipe = redis::pipe();
        pipe.cmd("PUBLISH").arg(channel).arg(payload).ignore();
        self.run(pipe).await
    }

    async fn cache_record(&self, rec: &FusedRecord, payload: &str) -> Result<(), CacheError> {
        match rec.kind {
            ObjectKind::Vessel => {
                let mut pipe = redis::pipe();
                pipe.cmd("SET")
                    .arg(format!("vessel:last:{}", rec.key))
                    .arg(payload)
                    .arg("EX")
                    .arg(LAST_STATE_TTL_S)
                    .ignore();
                if let Some(mmsi) = &rec.mmsi {
                    pipe.cmd("GEOADD")
                        .arg("ais:vessels:geo")
                        .arg(rec.lon)
                        .arg(rec.lat)
                        .arg(mmsi)
                        .ignore();
                    pipe.cmd("HSET")
                        .arg(format!("ais:vessel:{mmsi}"))
                        .arg("lat")
                        .arg(rec.lat)
                        .arg("lon")
                        .arg(rec.lon)
                        .arg("speed")
                        .arg(rec.speed.unwrap_or(0.0))
                        .arg("course")
                        .arg(rec.course.unwrap_or(0.0))
                        .arg("eventTs")
                        .arg(rec.event_ts)
                        .arg("source")
                        .arg(&rec.source)
                        .ignore();
                    pipe.cmd("ZADD")
                        .arg("ais:vessels:active")
                        .arg(rec.event_ts)
                        .arg(mmsi)
                        .ignore();
                }
                self.run(pipe).await
            }
            ObjectKind::Aircraft => {
                let hexident = rec.icao24.as_deref().unwrap_or(&rec.key);
                self.upsert_flight_hash(&self.adsb_hash_key, hexident, payload, self.adsb_ttl_s)
                    .await
            }
        }
    }

    async fn upsert_flight_hash(
        &self,
        hash_key: &str,
        hexident: &str,
        payload: &str,
        ttl_s: u64,
    ) -> Result<(), CacheError> {
        let mut pipe = redis::pipe();
        pipe.cmd("HSET").arg(hash_key).arg(hexident).arg(payload).ignore();
        pipe.cmd("EXPIRE").arg(hash_key).arg(ttl_s).ignore();
        self.run(pipe).await
    }
}

// ── In-memory implementation (tests) ──────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCache {
    pub published: parking_lot::Mutex<Vec<(String, String)>>,
    pub latest: parking_lot::Mutex<std::collections::HashMap<String, String>>,
    pub hashes:
        parking_lot::Mutex<std::collections::HashMap<String, std::collections::HashMap<String, String>>>,
    /// When true, `publish` fails — for retry/backoff tests.
    pub fail_publish: std::sync::atomic::AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl RealtimeCache for MemoryCache {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        if self.fail_publish.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CacheError::Timeout);
        }
        self.published
            .lock()
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn cache_record(&self, rec: &FusedRecord, payload: &str) -> Result<(), CacheError> {
        match rec.kind {
            ObjectKind::Vessel => {
                self.latest
                    .lock()
                    .insert(format!("vessel:last:{}", rec.key), payload.to_string());
                Ok(())
            }
            ObjectKind::Aircraft => {
                let hexident = rec.icao24.clone().unwrap_or_else(|| rec.key.clone());
                self.upsert_flight_hash("adsb:current_flights", &hexident, payload, 300)
                    .await
            }
        }
    }

    async fn upsert_flight_hash(
        &self,
        hash_key: &str,
        hexident: &str,
        payload: &str,
        _ttl_s: u64,
    ) -> Result<(), CacheError> {
        self.hashes
            .lock()
            .entry(hash_key.to_string())
            .or_default()
            .insert(hexident.to_string(), payload.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(kind: ObjectKind) -> FusedRecord {
        FusedRecord {
            kind,
            key: "k1".into(),
            mmsi: (kind == ObjectKind::Vessel).then(|| "123".to_string()),
            imo: None,
            icao24: (kind == ObjectKind::Aircraft).then(|| "abcd12".to_string()),
            registration: None,
            callsign: None,
            name: None,
            lat: 1.0,
            lon: 2.0,
            speed: None,
            course: None,
            heading: None,
            altitude: None,
            vertical_rate: None,
            status: None,
            source: "ais".into(),
            score: 0.9,
            predicted: false,
            event_ts: 1_755_000_000_000,
        }
    }

    #[tokio::test]
    async fn memory_cache_records_by_kind() {
        let c = MemoryCache::new();
        c.cache_record(&rec(ObjectKind::Vessel), "{}").await.unwrap();
        assert!(c.latest.lock().contains_key("vessel:last:k1"));

        c.cache_record(&rec(ObjectKind::Aircraft), "{}").await.unwrap();
        let hashes = c.hashes.lock();
        assert_eq!(hashes["adsb:current_flights"]["abcd12"], "{}");
    }

    #[tokio::test]
    async fn publish_failure_is_injectable() {
        let c = MemoryCache::new();
        c.fail_publish
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(c.publish("vessel:position:update", "{}").await.is_err());
    }
}
