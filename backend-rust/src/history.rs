//! # history
//!
//! Historical store interface: object upserts, position upserts keyed by
//! `(object_id, timestamp, source)`, ranged history reads, and the durable
//! last-published map. Production speaks Postgres through sqlx; the in-memory
//! implementation backs tests.
//!
//! The composite position key is the uniqueness invariant — it deliberately
//! retains contributions from multiple sources at the same instant, and makes
//! re-persisting the same message a no-op rather than a duplicate row.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use telemetry_types::{FusedRecord, ObjectKind};
use thiserror::Error;
use tokio::time::timeout;

const DB_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("database operation timed out")]
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRow {
    pub object_id: String,
    pub event_ts: i64,
    pub source: String,
    pub lat: f64,
    pub lon: f64,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub status: Option<String>,
    pub score: Option<f64>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create-or-update the object row by primary identifier.
    async fn upsert_object(&self, rec: &FusedRecord) -> Result<(), StoreError>;

    /// Upsert one position row keyed by `(object_id, timestamp, source)`.
    async fn upsert_position(&self, rec: &FusedRecord) -> Result<(), StoreError>;

    async fn load_last_published(
        &self,
        kind: ObjectKind,
        key: &str,
    ) -> Result<Option<i64>, StoreError>;

    /// Advance the durable last-published timestamp for a key.
    async fn mark_published(
        &self,
        kind: ObjectKind,
        key: &str,
        ts: i64,
    ) -> Result<(), StoreError>;

    /// Append-only history read by range.
    async fn fetch_positions(
        &self,
        object_id: &str,
        from_ms: i64,
        to_ms: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PositionRow>, StoreError>;
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap_or_default())
}

// ── Postgres implementation ───────────────────────────────────────────────────

pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(DB_TIMEOUT)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Idempotent schema bootstrap. Not a migration system — just enough DDL
    /// for a fresh database to come up.
    async fn init_schema(&self) -> Result<(), StoreError> {
        for ddl in [
            r#"CREATE TABLE IF NOT EXISTS tracked_objects (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                mmsi TEXT,
                imo TEXT,
                callsign TEXT,
                name TEXT,
                registration TEXT,
                icao24 TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
            r#"CREATE TABLE IF NOT EXISTS object_positions (
                object_id TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                source TEXT NOT NULL,
                lat DOUBLE PRECISION NOT NULL,
                lon DOUBLE PRECISION NOT NULL,
                speed DOUBLE PRECISION,
                course DOUBLE PRECISION,
                heading DOUBLE PRECISION,
                altitude DOUBLE PRECISION,
                vertical_rate DOUBLE PRECISION,
                status TEXT,
                score DOUBLE PRECISION,
                PRIMARY KEY (object_id, ts, source)
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_object_positions_ts
                ON object_positions (object_id, ts)"#,
            r#"CREATE TABLE IF NOT EXISTS last_published (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (kind, key)
            )"#,
        ] {
            self.exec(sqlx::query(ddl)).await?;
        }
        Ok(())
    }

    async fn exec(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), StoreError> {
        match timeout(DB_TIMEOUT, query.execute(&self.pool)).await {
            Err(_) => Err(StoreError::Timeout),
            Ok(res) => {
                res?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn upsert_object(&self, rec: &FusedRecord) -> Result<(), StoreError> {
        let q = sqlx::query(
            r#"INSERT INTO tracked_objects (id, kind, mmsi, imo, callsign, name, registration, icao24, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
               ON CONFLICT (id) DO UPDATE SET
                   mmsi = COALESCE(EXCLUDED.mmsi, tracked_objects.mmsi),
                   imo = COALESCE(EXCLUDED.imo, tracked_objects.imo),
                   callsign = COALESCE(EXCLUDED.callsign, tracked_objects.callsign),
                   name = COALESCE(EXCLUDED.name, tracked_objects.name),
                   registration = COALESCE(EXCLUDED.registration, tracked_objects.registration),
                   icao24 = COALESCE(EXCLUDED.icao24, tracked_objects.icao24),
                   updated_at = now()"#,
        )
        .bind(rec.key.as_str())
        .bind(rec.kind.as_str())
        .bind(rec.mmsi.as_deref())
        .bind(rec.imo.as_deref())
        .bind(rec.callsign.as_deref())
        .bind(rec.name.as_deref())
        .bind(rec.registration.as_deref())
        .bind(rec.icao24.as_deref());
        self.exec(q).await
    }

    async fn upsert_position(&self, rec: &FusedRecord) -> Result<(), StoreError> {
        let q = sqlx::query(
            r#"INSERT INTO object_positions
                   (object_id, ts, source, lat, lon, speed, course, heading, altitude, vertical_rate, status, score)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (object_id, ts, source) DO UPDATE SET
                   lat = EXCLUDED.lat,
                   lon = EXCLUDED.lon,
                   speed = EXCLUDED.speed,
                   course = EXCLUDED.course,
                   heading = EXCLUDED.heading,
                   altitude = EXCLUDED.altitude,
                   vertical_rate = EXCLUDED.vertical_rate,
                   status = EXCLUDED.status,
                   score = EXCLUDED.score"#,
        )
        .bind(rec.key.as_str())
        .bind(ms_to_utc(rec.event_ts))
        .bind(rec.source.as_str())
        .bind(rec.lat)
        .bind(rec.lon)
        .bind(rec.speed)
        .bind(rec.course)
        .bind(rec.heading)
        .bind(rec.altitude)
        .bind(rec.vertical_rate)
        .bind(rec.status.as_deref())
        .bind(rec.score);
        self.exec(q).await
    }

    async fn load_last_published(
        &self,
        kind: ObjectKind,
        key: &str,
    ) -> Result<Option<i64>, StoreError> {
        let fut = sqlx::query("SELECT ts FROM last_published WHERE kind = $1 AND key = $2")
            .bind(kind.as_str())
            .bind(key)
            .fetch_optional(&self.pool);
        match timeout(DB_TIMEOUT, fut).await {
            Err(_) => Err(StoreError::Timeout),
            Ok(res) => {
                let row = res?;
                Ok(row
                    .map(|r| r.try_get::<DateTime<Utc>, _>("ts"))
                    .transpose()?
                    .map(|ts| ts.timestamp_millis()))
            }
        }
    }

    async fn mark_published(
        &self,
        kind: ObjectKind,
        key: &str,
        ts: i64,
    ) -> Result<(), StoreError> {
        let q = sqlx::query(
            r#"INSERT INTO last_published (kind, key, ts) VALUES ($1, $2, $3)
               ON CONFLICT (kind, key) DO UPDATE SET ts = EXCLUDED.ts"#,
        )
        .bind(kind.as_str())
        .bind(key)
        .bind(ms_to_utc(ts));
        self.exec(q).await
    }

    async fn fetch_positions(
        &self,
        object_id: &str,
        from_ms: i64,
        to_ms: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PositionRow>, StoreError> {
        let fut = sqlx::query(
            r#"SELECT object_id, ts, source, lat, lon, speed, course, heading,
                      altitude, vertical_rate, status, score
               FROM object_positions
               WHERE object_id = $1 AND ts >= $2 AND ts <= $3
               ORDER BY ts ASC
               LIMIT $4 OFFSET $5"#,
        )
        .bind(object_id)
        .bind(ms_to_utc(from_ms))
        .bind(ms_to_utc(to_ms))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool);

        let rows = match timeout(DB_TIMEOUT, fut).await {
            Err(_) => return Err(StoreError::Timeout),
            Ok(res) => res?,
        };
        rows.into_iter()
            .map(|r| {
                Ok(PositionRow {
                    object_id: r.try_get("object_id")?,
                    event_ts: r.try_get::<DateTime<Utc>, _>("ts")?.timestamp_millis(),
                    source: r.try_get("source")?,
                    lat: r.try_get("lat")?,
                    lon: r.try_get("lon")?,
                    speed: r.try_get("speed")?,
                    course: r.try_get("course")?,
                    heading: r.try_get("heading")?,
                    altitude: r.try_get("altitude")?,
                    vertical_rate: r.try_get("vertical_rate")?,
                    status: r.try_get("status")?,
                    score: r.try_get("score")?,
                })
            })
            .collect()
    }
}

// ── In-memory implementation (tests) ──────────────────────────────────────────

#[derive(Default)]
pub struct MemoryHistory {
    pub objects: parking_lot::Mutex<HashMap<String, FusedRecord>>,
    pub positions: parking_lot::Mutex<HashMap<(String, i64, String), PositionRow>>,
    pub last_published: parking_lot::Mutex<HashMap<(String, String), i64>>,
    /// When true, `mark_published` fails — for ordering tests.
    pub fail_mark: std::sync::atomic::AtomicBool,
    /// When true, position upserts fail — for persist-failure tests.
    pub fail_persist: std::sync::atomic::AtomicBool,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position_count(&self) -> usize {
        self.positions.lock().len()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn upsert_object(&self, rec: &FusedRecord) -> Result<(), StoreError> {
        self.objects.lock().insert(rec.key.clone(), rec.clone());
        Ok(())
    }

    async fn upsert_position(&self, rec: &FusedRecord) -> Result<(), StoreError> {
        if self.fail_persist.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Timeout);
        }
        let row = PositionRow {
            object_id: rec.key.clone(),
            event_ts: rec.event_ts,
            source: rec.source.clone(),
            lat: rec.lat,
            lon: rec.lon,
            speed: rec.speed,
            course: rec.course,
            heading: rec.heading,
            altitude: rec.altitude,
            vertical_rate: rec.vertical_rate,
            status: rec.status.clone(),
            score: Some(rec.score),
        };
        self.positions
            .lock()
            .insert((rec.key.clone(), rec.event_ts, rec.source.clone()), row);
        Ok(())
    }

    async fn load_last_published(
        &self,
        kind: ObjectKind,
        key: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .last_published
            .lock()
            .get(&(kind.as_str().to_string(), key.to_string()))
            .copied())
    }

    async fn mark_published(
        &self,
        kind: ObjectKind,
        key: &str,
        ts: i64,
    ) -> Result<(), StoreError> {
        if self.fail_mark.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Timeout);
        }
        self.last_published
            .lock()
            .insert((kind.as_str().to_string(), key.to_string()), ts);
        Ok(())
    }

    async fn fetch_positions(
        &self,
        object_id: &str,
        from_ms: i64,
        to_ms: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PositionRow>, StoreError> {
        let mut rows: Vec<PositionRow> = self
            .positions
            .lock()
            .values()
            .filter(|r| {
                r.object_id == object_id && r.event_ts >= from_ms && r.event_ts <= to_ms
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.event_ts);
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
