//! # config
//!
//! Environment-recognized configuration for the ingest-and-fusion core.
//!
//! Every tunable has a default matching production behavior; `Config::from_env`
//! only fails on values that are present but unparsable, or on missing
//! connection URLs — those are startup-fatal.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("invalid boolean for {name}: {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

// ── Window / validity ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Event-time width of the per-key sliding window (ms).
    pub window_ms: i64,
    /// Maximum wall-clock lateness for a realtime publish (ms).
    pub allowed_lateness_ms: i64,
    /// Messages whose event time is further than this from now are dropped (ms).
    pub max_event_age_ms: i64,
    /// Vessel speed cap, knots. Aircraft cap is fixed at 750 kn.
    pub vessel_speed_limit_kn: f64,
    pub max_events_per_key: usize,
    pub max_tracked_keys: usize,
}

impl WindowConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            window_ms: env_parse("WINDOW_MS", 5 * 60 * 1000)?,
            allowed_lateness_ms: env_parse("ALLOWED_LATENESS_MS", 10 * 60 * 1000)?,
            max_event_age_ms: env_parse("MAX_EVENT_AGE_MS", 24 * 60 * 60 * 1000)?,
            vessel_speed_limit_kn: env_parse("SPEED_LIMIT_KN", 90.0)?,
            max_events_per_key: env_parse("MAX_EVENTS_PER_KEY", 256)?,
            max_tracked_keys: env_parse("MAX_TRACKED_KEYS", 200_000)?,
        })
    }
}

pub const AIRCRAFT_SPEED_LIMIT_KN: f64 = 750.0;

// ── Smoother ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SmootherConfig {
    pub alpha: f64,
    pub beta: f64,
    pub max_prediction_s: f64,
    pub max_filter_age_ms: i64,
}

impl SmootherConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            alpha: env_parse("ALPHA", 0.25)?,
            beta: env_parse("BETA", 0.08)?,
            max_prediction_s: env_parse("MAX_PREDICTION_S", 600.0)?,
            max_filter_age_ms: env_parse("MAX_FILTER_AGE_MS", 30 * 60 * 1000)?,
        })
    }
}

// ── Resources ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub ingest_chan_cap: usize,
    pub worker_pool_size: usize,
    /// Dirty-key flush tick (ms).
    pub tick_ms: u64,
    /// Dead-reckoning publish interval (ms); 0 disables the predictor tick.
    pub predict_interval_ms: u64,
    /// Cooperative shutdown drain deadline (ms).
    pub shutdown_drain_ms: u64,
}

impl ResourceConfig {
    pub fn from_env() -> Result<Self> {
        let pool = env_parse("WORKER_POOL_SIZE", 5usize)?;
        if pool == 0 {
            bail!("WORKER_POOL_SIZE must be >= 1");
        }
        Ok(Self {
            ingest_chan_cap: env_parse("INGEST_CHAN_CAP", 8192)?,
            worker_pool_size: pool,
            tick_ms: env_parse("TICK_MS", 1000)?,
            predict_interval_ms: env_parse("PREDICT_INTERVAL_MS", 10_000)?,
            shutdown_drain_ms: env_parse("SHUTDOWN_DRAIN_MS", 5000)?,
        })
    }
}

// ── AIS push hub adapter ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AisHubConfig {
    pub enabled: bool,
    /// Hub base URL, e.g. `https://ais.example.com`.
    pub host: String,
    pub device: String,
    pub user_id: String,
    /// Fixed query filter; empty means time-window queries are built instead.
    pub query: String,
    pub auto_trigger: bool,
    pub auto_trigger_interval_ms: u64,
    /// Lookback for time-window queries, minutes.
    pub query_minutes: i64,
    /// Advance T0 from the max event ts of the previous batch instead of a
    /// fixed lookback.
    pub query_incremental: bool,
    pub using_last_update_time: bool,
    /// Hub connect timeout (s).
    pub connect_timeout_s: u64,
}

impl AisHubConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            enabled: env_bool("AIS_ENABLED", true)?,
            host: env_string("AIS_HOST", ""),
            device: env_string("AIS_DEVICE", "pelorus"),
            user_id: env_string("AIS_USER_ID", "pelorus-backend"),
            query: env_string("AIS_QUERY", ""),
            auto_trigger: env_bool("AIS_AUTO_TRIGGER", true)?,
            auto_trigger_interval_ms: env_parse("AIS_AUTO_TRIGGER_INTERVAL_MS", 30_000)?,
            query_minutes: env_parse("AIS_QUERY_MINUTES", 5)?,
            query_incremental: env_bool("AIS_QUERY_INCREMENTAL", true)?,
            using_last_update_time: env_bool("AIS_USING_LAST_UPDATE_TIME", true)?,
            connect_timeout_s: env_parse("AIS_CONNECT_TIMEOUT_S", 15)?,
        })
    }
}

// ── ADSB adapter ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdsbConfig {
    pub enabled: bool,
    pub interval_s: u64,
    /// Row cap passed upstream and enforced locally.
    pub limit_query: usize,
    pub redis_hash_key: String,
    pub redis_ttl_s: u64,
    /// Base URL of the external ADSB API, e.g. `https://adsb.example.com`.
    pub external_api_url: String,
    /// Safety cap on NDJSON batches per stream call.
    pub max_batches: usize,
    /// Safety cap on aircraft rows per stream call.
    pub max_aircraft: usize,
    /// Upstream field filter, forwarded verbatim (pass-through).
    pub field_filter: Option<String>,
    /// Upstream position filter, forwarded verbatim (pass-through).
    pub position_filter: Option<String>,
    /// In-process named-batch queue depth.
    pub batch_queue_cap: usize,
}

impl AdsbConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            enabled: env_bool("ADSB_COLLECTOR_ENABLED", true)?,
            interval_s: env_parse("ADSB_COLLECTOR_INTERVAL_S", 30)?,
            limit_query: env_parse("ADSB_LIMIT_QUERY", 10_000)?,
            redis_hash_key: env_string("ADSB_REDIS_HASH_KEY", "adsb:current_flights"),
            redis_ttl_s: env_parse("ADSB_REDIS_TTL", 300)?,
            external_api_url: env_string("ADSB_EXTERNAL_API_URL", ""),
            max_batches: env_parse("ADSB_MAX_BATCHES", 500)?,
            max_aircraft: env_parse("ADSB_MAX_AIRCRAFT", 50_000)?,
            field_filter: std::env::var("ADSB_FIELD_FILTER").ok(),
            position_filter: std::env::var("ADSB_POSITION_FILTER").ok(),
            batch_queue_cap: env_parse("ADSB_BATCH_QUEUE_CAP", 64)?,
        })
    }
}

// ── Source weights ────────────────────────────────────────────────────────────

/// Static per-source quality weights, overridable via `SOURCE_WEIGHT_<NAME>`.
#[derive(Debug, Clone)]
pub struct SourceWeights {
    weights: HashMap<String, f64>,
    unknown: f64,
}

impl SourceWeights {
    pub fn from_env() -> Result<Self> {
        let mut weights: HashMap<String, f64> = [
            ("marine_traffic", 0.90),
            ("adsb_exchange", 0.90),
            ("opensky", 0.85),
            ("vessel_finder", 0.85),
            ("aisstream", 0.88),
            ("signalr", 0.82),
            ("china_port", 0.80),
            ("ais", 0.75),
            ("custom", 0.70),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        for (name, raw) in std::env::vars() {
            if let Some(source) = name.strip_prefix("SOURCE_WEIGHT_") {
                let w: f64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid value for {name}: {raw:?}"))?;
                if !(0.0..=1.0).contains(&w) {
                    bail!("{name} must be within [0, 1], got {w}");
                }
                weights.insert(source.to_ascii_lowercase(), w);
            }
        }

        Ok(Self {
            weights,
            unknown: 0.50,
        })
    }

    pub fn weight(&self, source: &str) -> f64 {
        self.weights
            .get(&source.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.unknown)
    }
}

// ── Full config ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub window: WindowConfig,
    pub smoother: SmootherConfig,
    pub resources: ResourceConfig,
    pub ais: AisHubConfig,
    pub adsb: AdsbConfig,
    pub weights: SourceWeights,
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;
        Ok(Self {
            window: WindowConfig::from_env()?,
            smoother: SmootherConfig::from_env()?,
            resources: ResourceConfig::from_env()?,
            ais: AisHubConfig::from_env()?,
            adsb: AdsbConfig::from_env()?,
            weights: SourceWeights::from_env()?,
            database_url,
            redis_url,
            port: env_parse("PORT", 3001)?,
        })
    }
}
