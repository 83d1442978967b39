//! # smoother
//!
//! Per-key α–β filters for position smoothing and short-horizon dead
//! reckoning between measurements.
//!
//! State lives in degrees (x = lon, y = lat) and degrees/second. Measured
//! speed/course pairs convert through meters using a local flat-earth scale;
//! `cos(lat)` is clamped at 1e-6 so longitude scaling never blows up close to
//! the poles.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use telemetry_types::NormMsg;

use crate::config::SmootherConfig;
use crate::window::KeyRef;

pub const KNOT_TO_MPS: f64 = 0.514444;
pub const DEG_LAT_M: f64 = 111_320.0;
const MIN_DT_S: f64 = 0.5;
const CONFIDENCE_TAU_S: f64 = 300.0;
const VELOCITY_BLEND: f64 = 0.3;
const COS_LAT_EPS: f64 = 1e-6;
/// Below this, reconstructed speed reports as none.
const MIN_REPORTED_KN: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct FilterState {
    /// Longitude, degrees.
    pub x: f64,
    /// Latitude, degrees.
    pub y: f64,
    /// Degrees/second.
    pub vx: f64,
    pub vy: f64,
    pub last_update_ms: i64,
    pub confidence: f64,
    /// Wall time of the last dead-reckoned publish for this key.
    pub last_predict_ms: i64,
}

/// A dead-reckoned position with kinematics reconstructed from filter state.
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub lat: f64,
    pub lon: f64,
    pub speed_kn: Option<f64>,
    pub course: Option<f64>,
    pub confidence: f64,
}

fn cos_lat(lat: f64) -> f64 {
    lat.to_radians().cos().max(COS_LAT_EPS)
}

/// Convert measured (speed kn, course °) to state velocity at a latitude.
/// Course is a maritime bearing: 0 = North, 90 = East.
fn measured_velocity(speed_kn: f64, course_deg: f64, lat: f64) -> (f64, f64) {
    let mps = speed_kn * KNOT_TO_MPS;
    let rad = course_deg.to_radians();
    let ve = mps * rad.sin();
    let vn = mps * rad.cos();
    (ve / (DEG_LAT_M * cos_lat(lat)), vn / DEG_LAT_M)
}

impl FilterState {
    fn initialize(msg: &NormMsg) -> Self {
        let (vx, vy) = match (msg.speed, msg.course) {
            (Some(s), Some(c)) => measured_velocity(s, c, msg.lat),
            _ => (0.0, 0.0),
        };
        Self {
            x: msg.lon,
            y: msg.lat,
            vx,
            vy,
            last_update_ms: msg.event_ts,
            confidence: 1.0,
            last_predict_ms: 0,
        }
    }

    fn update(&mut self, msg: &NormMsg, alpha: f64, beta: f64) {
        let dt = ((msg.event_ts - self.last_update_ms) as f64 / 1000.0).max(MIN_DT_S);

        let xp = self.x + self.vx * dt;
        let yp = self.y + self.vy * dt;
        let rx = msg.lon - xp;
        let ry = msg.lat - yp;

        self.x = xp + alpha * rx;
        self.y = yp + alpha * ry;
        self.vx += (beta / dt) * rx;
        self.vy += (beta / dt) * ry;

        if let (Some(s), Some(c)) = (msg.speed, msg.course) {
            let (mvx, mvy) = measured_velocity(s, c, msg.lat);
            self.vx = (1.0 - VELOCITY_BLEND) * self.vx + VELOCITY_BLEND * mvx;
            self.vy = (1.0 - VELOCITY_BLEND) * self.vy + VELOCITY_BLEND * mvy;
        }

        self.last_update_ms = msg.event_ts.max(self.last_update_ms);
        self.confidence = 1.0;
    }

    fn predict(&self, target_ms: i64, max_prediction_s: f64) -> Option<Prediction> {
        let dt = (target_ms - self.last_update_ms) as f64 / 1000.0;
        if dt < 0.0 || dt > max_prediction_s {
            return None;
        }

        let lon = self.x + self.vx * dt;
        let lat = self.y + self.vy * dt;

        let ve = self.vx * DEG_LAT_M * cos_lat(lat);
        let vn = self.vy * DEG_LAT_M;
        let speed_kn = (ve * ve + vn * vn).sqrt() / KNOT_TO_MPS;
        let (speed_kn, course) = if speed_kn < MIN_REPORTED_KN {
            (None, None)
        } else {
            let course = ve.atan2(vn).to_degrees();
            let course = if course < 0.0 { course + 360.0 } else { course };
            (Some(speed_kn), Some(course))
        };

        Some(Prediction {
            lat,
            lon,
            speed_kn,
            course,
            confidence: self.confidence * (-dt / CONFIDENCE_TAU_S).exp(),
        })
    }
}

// ── Sharded filter map ────────────────────────────────────────────────────────

pub struct Smoother {
    shards: Vec<Mutex<HashMap<KeyRef, FilterState>>>,
    cfg: SmootherConfig,
}

impl Smoother {
    pub fn new(cfg: SmootherConfig, shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            cfg,
        }
    }

    fn shard(&self, key: &KeyRef) -> &Mutex<HashMap<KeyRef, FilterState>> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        &self.shards[(h.finish() as usize) % self.shards.len()]
    }

    /// Feed one published measurement into the key's filter, creating it on
    /// first contact.
    pub fn observe(&self, key: &KeyRef, msg: &NormMsg) {
        let mut shard = self.shard(key).lock();
        match shard.get_mut(key) {
            Some(state) => state.update(msg, self.cfg.alpha, self.cfg.beta),
            None => {
                shard.insert(key.clone(), FilterState::initialize(msg));
            }
        }
    }

    pub fn predict(&self, key: &KeyRef, target_ms: i64) -> Option<Prediction> {
        self.shard(key)
            .lock()
            .get(key)
            .and_then(|s| s.predict(target_ms, self.cfg.max_prediction_s))
    }

    /// Record that a dead-reckoned position was published for this key.
    pub fn mark_predicted(&self, key: &KeyRef, now_ms: i64) {
        if let Some(state) = self.shard(key).lock().get_mut(key) {
            state.last_predict_ms = now_ms;
        }
    }

    /// Keys eligible for a dead-reckoned publish: no measurement since
    /// `idle_after_ms` ago and no prediction published within the interval.
    pub fn predictable_keys(&self, now_ms: i64, idle_after_ms: i64, interval_ms: i64) -> Vec<KeyRef> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for (key, state) in shard.iter() {
                if now_ms - state.last_update_ms >= idle_after_ms
                    && now_ms - state.last_predict_ms >= interval_ms
                {
                    out.push(key.clone());
                }
            }
        }
        out
    }

    /// Drop filters idle beyond the configured TTL. Returns how many.
    pub fn cleanup(&self, now_ms: i64) -> usize {
        let mut dropped = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, s| now_ms - s.last_update_ms <= self.cfg.max_filter_age_ms);
            dropped += before - shard.len();
        }
        dropped
    }

    /// (total, active) filter counts; active means updated within the
    /// prediction horizon.
    pub fn counts(&self, now_ms: i64) -> (usize, usize) {
        let horizon_ms = (self.cfg.max_prediction_s * 1000.0) as i64;
        let mut total = 0;
        let mut active = 0;
        for shard in &self.shards {
            let shard = shard.lock();
            total += shard.len();
            active += shard
                .values()
                .filter(|s| now_ms - s.last_update_ms <= horizon_ms)
                .count();
        }
        (total, active)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
