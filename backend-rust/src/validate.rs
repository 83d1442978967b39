//! # validate
//!
//! Unit reconciliation, range checks, and advisory anomaly detection.
//!
//! Speed units are declared per source; the table below is the source of
//! truth. Sources not listed are assumed to already report knots — that is a
//! documented default, not a guess about payloads.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use telemetry_types::{NormMsg, ObjectKind};
use tracing::debug;

use crate::config::{WindowConfig, AIRCRAFT_SPEED_LIMIT_KN};
use crate::metrics::Metrics;

pub const MPS_TO_KN: f64 = 1.94384;
pub const KMH_TO_KN: f64 = 0.539957;

/// Anomaly buffer: last 10 readings within 5 minutes.
const ANOMALY_BUFFER_LEN: usize = 10;
const ANOMALY_BUFFER_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedUnit {
    Knots,
    MetersPerSecond,
    KilometersPerHour,
}

/// Declared speed unit per source. Unlisted sources report knots.
pub fn speed_unit_for(source: &str) -> SpeedUnit {
    match source.to_ascii_lowercase().as_str() {
        "signalr" | "opensky" => SpeedUnit::MetersPerSecond,
        "china_port" => SpeedUnit::KilometersPerHour,
        _ => SpeedUnit::Knots,
    }
}

pub fn to_knots(value: f64, unit: SpeedUnit) -> f64 {
    match unit {
        SpeedUnit::Knots => value,
        SpeedUnit::MetersPerSecond => value * MPS_TO_KN,
        SpeedUnit::KilometersPerHour => value * KMH_TO_KN,
    }
}

/// Fold any angle into `[0, 360)`, including negatives.
pub fn fold_degrees(x: f64) -> f64 {
    let folded = x % 360.0;
    if folded < 0.0 {
        folded + 360.0
    } else {
        folded
    }
}

// ── Validator ─────────────────────────────────────────────────────────────────

struct SpeedReading {
    wall_ms: i64,
    speed: f64,
    source: String,
}

pub struct Validator {
    cfg: WindowConfig,
    metrics: Arc<Metrics>,
    anomaly: Mutex<HashMap<(ObjectKind, String), VecDeque<SpeedReading>>>,
}

impl Validator {
    pub fn new(cfg: WindowConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            anomaly: Mutex::new(HashMap::new()),
        }
    }

    fn speed_cap(&self, kind: ObjectKind) -> f64 {
        match kind {
            ObjectKind::Vessel => self.cfg.vessel_speed_limit_kn,
            ObjectKind::Aircraft => AIRCRAFT_SPEED_LIMIT_KN,
        }
    }

    /// Validate one normalized message in place: reconcile units, check
    /// domains, fold angles, gate on event age, and run anomaly detection.
    ///
    /// Returns the reject reason on failure; the caller counts it via
    /// `validation_reject{reason}` and drops the message.
    pub fn validate(&self, msg: &mut NormMsg, now_wall_ms: i64) -> Result<(), &'static str> {
        if !(-90.0..=90.0).contains(&msg.lat) {
            self.metrics.validation_reject("lat_out_of_range");
            return Err("lat_out_of_range");
        }
        if !(-180.0..=180.0).contains(&msg.lon) {
            self.metrics.validation_reject("lon_out_of_range");
            return Err("lon_out_of_range");
        }

        if (now_wall_ms - msg.event_ts).abs() > self.cfg.max_event_age_ms {
            self.metrics.validation_reject("event_age");
            return Err("event_age");
        }

        if let Some(raw_speed) = msg.speed {
            let kn = to_knots(raw_speed, speed_unit_for(&msg.source));
            if kn < 0.0 {
                self.metrics.validation_reject("speed_negative");
                return Err("speed_negative");
            }
            if kn > self.speed_cap(msg.kind) {
                self.metrics.validation_reject("speed_over_cap");
                return Err("speed_over_cap");
            }
            msg.speed = Some(kn);
        }

        msg.course = msg.course.map(fold_degrees);
        msg.heading = msg.heading.map(fold_degrees);

        if let Some(speed) = msg.speed {
            self.observe_speed(msg, speed, now_wall_ms);
        }

        Ok(())
    }

    /// Rolling per-key speed buffer. Flags are advisory: they are logged and
    /// counted, and mark the message, but never suppress ingest.
    fn observe_speed(&self, msg: &mut NormMsg, speed: f64, now_wall_ms: i64) {
        let mut map = self.anomaly.lock();
        let buf = map
            .entry((msg.kind, msg.key.clone()))
            .or_insert_with(VecDeque::new);

        buf.push_back(SpeedReading {
            wall_ms: now_wall_ms,
            speed,
            source: msg.source.clone(),
        });
        while buf.len() > ANOMALY_BUFFER_LEN
            || buf
                .front()
                .is_some_and(|r| now_wall_ms - r.wall_ms > ANOMALY_BUFFER_MS)
        {
            buf.pop_front();
        }

        let identical = buf.iter().filter(|r| r.speed == speed).count();
        if identical >= 3 {
            self.metrics.anomaly("repeated_exact_value");
            msg.flagged = true;
            debug!(key = %msg.key, speed, "anomaly: repeated exact speed value");
        }

        if buf.len() >= 5
            && buf.iter().all(|r| r.source == msg.source)
            && buf.iter().all(|r| r.speed == buf[0].speed)
        {
            self.metrics.anomaly("single_source_consistency");
            msg.flagged = true;
            debug!(key = %msg.key, source = %msg.source, "anomaly: single-source constant readings");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;

    fn cfg() -> WindowConfig {
        WindowConfig {
            window_ms: 300_000,
            allowed_lateness_ms: 600_000,
            max_event_age_ms: 86_400_000,
            vessel_speed_limit_kn: 90.0,
            max_events_per_key: 256,
            max_tracked_keys: 200_000,
        }
    }

    fn validator() -> Validator {
        Validator::new(cfg(), Arc::new(Metrics::new()))
    }

    fn vessel(speed: Option<f64>, source: &str, event_ts: i64) -> NormMsg {
        NormMsg {
            kind: ObjectKind::Vessel,
            source: source.into(),
            key: "123456789".into(),
            event_ts,
            lat: 10.0,
            lon: 20.0,
            speed,
            course: None,
            heading: None,
            altitude: None,
            vertical_rate: None,
            status: None,
            callsign: None,
            name: None,
            mmsi: Some("123456789".into()),
            imo: None,
            registration: None,
            icao24: None,
            flagged: false,
        }
    }

    const NOW: i64 = 1_755_000_000_000;

    #[test]
    fn mps_source_converted_to_knots() {
        let v = validator();
        let mut m = vessel(Some(6.17), "signalr", NOW);
        v.validate(&mut m, NOW).unwrap();
        let kn = m.speed.unwrap();
        // 6.17 m/s * 1.94384 ≈ 11.994, within 1e-6 relative error
        assert!((kn - 6.17 * 1.94384).abs() / kn < 1e-6);
    }

    #[test]
    fn kmh_source_converted_to_knots() {
        let v = validator();
        let mut m = vessel(Some(20.0), "china_port", NOW);
        v.validate(&mut m, NOW).unwrap();
        assert!((m.speed.unwrap() - 20.0 * 0.539957).abs() < 1e-9);
    }

    #[test]
    fn unknown_source_assumed_knots() {
        let v = validator();
        let mut m = vessel(Some(12.0), "some_new_feed", NOW);
        v.validate(&mut m, NOW).unwrap();
        assert_eq!(m.speed, Some(12.0));
    }

    #[test]
    fn vessel_speed_cap_rejects() {
        let v = validator();
        let mut m = vessel(Some(91.0), "aisstream", NOW);
        assert_eq!(v.validate(&mut m, NOW), Err("speed_over_cap"));
    }

    #[test]
    fn aircraft_cap_is_750() {
        let v = validator();
        let mut m = vessel(Some(700.0), "adsb_exchange", NOW);
        m.kind = ObjectKind::Aircraft;
        v.validate(&mut m, NOW).unwrap();
        m.speed = Some(751.0);
        assert_eq!(v.validate(&mut m, NOW), Err("speed_over_cap"));
    }

    #[test]
    fn coordinates_out_of_domain_reject() {
        let v = validator();
        let mut m = vessel(None, "ais", NOW);
        m.lat = 90.001;
        assert_eq!(v.validate(&mut m, NOW), Err("lat_out_of_range"));
        let mut m = vessel(None, "ais", NOW);
        m.lon = -180.5;
        assert_eq!(v.validate(&mut m, NOW), Err("lon_out_of_range"));
    }

    #[test]
    fn event_age_gate_both_directions() {
        let v = validator();
        let mut stale = vessel(None, "ais", NOW - 86_400_001);
        assert_eq!(v.validate(&mut stale, NOW), Err("event_age"));
        let mut future = vessel(None, "ais", NOW + 86_400_001);
        assert_eq!(v.validate(&mut future, NOW), Err("event_age"));
        let mut edge = vessel(None, "ais", NOW - 86_400_000);
        v.validate(&mut edge, NOW).unwrap();
    }

    #[test]
    fn negative_course_folds_into_domain() {
        let v = validator();
        let mut m = vessel(None, "ais", NOW);
        m.course = Some(-90.0);
        m.heading = Some(450.0);
        v.validate(&mut m, NOW).unwrap();
        assert_eq!(m.course, Some(270.0));
        assert_eq!(m.heading, Some(90.0));
    }

    #[test]
    fn repeated_exact_speed_flags_but_does_not_drop() {
        let v = validator();
        for i in 0..3 {
            let mut m = vessel(Some(10.0), "aisstream", NOW + i);
            v.validate(&mut m, NOW + i).unwrap();
            if i == 2 {
                assert!(m.flagged);
            }
        }
    }

    #[test]
    fn single_source_consistency_flags_at_five() {
        let v = validator();
        let mut flagged = false;
        for i in 0..5 {
            let mut m = vessel(Some(7.5), "vessel_finder", NOW + i);
            v.validate(&mut m, NOW + i).unwrap();
            flagged = m.flagged;
        }
        assert!(flagged);
        let snap = v.metrics.snapshot();
        assert!(snap["anomaly"]["single_source_consistency"].as_u64().unwrap() >= 1);
    }
}
