//! tracks.rs — Synthetic moving-object kinematics
//!
//! Generates plausible vessel and aircraft tracks: constant-ish speed and
//! course with Gaussian wander, so downstream smoothing and fusion see
//! realistic (not perfectly smooth) motion. Emits raw upstream-shaped
//! records with the real feeds' field names and casings.

use chrono::{TimeZone, Utc};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde_json::{json, Value};

const KNOT_TO_MPS: f64 = 0.514444;
const DEG_LAT_M: f64 = 111_320.0;

/// Shared kinematic state in degrees / knots / true bearing.
#[derive(Debug, Clone)]
pub struct Kinematics {
    pub lat: f64,
    pub lon: f64,
    pub speed_kn: f64,
    pub course_deg: f64,
}

impl Kinematics {
    /// Advance by `dt_s` seconds with small course/speed wander.
    pub fn step(&mut self, dt_s: f64, course_sigma: f64, speed_sigma: f64) {
        let mut rng = rand::thread_rng();
        if let Ok(wander) = Normal::new(0.0, course_sigma) {
            self.course_deg = (self.course_deg + wander.sample(&mut rng)).rem_euclid(360.0);
        }
        if let Ok(surge) = Normal::new(0.0, speed_sigma) {
            self.speed_kn = (self.speed_kn + surge.sample(&mut rng)).max(0.0);
        }

        let mps = self.speed_kn * KNOT_TO_MPS;
        let rad = self.course_deg.to_radians();
        let dn = mps * rad.cos() * dt_s;
        let de = mps * rad.sin() * dt_s;
        self.lat += dn / DEG_LAT_M;
        self.lon += de / (DEG_LAT_M * self.lat.to_radians().cos().max(1e-6));
        self.lat = self.lat.clamp(-89.9, 89.9);
        if self.lon > 180.0 {
            self.lon -= 360.0;
        } else if self.lon < -180.0 {
            self.lon += 360.0;
        }
    }
}

// ── Vessels ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VesselTrack {
    pub mmsi: String,
    pub name: String,
    pub callsign: String,
    pub kin: Kinematics,
}

impl VesselTrack {
    pub fn spawn(idx: usize, lat0: f64, lon0: f64) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            mmsi: format!("3660{:05}", 10_000 + idx),
            name: format!("PELORUS TEST {idx:02}"),
            callsign: format!("PT{idx:04}"),
            kin: Kinematics {
                lat: lat0 + rng.gen_range(-0.5..0.5),
                lon: lon0 + rng.gen_range(-0.5..0.5),
                speed_kn: rng.gen_range(4.0..18.0),
                course_deg: rng.gen_range(0.0..360.0),
            },
        }
    }

    pub fn step(&mut self, dt_s: f64) {
        self.kin.step(dt_s, 2.0, 0.2);
    }

    /// Raw AIS-push-shaped record (mixed legacy casing on purpose).
    pub fn to_record(&self, now_ms: i64) -> Value {
        let updatetime = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        json!({
            "MMSI": self.mmsi,
            "ShipName": self.name,
            "CallSign": self.callsign,
            "Latitude": round6(self.kin.lat),
            "Longitude": round6(self.kin.lon),
            "Speed": round1(self.kin.speed_kn),
            "Course": round1(self.kin.course_deg),
            "updatetime": updatetime,
        })
    }
}

// ── Aircraft ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AircraftTrack {
    pub hexident: String,
    pub callsign: String,
    pub altitude_ft: f64,
    pub vertical_rate: f64,
    pub kin: Kinematics,
}

impl AircraftTrack {
    pub fn spawn(idx: usize, lat0: f64, lon0: f64) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            hexident: format!("a{idx:05x}"),
            callsign: format!("PLS{:03}", 100 + idx),
            altitude_ft: rng.gen_range(28_000.0..40_000.0),
            vertical_rate: 0.0,
            kin: Kinematics {
                lat: lat0 + rng.gen_range(-2.0..2.0),
                lon: lon0 + rng.gen_range(-2.0..2.0),
                speed_kn: rng.gen_range(380.0..520.0),
                course_deg: rng.gen_range(0.0..360.0),
            },
        }
    }

    pub fn step(&mut self, dt_s: f64) {
        self.kin.step(dt_s, 0.5, 1.0);
        let mut rng = rand::thread_rng();
        self.vertical_rate = (self.vertical_rate + rng.gen_range(-50.0..50.0)).clamp(-2000.0, 2000.0);
        self.altitude_ft = (self.altitude_ft + self.vertical_rate * dt_s / 60.0)
            .clamp(1_000.0, 45_000.0);
    }

    /// Raw ADSB-shaped record (capitalized keys like the real upstream).
    pub fn to_record(&self, now_ms: i64) -> Value {
        json!({
            "Hexident": self.hexident,
            "Callsign": self.callsign,
            "Latitude": round6(self.kin.lat),
            "Longitude": round6(self.kin.lon),
            "Altitude": self.altitude_ft.round(),
            "GroundSpeed": round1(self.kin.speed_kn),
            "Track": round1(self.kin.course_deg),
            "VerticalRate": self.vertical_rate.round(),
            "Unixtime": now_ms / 1000,
        })
    }
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vessel_motion_stays_in_domain() {
        let mut v = VesselTrack::spawn(1, 37.8, -122.4);
        for _ in 0..1000 {
            v.step(1.0);
        }
        assert!((-90.0..=90.0).contains(&v.kin.lat));
        assert!((-180.0..=180.0).contains(&v.kin.lon));
        assert!(v.kin.speed_kn >= 0.0);
    }

    #[test]
    fn vessel_record_has_upstream_field_names() {
        let v = VesselTrack::spawn(2, 37.8, -122.4);
        let rec = v.to_record(1_755_000_000_000);
        assert!(rec.get("MMSI").is_some());
        assert!(rec.get("updatetime").is_some());
        assert!(rec["updatetime"].as_str().unwrap().contains("2025-08-12"));
    }

    #[test]
    fn aircraft_record_has_upstream_field_names() {
        let a = AircraftTrack::spawn(3, 51.5, -0.1);
        let rec = a.to_record(1_755_000_000_000);
        assert!(rec.get("Hexident").is_some());
        assert_eq!(rec["Unixtime"], 1_755_000_000_i64);
    }

    #[test]
    fn eastbound_track_moves_east() {
        let mut k = Kinematics {
            lat: 0.0,
            lon: 0.0,
            speed_kn: 600.0,
            course_deg: 90.0,
        };
        // zero noise: pure dead reckoning
        k.step(60.0, 0.0, 0.0);
        assert!(k.lon > 0.16 && k.lon < 0.17, "lon {}", k.lon);
        assert!(k.lat.abs() < 1e-9);
    }
}
