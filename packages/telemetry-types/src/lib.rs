//! # telemetry-types
//!
//! Shared telemetry structures for the Pelorus tracking suite.
//!
//! These types are used by:
//! - `backend-rust`: normalizing upstream feed records, fusing them per entity,
//!   and publishing the canonical position stream
//! - `feed-simulator`: shaping synthetic upstream traffic for end-to-end runs
//!
//! ## Conventions
//!
//! - **Timestamps**: event time, UTC milliseconds since epoch (`i64`)
//! - **Coordinates**: WGS-84 degrees, `-90 ≤ lat ≤ 90`, `-180 ≤ lon ≤ 180`
//! - **Speed**: knots, always post unit reconciliation
//! - **Course / heading**: degrees `[0, 360)`, 0 = North, 90 = East
//!
//! ## Entity keys
//!
//! An entity key is the canonical identifier string for one moving object
//! across all sources. Two messages may only fuse when they resolve to the
//! same key — there is no fuzzy identity matching anywhere in the pipeline.

use serde::{Deserialize, Serialize};

// ── Object kind ───────────────────────────────────────────────────────────────

/// What kind of moving object a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Vessel,
    Aircraft,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Vessel => "vessel",
            ObjectKind::Aircraft => "aircraft",
        }
    }

    /// Realtime pub/sub channel for this kind.
    pub fn update_channel(&self) -> &'static str {
        match self {
            ObjectKind::Vessel => "vessel:position:update",
            ObjectKind::Aircraft => "aircraft:position:update",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Normalized message ────────────────────────────────────────────────────────

/// One normalized telemetry report, the common shape every source adapter
/// produces. Position and event time are mandatory; kinematics and identity
/// fields are carried when the source provided them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormMsg {
    pub kind: ObjectKind,
    /// Non-empty source tag, e.g. `"aisstream"`, `"adsb_exchange"`.
    pub source: String,
    /// Canonical entity key, see [`resolve_entity_key`].
    pub key: String,
    /// Event time (inside the record), UTC ms.
    pub event_ts: i64,
    pub lat: f64,
    pub lon: f64,
    /// Knots, post unit reconciliation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Course over ground, degrees `[0, 360)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Feet for aircraft; vessels never carry it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmsi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icao24: Option<String>,
    /// Set by the validator when the report tripped an anomaly pattern.
    /// Advisory only — flagged reports still flow through the pipeline.
    #[serde(default)]
    pub flagged: bool,
}

impl NormMsg {
    /// Primary identifier used as the historical-store object id.
    pub fn object_id(&self) -> &str {
        &self.key
    }
}

// ── Entity key resolution ─────────────────────────────────────────────────────

/// Identifier fields a normalizer extracted before key resolution.
#[derive(Debug, Clone, Default)]
pub struct IdentityFields {
    pub mmsi: Option<String>,
    pub imo: Option<String>,
    pub callsign: Option<String>,
    pub name: Option<String>,
    pub icao24: Option<String>,
    pub registration: Option<String>,
}

/// Derive the canonical entity key from identifiers in priority order.
///
/// Vessels: mmsi → imo → callsign → `name:<v>`.
/// Aircraft: icao24 → registration → callsign.
///
/// Returns `None` when the record carries no usable identifier; such records
/// are rejected upstream.
pub fn resolve_entity_key(kind: ObjectKind, ids: &IdentityFields) -> Option<String> {
    fn usable(v: &Option<String>) -> Option<&str> {
        v.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    match kind {
        ObjectKind::Vessel => usable(&ids.mmsi)
            .or_else(|| usable(&ids.imo))
            .or_else(|| usable(&ids.callsign))
            .map(str::to_string)
            .or_else(|| usable(&ids.name).map(|n| format!("name:{n}"))),
        ObjectKind::Aircraft => usable(&ids.icao24)
            .map(str::to_lowercase)
            .or_else(|| usable(&ids.registration).map(str::to_string))
            .or_else(|| usable(&ids.callsign).map(str::to_string)),
    }
}

// ── Fused record (published shape) ────────────────────────────────────────────

/// The canonical published position event: one entity, one moment, fused
/// across whatever sources contributed. This is both the pub/sub payload and
/// the cached latest state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedRecord {
    pub kind: ObjectKind,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmsi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icao24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// `"fused"` when two or more distinct sources contributed, else the sole
    /// contributing source tag.
    pub source: String,
    /// Composite quality score in `[0, 1]`.
    pub score: f64,
    /// True for dead-reckoned records produced by the predictor between
    /// measurements; predicted records are realtime-only.
    pub predicted: bool,
    pub event_ts: i64,
}

impl FusedRecord {
    /// Build the published shape from a merged message.
    pub fn from_msg(msg: &NormMsg, score: f64, predicted: bool) -> Self {
        Self {
            kind: msg.kind,
            key: msg.key.clone(),
            mmsi: msg.mmsi.clone(),
            imo: msg.imo.clone(),
            icao24: msg.icao24.clone(),
            registration: msg.registration.clone(),
            callsign: msg.callsign.clone(),
            name: msg.name.clone(),
            lat: msg.lat,
            lon: msg.lon,
            speed: msg.speed,
            course: msg.course,
            heading: msg.heading,
            altitude: msg.altitude,
            vertical_rate: msg.vertical_rate,
            status: msg.status.clone(),
            source: msg.source.clone(),
            score,
            predicted,
            event_ts: msg.event_ts,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> IdentityFields {
        IdentityFields::default()
    }

    #[test]
    fn vessel_key_prefers_mmsi() {
        let mut f = ids();
        f.mmsi = Some("123456789".into());
        f.imo = Some("9999999".into());
        f.callsign = Some("ABCD".into());
        assert_eq!(
            resolve_entity_key(ObjectKind::Vessel, &f).as_deref(),
            Some("123456789")
        );
    }

    #[test]
    fn vessel_key_falls_through_to_name() {
        let mut f = ids();
        f.name = Some("Ever Given".into());
        assert_eq!(
            resolve_entity_key(ObjectKind::Vessel, &f).as_deref(),
            Some("name:Ever Given")
        );
    }

    #[test]
    fn vessel_key_skips_blank_identifiers() {
        let mut f = ids();
        f.mmsi = Some("   ".into());
        f.callsign = Some("WDL4".into());
        assert_eq!(
            resolve_entity_key(ObjectKind::Vessel, &f).as_deref(),
            Some("WDL4")
        );
    }

    #[test]
    fn aircraft_key_lowercases_icao24() {
        let mut f = ids();
        f.icao24 = Some("ABCD12".into());
        assert_eq!(
            resolve_entity_key(ObjectKind::Aircraft, &f).as_deref(),
            Some("abcd12")
        );
    }

    #[test]
    fn no_identifier_means_no_key() {
        assert!(resolve_entity_key(ObjectKind::Vessel, &ids()).is_none());
        assert!(resolve_entity_key(ObjectKind::Aircraft, &ids()).is_none());
    }

    #[test]
    fn fused_record_round_trips_camel_case() {
        let msg = NormMsg {
            kind: ObjectKind::Aircraft,
            source: "adsb_exchange".into(),
            key: "abcd12".into(),
            event_ts: 1_755_000_000_000,
            lat: 51.5,
            lon: -0.1,
            speed: Some(430.0),
            course: None,
            heading: Some(270.0),
            altitude: Some(36000.0),
            vertical_rate: Some(-640.0),
            status: None,
            callsign: Some("BAW123".into()),
            name: None,
            mmsi: None,
            imo: None,
            registration: None,
            icao24: Some("abcd12".into()),
            flagged: false,
        };
        let rec = FusedRecord::from_msg(&msg, 0.87, false);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["eventTs"], 1_755_000_000_000_i64);
        assert_eq!(json["verticalRate"], -640.0);
        assert_eq!(json["kind"], "aircraft");
        let back: FusedRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.key, "abcd12");
        assert!(!back.predicted);
    }
}
