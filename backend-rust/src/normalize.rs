//! # normalize
//!
//! Maps raw wire records from each upstream source into the common [`NormMsg`]
//! shape. Field-name aliasing is explicit, table-driven configuration — the
//! alias tables below are authoritative, nothing is inferred from payloads.
//! Records missing a primary identifier, position, or event time are rejected
//! with a reason; rejects are counted, never propagated as errors.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use telemetry_types::{resolve_entity_key, IdentityFields, NormMsg, ObjectKind};

// ── Reject reasons ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotAnObject,
    MissingIdentifier,
    MissingLatitude,
    MissingLongitude,
    MissingTimestamp,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotAnObject => "not_an_object",
            RejectReason::MissingIdentifier => "missing_identifier",
            RejectReason::MissingLatitude => "missing_latitude",
            RejectReason::MissingLongitude => "missing_longitude",
            RejectReason::MissingTimestamp => "missing_timestamp",
        }
    }
}

// ── Alias tables (authoritative configuration) ────────────────────────────────

/// Per-source-family field aliases, tried in order. Both historical casings of
/// every field are listed explicitly; do not add inference on top of this.
pub struct AliasTable {
    pub lat: &'static [&'static str],
    pub lon: &'static [&'static str],
    pub event_ts: &'static [&'static str],
    pub speed: &'static [&'static str],
    pub course: &'static [&'static str],
    pub heading: &'static [&'static str],
    pub altitude: &'static [&'static str],
    pub vertical_rate: &'static [&'static str],
    pub status: &'static [&'static str],
    pub callsign: &'static [&'static str],
    pub name: &'static [&'static str],
    pub mmsi: &'static [&'static str],
    pub imo: &'static [&'static str],
    pub registration: &'static [&'static str],
    pub icao24: &'static [&'static str],
    /// Per-record source override, else the adapter's default tag is used.
    pub source: &'static [&'static str],
}

/// AIS feeds (push hub and friends). Mixed casing is real upstream behavior.
pub static AIS_ALIASES: AliasTable = AliasTable {
    lat: &["Latitude", "Lat", "latitude", "lat"],
    lon: &["Longitude", "Lon", "longitude", "lon"],
    event_ts: &["updatetime", "UpdateTime", "updateTime", "timestamp", "time"],
    speed: &["Speed", "SOG", "speed", "sog"],
    course: &["Course", "COG", "course", "cog"],
    heading: &["Heading", "heading", "TrueHeading"],
    altitude: &[],
    vertical_rate: &[],
    status: &["Status", "NavigationalStatus", "status", "navStatus"],
    callsign: &["CallSign", "Callsign", "callSign", "callsign"],
    name: &["ShipName", "Name", "shipName", "name"],
    mmsi: &["MMSI", "Mmsi", "mmsi"],
    imo: &["IMO", "Imo", "imo"],
    registration: &[],
    icao24: &[],
    source: &["Source", "source"],
};

/// ADSB feeds. Adapters lowercase record keys per batch before normalization
/// (`lower_keys`), so this table is all-lowercase.
pub static ADSB_ALIASES: AliasTable = AliasTable {
    lat: &["latitude", "lat"],
    lon: &["longitude", "lon", "lng"],
    event_ts: &["unixtime", "timestamp", "time", "lastseen"],
    speed: &["groundspeed", "ground_speed", "speed", "gs"],
    course: &["track", "course"],
    heading: &["heading", "bearing"],
    altitude: &["altitude", "alt", "baroaltitude"],
    vertical_rate: &["verticalrate", "vertical_rate", "vrate", "vspeed"],
    status: &["status", "onground"],
    callsign: &["callsign", "callsign_icao", "flight"],
    name: &[],
    mmsi: &[],
    imo: &[],
    registration: &["registration", "reg", "tail"],
    icao24: &["hexident", "icao24", "hex", "icao"],
    source: &["source", "datasource"],
};

// ── Field extraction helpers ──────────────────────────────────────────────────

/// Lowercase the top-level keys of a record. ADSB batches arrive with
/// inconsistent casing across upstream deployments; this runs once per batch.
pub fn lower_keys(record: &Value) -> Value {
    match record {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn field<'a>(record: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    let obj = record.as_object()?;
    aliases
        .iter()
        .find_map(|k| obj.get(*k))
        .filter(|v| !v.is_null())
}

/// Numeric fields accept numbers or numeric strings.
fn num(record: &Value, aliases: &[&str]) -> Option<f64> {
    match field(record, aliases)? {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Identifier-ish fields: strings pass through, integral numbers are formatted
/// without a fractional part (MMSI arrives as a bare number from some feeds).
fn text(record: &Value, aliases: &[&str]) -> Option<String> {
    match field(record, aliases)? {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else {
                n.as_f64().map(|f| f.to_string())
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse an event timestamp into UTC milliseconds.
///
/// Numbers (or numeric strings) below 1e11 are seconds since epoch and are
/// multiplied by 1000; larger values are already milliseconds. ISO-8601
/// strings are parsed as UTC, with a naive `YYYY-MM-DD HH:MM:SS` fallback.
fn event_ts(record: &Value, aliases: &[&str]) -> Option<i64> {
    const SECONDS_CUTOFF: f64 = 1e11;

    match field(record, aliases)? {
        Value::Number(n) => n.as_f64().map(scale_epoch(SECONDS_CUTOFF)),
        Value::String(s) => {
            let t = s.trim();
            if let Ok(f) = t.parse::<f64>() {
                return Some(scale_epoch(SECONDS_CUTOFF)(f));
            }
            parse_iso_utc(t)
        }
        _ => None,
    }
}

fn scale_epoch(cutoff: f64) -> impl Fn(f64) -> i64 {
    move |v| {
        if v.abs() < cutoff {
            (v * 1000.0) as i64
        } else {
            v as i64
        }
    }
}

fn parse_iso_utc(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    None
}

// ── Normalization ─────────────────────────────────────────────────────────────

fn normalize(
    kind: ObjectKind,
    table: &AliasTable,
    record: &Value,
    default_source: &str,
) -> Result<NormMsg, RejectReason> {
    if !record.is_object() {
        return Err(RejectReason::NotAnObject);
    }

    let ids = IdentityFields {
        mmsi: text(record, table.mmsi),
        imo: text(record, table.imo),
        callsign: text(record, table.callsign),
        name: text(record, table.name),
        icao24: text(record, table.icao24),
        registration: text(record, table.registration),
    };
    let key = resolve_entity_key(kind, &ids).ok_or(RejectReason::MissingIdentifier)?;

    let lat = num(record, table.lat).ok_or(RejectReason::MissingLatitude)?;
    let lon = num(record, table.lon).ok_or(RejectReason::MissingLongitude)?;
    let event_ts = event_ts(record, table.event_ts).ok_or(RejectReason::MissingTimestamp)?;

    let source = text(record, table.source)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_source.to_string());

    Ok(NormMsg {
        kind,
        source,
        key,
        event_ts,
        lat,
        lon,
        speed: num(record, table.speed),
        course: num(record, table.course),
        heading: num(record, table.heading),
        altitude: num(record, table.altitude),
        vertical_rate: num(record, table.vertical_rate),
        status: text(record, table.status),
        callsign: ids.callsign,
        name: ids.name,
        mmsi: ids.mmsi,
        imo: ids.imo,
        registration: ids.registration,
        icao24: ids.icao24.map(|s| s.to_lowercase()),
        flagged: false,
    })
}

/// Normalize one raw AIS record.
pub fn normalize_vessel(record: &Value, default_source: &str) -> Result<NormMsg, RejectReason> {
    normalize(ObjectKind::Vessel, &AIS_ALIASES, record, default_source)
}

/// Normalize one raw ADSB record. Callers lowercase record keys per batch
/// first (see [`lower_keys`]).
pub fn normalize_aircraft(record: &Value, default_source: &str) -> Result<NormMsg, RejectReason> {
    normalize(ObjectKind::Aircraft, &ADSB_ALIASES, record, default_source)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
