//! # fusion
//!
//! Per-message scoring and field-level fusion across contemporaneous messages
//! for one entity key.
//!
//! Scoring: `0.5·recency + 0.3·source_weight + 0.2·physical_validity`, with
//! recency decaying linearly to zero over 15 minutes of event age.
//!
//! Merging: the newest message anchors position and event time; every other
//! field is selected per-candidate — inside a 60 s timestamp window the
//! heavier source wins (string length breaks ties for text), outside it the
//! most recent value wins. Sources below weight 0.1 never contribute.

use serde::Serialize;
use telemetry_types::NormMsg;

use crate::config::SourceWeights;

const STATIC_WINDOW_MS: i64 = 60_000;
const MIN_CONTRIBUTING_WEIGHT: f64 = 0.1;
const CONFLICT_SPREAD: f64 = 0.5;

// ── Scoring ───────────────────────────────────────────────────────────────────

pub fn recency(event_ts: i64, now_ms: i64) -> f64 {
    let age_minutes = (now_ms - event_ts).max(0) as f64 / 60_000.0;
    (1.0 - age_minutes / 15.0).max(0.0)
}

/// Composite per-message score in `[0, 1]`.
pub fn score(msg: &NormMsg, now_ms: i64, weights: &SourceWeights) -> f64 {
    let validity = if msg.flagged { 0.0 } else { 1.0 };
    0.5 * recency(msg.event_ts, now_ms) + 0.3 * weights.weight(&msg.source) + 0.2 * validity
}

// ── Conflict events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCandidate {
    pub source: String,
    pub value: f64,
    pub event_ts: i64,
}

/// Observational signal: contributing candidates for one numeric field spread
/// more than 50 % apart. Never changes the merge result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEvent {
    pub key: String,
    pub field: &'static str,
    pub candidates: Vec<ConflictCandidate>,
    pub spread: f64,
}

// ── Merge ─────────────────────────────────────────────────────────────────────

pub struct MergeOutcome {
    pub msg: NormMsg,
    pub conflicts: Vec<ConflictEvent>,
    /// Distinct sources that supplied at least one selected field.
    pub sources: Vec<String>,
    pub score: f64,
}

struct Cand<T> {
    value: T,
    source: String,
    weight: f64,
    ts: i64,
    len: usize,
}

fn collect<'a, T, F>(msgs: &'a [NormMsg], weights: &SourceWeights, get: F) -> Vec<Cand<T>>
where
    F: Fn(&'a NormMsg) -> Option<(T, usize)>,
{
    msgs.iter()
        .filter_map(|m| {
            let w = weights.weight(&m.source);
            if w < MIN_CONTRIBUTING_WEIGHT {
                return None;
            }
            get(m).map(|(value, len)| Cand {
                value,
                source: m.source.clone(),
                weight: w,
                ts: m.event_ts,
                len,
            })
        })
        .collect()
}

/// Candidate selection shared by static and dynamic fields.
fn select<T>(mut cands: Vec<Cand<T>>) -> Option<Cand<T>> {
    if cands.is_empty() {
        return None;
    }
    if cands.len() == 1 {
        return cands.pop();
    }
    let newest = cands.iter().map(|c| c.ts).max().unwrap_or(0);
    cands.retain(|c| newest - c.ts <= STATIC_WINDOW_MS);
    cands.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.len.cmp(&a.len))
            .then(b.ts.cmp(&a.ts))
    });
    cands.into_iter().next()
}

fn conflict_for(
    key: &str,
    field: &'static str,
    cands: &[Cand<f64>],
) -> Option<ConflictEvent> {
    if cands.len() < 2 {
        return None;
    }
    let max = cands.iter().map(|c| c.value).fold(f64::MIN, f64::max);
    let min = cands.iter().map(|c| c.value).fold(f64::MAX, f64::min);
    let scale = max.abs().max(min.abs()).max(1e-9);
    let spread = (max - min) / scale;
    if spread <= CONFLICT_SPREAD {
        return None;
    }
    Some(ConflictEvent {
        key: key.to_string(),
        field,
        candidates: cands
            .iter()
            .map(|c| ConflictCandidate {
                source: c.source.clone(),
                value: c.value,
                event_ts: c.ts,
            })
            .collect(),
        spread,
    })
}

/// Fuse a non-empty set of messages for one key into a single message.
///
/// Position fields `(lat, lon, event_ts)` always come from the anchor — the
/// message with the greatest event time. Identity fields fuse by candidate
/// selection; kinematic fields prefer the anchor's own value.
pub fn merge(msgs: &[NormMsg], weights: &SourceWeights, now_ms: i64) -> Option<MergeOutcome> {
    let anchor_idx = msgs
        .iter()
        .enumerate()
        .max_by_key(|(_, m)| m.event_ts)
        .map(|(i, _)| i)?;
    let anchor = &msgs[anchor_idx];

    let mut merged = anchor.clone();
    let mut sources: Vec<String> = vec![anchor.source.clone()];
    let mut conflicts = Vec::new();

    fn contributed(sources: &mut Vec<String>, source: &str) {
        if !sources.iter().any(|s| s == source) {
            sources.push(source.to_string());
        }
    }

    // Static identity fields.
    macro_rules! static_field {
        ($field:ident) => {{
            let cands = collect(msgs, weights, |m| {
                m.$field
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| (s.to_string(), s.len()))
            });
            if let Some(winner) = select(cands) {
                contributed(&mut sources, &winner.source);
                merged.$field = Some(winner.value);
            }
        }};
    }
    static_field!(mmsi);
    static_field!(imo);
    static_field!(callsign);
    static_field!(name);
    static_field!(registration);
    static_field!(icao24);

    // Dynamic kinematic fields: anchor value when present, candidate
    // selection otherwise. Numeric spread is checked either way.
    macro_rules! dynamic_num {
        ($field:ident, $name:literal) => {{
            let cands = collect(msgs, weights, |m| m.$field.map(|v| (v, 0)));
            if let Some(ev) = conflict_for(&anchor.key, $name, &cands) {
                conflicts.push(ev);
            }
            if anchor.$field.is_none() {
                if let Some(winner) = select(cands) {
                    contributed(&mut sources, &winner.source);
                    merged.$field = Some(winner.value);
                }
            }
        }};
    }
    dynamic_num!(speed, "speed");
    dynamic_num!(course, "course");
    dynamic_num!(heading, "heading");
    dynamic_num!(altitude, "altitude");
    dynamic_num!(vertical_rate, "verticalRate");

    if merged.status.is_none() {
        let cands = collect(msgs, weights, |m| {
            m.status
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| (s.to_string(), s.len()))
        });
        if let Some(winner) = select(cands) {
            contributed(&mut sources, &winner.source);
            merged.status = Some(winner.value);
        }
    }

    if sources.len() >= 2 {
        merged.source = "fused".to_string();
    }

    let source_weight = sources
        .iter()
        .map(|s| weights.weight(s))
        .fold(f64::MIN, f64::max);
    let validity = if merged.flagged { 0.0 } else { 1.0 };
    let score = 0.5 * recency(merged.event_ts, now_ms) + 0.3 * source_weight + 0.2 * validity;

    Some(MergeOutcome {
        msg: merged,
        conflicts,
        sources,
        score,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::ObjectKind;

    const NOW: i64 = 1_755_000_000_000;

    fn weights() -> SourceWeights {
        SourceWeights::from_env().unwrap()
    }

    fn aircraft(source: &str, event_ts: i64) -> NormMsg {
        NormMsg {
            kind: ObjectKind::Aircraft,
            source: source.into(),
            key: "abcd12".into(),
            event_ts,
            lat: 51.0,
            lon: 0.0,
            speed: None,
            course: None,
            heading: None,
            altitude: None,
            vertical_rate: None,
            status: None,
            callsign: None,
            name: None,
            mmsi: None,
            imo: None,
            registration: None,
            icao24: Some("abcd12".into()),
            flagged: false,
        }
    }

    #[test]
    fn score_is_recency_weight_validity() {
        let w = weights();
        let mut m = aircraft("adsb_exchange", NOW);
        let s = score(&m, NOW, &w);
        // fresh message: 0.5 + 0.3*0.9 + 0.2
        assert!((s - 0.97).abs() < 1e-9);

        m.event_ts = NOW - 15 * 60_000;
        let s = score(&m, NOW, &w);
        assert!((s - 0.47).abs() < 1e-9);

        m.flagged = true;
        let s = score(&m, NOW, &w);
        assert!((s - 0.27).abs() < 1e-9);
    }

    #[test]
    fn merge_fills_anchor_gaps_from_older_message() {
        // Scenario: two aircraft messages within 60 s; the anchor is missing
        // callsign and speed, the older opensky message has them.
        let mut a = aircraft("opensky", NOW - 30_000);
        a.callsign = Some("TEST123".into());
        a.speed = Some(450.0);
        let mut b = aircraft("custom", NOW);
        b.altitude = Some(35_000.0);

        let out = merge(&[a, b], &weights(), NOW).unwrap();
        assert_eq!(out.msg.event_ts, NOW);
        assert_eq!(out.msg.callsign.as_deref(), Some("TEST123"));
        assert_eq!(out.msg.altitude, Some(35_000.0));
        assert_eq!(out.msg.speed, Some(450.0));
        assert_eq!(out.msg.source, "fused");
        assert!(out.sources.contains(&"opensky".to_string()));
        assert!(out.sources.contains(&"custom".to_string()));
    }

    #[test]
    fn anchor_position_always_wins() {
        let mut a = aircraft("adsb_exchange", NOW - 10_000);
        a.lat = 10.0;
        a.lon = 20.0;
        let mut b = aircraft("custom", NOW);
        b.lat = 10.001;
        b.lon = 20.001;
        let out = merge(&[a, b], &weights(), NOW).unwrap();
        assert_eq!(out.msg.lat, 10.001);
        assert_eq!(out.msg.lon, 20.001);
    }

    #[test]
    fn heavier_source_wins_inside_window() {
        let mut a = aircraft("opensky", NOW - 5_000); // 0.85
        a.callsign = Some("AAA".into());
        let mut b = aircraft("custom", NOW); // 0.70, anchor but no callsign contest
        b.callsign = Some("BBB".into());
        let out = merge(&[a, b], &weights(), NOW).unwrap();
        // both in window; opensky outweighs custom
        assert_eq!(out.msg.callsign.as_deref(), Some("AAA"));
    }

    #[test]
    fn most_recent_wins_outside_window() {
        let mut a = aircraft("opensky", NOW - 120_000); // heavy but stale
        a.callsign = Some("OLD1".into());
        let mut b = aircraft("custom", NOW);
        b.callsign = Some("NEW1".into());
        let out = merge(&[a, b], &weights(), NOW).unwrap();
        assert_eq!(out.msg.callsign.as_deref(), Some("NEW1"));
    }

    #[test]
    fn single_source_is_not_fused() {
        let mut a = aircraft("opensky", NOW - 1000);
        a.speed = Some(400.0);
        let b = aircraft("opensky", NOW);
        let out = merge(&[a, b], &weights(), NOW).unwrap();
        assert_eq!(out.msg.source, "opensky");
        assert_eq!(out.sources.len(), 1);
    }

    #[test]
    fn spread_below_half_is_quiet() {
        // 6.17 vs 12: spread ≈ 48.6 %
        let mut a = aircraft("signalr", NOW - 1000);
        a.speed = Some(6.17);
        let mut b = aircraft("aisstream", NOW);
        b.speed = Some(12.0);
        let out = merge(&[a, b], &weights(), NOW).unwrap();
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn spread_above_half_emits_one_conflict() {
        // 5.9 vs 12: spread ≈ 50.8 %
        let mut a = aircraft("signalr", NOW - 1000);
        a.speed = Some(5.9);
        let mut b = aircraft("aisstream", NOW);
        b.speed = Some(12.0);
        let out = merge(&[a, b], &weights(), NOW).unwrap();
        assert_eq!(out.conflicts.len(), 1);
        let ev = &out.conflicts[0];
        assert_eq!(ev.field, "speed");
        assert_eq!(ev.candidates.len(), 2);
        assert!((ev.spread - (12.0 - 5.9) / 12.0).abs() < 1e-9);
        // conflict is observational: the anchor's own speed still wins
        assert_eq!(out.msg.speed, Some(12.0));
    }

    #[test]
    fn merge_of_empty_slice_is_none() {
        assert!(merge(&[], &weights(), NOW).is_none());
    }
}
