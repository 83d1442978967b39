//! End-to-end pipeline tests against the in-memory cache and history store:
//! raw records flow through normalization, validation, windowing, fusion
//! decisions, and publication exactly as they would in production, minus the
//! network.

use std::sync::Arc;

use pelorus_backend::cache::MemoryCache;
use pelorus_backend::config::{SmootherConfig, SourceWeights, WindowConfig};
use pelorus_backend::history::{HistoryStore, MemoryHistory};
use pelorus_backend::metrics::Metrics;
use pelorus_backend::normalize;
use pelorus_backend::orchestrator::Pipeline;
use pelorus_backend::publish::Publisher;
use pelorus_backend::smoother::Smoother;
use pelorus_backend::validate::Validator;
use pelorus_backend::window::{KeyRef, WindowStore};
use serde_json::json;
use telemetry_types::{FusedRecord, NormMsg, ObjectKind};

// 2025-08-12T02:00:00Z
const NOW: i64 = 1_754_964_000_000;
const MIN: i64 = 60_000;

struct Harness {
    pipeline: Pipeline,
    validator: Validator,
    cache: Arc<MemoryCache>,
    history: Arc<MemoryHistory>,
}

fn window_cfg() -> WindowConfig {
    WindowConfig {
        window_ms: 5 * MIN,
        allowed_lateness_ms: 10 * MIN,
        max_event_age_ms: 24 * 60 * MIN,
        vessel_speed_limit_kn: 90.0,
        max_events_per_key: 256,
        max_tracked_keys: 200_000,
    }
}

fn harness() -> Harness {
    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(MemoryCache::new());
    let history = Arc::new(MemoryHistory::new());
    let window = Arc::new(WindowStore::new(window_cfg(), 8, metrics.clone()));
    let smoother = Arc::new(Smoother::new(
        SmootherConfig {
            alpha: 0.25,
            beta: 0.08,
            max_prediction_s: 600.0,
            max_filter_age_ms: 30 * 60 * 1000,
        },
        8,
    ));
    let publisher = Arc::new(Publisher::new(
        cache.clone(),
        history.clone(),
        window.clone(),
        metrics.clone(),
        10 * MIN,
    ));
    Harness {
        pipeline: Pipeline {
            window,
            smoother,
            publisher,
            history: history.clone(),
            metrics: metrics.clone(),
            weights: SourceWeights::from_env().unwrap(),
            window_cfg: window_cfg(),
        },
        validator: Validator::new(window_cfg(), metrics),
        cache,
        history,
    }
}

impl Harness {
    /// Adapter-shaped entry: raw record → normalize → validate → window.
    fn ingest_raw_vessel(&self, raw: serde_json::Value, source: &str, now: i64) -> Option<KeyRef> {
        let mut msg = normalize::normalize_vessel(&raw, source).ok()?;
        self.validator.validate(&mut msg, now).ok()?;
        let key: KeyRef = (msg.kind, msg.key.clone());
        self.pipeline.window.push(msg, now).then_some(key)
    }

    fn ingest(&self, msg: NormMsg, now: i64) -> KeyRef {
        let key: KeyRef = (msg.kind, msg.key.clone());
        self.pipeline.window.push(msg, now);
        key
    }

    async fn decide(&self, key: &KeyRef, now: i64) {
        self.pipeline.process_key(key, now).await;
    }

    fn published(&self, kind: ObjectKind) -> Vec<FusedRecord> {
        self.cache
            .published_on(kind.update_channel())
            .iter()
            .map(|p| serde_json::from_str(p).expect("published payload parses"))
            .collect()
    }
}

fn vessel(key: &str, source: &str, ts: i64, lat: f64, lon: f64) -> NormMsg {
    NormMsg {
        kind: ObjectKind::Vessel,
        source: source.into(),
        key: key.into(),
        event_ts: ts,
        lat,
        lon,
        speed: None,
        course: None,
        heading: None,
        altitude: None,
        vertical_rate: None,
        status: None,
        callsign: None,
        name: None,
        mmsi: Some(key.into()),
        imo: None,
        registration: None,
        icao24: None,
        flagged: false,
    }
}

// ── S1: newest wins within window ─────────────────────────────────────────────

#[tokio::test]
async fn s1_newest_wins_within_window() {
    let h = harness();
    let a = h
        .ingest_raw_vessel(
            json!({
                "MMSI": "123456789", "Latitude": 10.0, "Longitude": 20.0,
                "updatetime": (NOW - 3 * MIN) / 1000, "source": "vessel_finder"
            }),
            "vessel_finder",
            NOW,
        )
        .unwrap();
    h.ingest_raw_vessel(
        json!({
            "MMSI": "123456789", "Latitude": 10.001, "Longitude": 20.001,
            "updatetime": (NOW - MIN) / 1000, "source": "custom"
        }),
        "custom",
        NOW,
    )
    .unwrap();

    h.decide(&a, NOW).await;
    let published = h.published(ObjectKind::Vessel);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].event_ts, NOW - MIN);
    assert_eq!(published[0].lat, 10.001);
    assert_eq!(published[0].lon, 20.001);
}

// ── S2: backfill only ─────────────────────────────────────────────────────────

#[tokio::test]
async fn s2_backfill_only() {
    let h = harness();
    let key: KeyRef = (ObjectKind::Vessel, "123456789".into());
    h.history
        .mark_published(ObjectKind::Vessel, "123456789", NOW - MIN)
        .await
        .unwrap();

    h.ingest(vessel("123456789", "ais", NOW - 2 * MIN, 1.0, 2.0), NOW);
    h.decide(&key, NOW).await;

    assert!(h.published(ObjectKind::Vessel).is_empty());
    // the event still landed in history
    assert_eq!(h.history.position_count(), 1);
    let rows = h
        .history
        .fetch_positions("123456789", NOW - 3 * MIN, NOW, 10, 0)
        .await
        .unwrap();
    assert_eq!(rows[0].event_ts, NOW - 2 * MIN);
}

// ── S3: lateness cutoff ───────────────────────────────────────────────────────

#[tokio::test]
async fn s3_lateness_cutoff() {
    let h = harness();
    let key: KeyRef = (ObjectKind::Vessel, "123456789".into());
    h.history
        .mark_published(ObjectKind::Vessel, "123456789", NOW - 2 * MIN)
        .await
        .unwrap();

    h.ingest(
        vessel("123456789", "ais", NOW - (10 * MIN + 60_000), 1.0, 2.0),
        NOW,
    );
    h.decide(&key, NOW).await;
    assert!(h.published(ObjectKind::Vessel).is_empty());
}

// ── S4: field fusion across sources ───────────────────────────────────────────

#[tokio::test]
async fn s4_field_fusion() {
    let h = harness();
    let key: KeyRef = (ObjectKind::Aircraft, "abcd12".into());

    let mut a = NormMsg {
        kind: ObjectKind::Aircraft,
        source: "opensky".into(),
        key: "abcd12".into(),
        event_ts: NOW - 30_000,
        lat: 51.0,
        lon: 0.0,
        speed: Some(450.0),
        course: None,
        heading: None,
        altitude: None,
        vertical_rate: None,
        status: None,
        callsign: Some("TEST123".into()),
        name: None,
        mmsi: None,
        imo: None,
        registration: None,
        icao24: Some("abcd12".into()),
        flagged: false,
    };
    let mut b = a.clone();
    b.source = "custom".into();
    b.event_ts = NOW - 10_000;
    b.callsign = None;
    b.speed = None;
    b.altitude = Some(35_000.0);
    a.altitude = None;

    h.ingest(a, NOW);
    h.ingest(b, NOW);
    h.decide(&key, NOW).await;

    let published = h.published(ObjectKind::Aircraft);
    assert_eq!(published.len(), 1);
    let rec = &published[0];
    assert_eq!(rec.callsign.as_deref(), Some("TEST123"));
    assert_eq!(rec.altitude, Some(35_000.0));
    assert_eq!(rec.speed, Some(450.0));
    assert_eq!(rec.source, "fused");
}

// ── S5: unit mismatch and conflict threshold ──────────────────────────────────

#[tokio::test]
async fn s5_unit_reconciliation_avoids_false_conflicts() {
    let h = harness();
    // signalr declares m/s: 6.17 m/s ≈ 12 kn — after normalization the two
    // sources agree and no conflict fires.
    let a = h
        .ingest_raw_vessel(
            json!({
                "MMSI": "123456789", "Latitude": 1.0, "Longitude": 2.0,
                "Speed": 6.17, "updatetime": (NOW - 10_000) / 1000
            }),
            "signalr",
            NOW,
        )
        .unwrap();
    h.ingest_raw_vessel(
        json!({
            "MMSI": "123456789", "Latitude": 1.0, "Longitude": 2.0,
            "Speed": 12.0, "updatetime": (NOW - 5_000) / 1000
        }),
        "aisstream",
        NOW,
    )
    .unwrap();

    h.decide(&a, NOW).await;
    let snap = h.pipeline.metrics.snapshot();
    assert_eq!(snap["conflict"], 0);

    // speed 5.9 vs 12 kn is a ~50.8 % spread: exactly one conflict event
    let h2 = harness();
    let mut slow = vessel("987", "vessel_finder", NOW - 10_000, 1.0, 2.0);
    slow.speed = Some(5.9);
    let mut fast = vessel("987", "aisstream", NOW - 5_000, 1.0, 2.0);
    fast.speed = Some(12.0);
    h2.ingest(slow, NOW);
    let k2 = h2.ingest(fast, NOW);
    h2.decide(&k2, NOW).await;
    assert_eq!(h2.pipeline.metrics.snapshot()["conflict"], 1);
}

// ── S6 is covered in smoother unit tests; here: predicted flow ────────────────

#[tokio::test]
async fn predicted_records_never_advance_last_published() {
    let h = harness();
    let key = h.ingest(vessel("123456789", "aisstream", NOW - 5_000, 10.0, 20.0), NOW);
    h.decide(&key, NOW).await;
    assert_eq!(h.published(ObjectKind::Vessel).len(), 1);
    let last_after_publish = h.pipeline.window.get_last_published(&key);

    // dead-reckon 30 s ahead
    let p = h.pipeline.smoother.predict(&key, NOW + 30_000).unwrap();
    let template = FusedRecord::from_msg(
        &vessel("123456789", "aisstream", NOW - 5_000, 10.0, 20.0),
        0.9,
        false,
    );
    let rec = pelorus_backend::publish::predicted_record(&template, &p, NOW + 30_000);
    h.pipeline.publisher.publish_predicted(&key, &rec).await;

    assert_eq!(h.published(ObjectKind::Vessel).len(), 2);
    assert!(h.published(ObjectKind::Vessel)[1].predicted);
    // monotonicity anchor untouched by the prediction
    assert_eq!(h.pipeline.window.get_last_published(&key), last_after_publish);
    assert_eq!(h.history.position_count(), 1);
}

// ── Universal property 1: published event times strictly increase ────────────

#[tokio::test]
async fn published_event_times_strictly_increase() {
    let h = harness();
    let key: KeyRef = (ObjectKind::Vessel, "123456789".into());

    // Deliberately shuffled arrival order, including duplicates.
    let offsets = [-240, -60, -180, -60, -120, -30, -90, -30];
    for (i, off) in offsets.iter().enumerate() {
        h.ingest(
            vessel("123456789", "aisstream", NOW + *off * 1000, 1.0 + i as f64 * 0.001, 2.0),
            NOW,
        );
        h.decide(&key, NOW).await;
    }

    let published = h.published(ObjectKind::Vessel);
    assert!(!published.is_empty());
    for pair in published.windows(2) {
        assert!(
            pair[1].event_ts > pair[0].event_ts,
            "non-monotone publish: {} then {}",
            pair[0].event_ts,
            pair[1].event_ts
        );
    }
    // idempotency: duplicates never double-published
    let mut seen = std::collections::HashSet::new();
    for rec in &published {
        assert!(seen.insert(rec.event_ts));
    }
}

// ── Universal property 4: duplicate ingest, no duplicate history row ──────────

#[tokio::test]
async fn duplicate_ingest_is_idempotent() {
    let h = harness();
    let key = h.ingest(vessel("123456789", "ais", NOW - MIN, 1.0, 2.0), NOW);
    h.ingest(vessel("123456789", "ais", NOW - MIN, 1.0, 2.0), NOW);

    h.decide(&key, NOW).await;
    h.decide(&key, NOW).await;

    assert_eq!(h.published(ObjectKind::Vessel).len(), 1);
    assert_eq!(h.history.position_count(), 1);
}

// ── Window invariants under load ──────────────────────────────────────────────

#[tokio::test]
async fn window_bounds_hold_under_load() {
    let h = harness();
    let key: KeyRef = (ObjectKind::Vessel, "123456789".into());
    for i in 0..400 {
        h.ingest(
            vessel("123456789", "ais", NOW - 290_000 + i * 500, 1.0, 2.0),
            NOW,
        );
    }
    let win = h.pipeline.window.get(&key);
    assert!(win.len() <= 256);
    assert!(win.iter().all(|m| m.event_ts >= NOW - 5 * MIN));
    assert!(h.pipeline.metrics.snapshot()["windowTrim"].as_u64().unwrap() > 0);
}
