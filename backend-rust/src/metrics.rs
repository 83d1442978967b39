//! # metrics
//!
//! Atomic counters for every accept/reject/drop path in the pipeline.
//! Surfaced only through `/status` and the structured log stream — failures
//! recover locally, counters are how operators see them.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::{json, Value};

#[derive(Default)]
pub struct Metrics {
    // Ingest paths
    pub parse_reject: DashMap<String, u64>,
    pub validation_reject: DashMap<String, u64>,
    pub anomaly: DashMap<String, u64>,
    pub ingested: AtomicU64,

    // Capacity pressure
    pub ingest_drop: AtomicU64,
    pub window_trim: AtomicU64,
    pub key_evict: AtomicU64,

    // Decide / publish
    pub publish_ok: AtomicU64,
    pub publish_fail: AtomicU64,
    pub persist_ok: AtomicU64,
    pub persist_fail: AtomicU64,
    pub backfill: AtomicU64,
    pub conflict: AtomicU64,
    pub predicted_publish: AtomicU64,
    pub mark_published_fail: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_labeled(map: &DashMap<String, u64>, label: &str) {
        *map.entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn parse_reject(&self, source: &str) {
        Self::inc_labeled(&self.parse_reject, source);
    }

    pub fn validation_reject(&self, reason: &str) {
        Self::inc_labeled(&self.validation_reject, reason);
    }

    pub fn anomaly(&self, kind: &str) {
        Self::inc_labeled(&self.anomaly, kind);
    }

    fn labeled_json(map: &DashMap<String, u64>) -> Value {
        let mut obj = serde_json::Map::new();
        for entry in map.iter() {
            obj.insert(entry.key().clone(), json!(*entry.value()));
        }
        Value::Object(obj)
    }

    /// Snapshot for the status surface.
    pub fn snapshot(&self) -> Value {
        json!({
            "ingested": self.ingested.load(Ordering::Relaxed),
            "parseReject": Self::labeled_json(&self.parse_reject),
            "validationReject": Self::labeled_json(&self.validation_reject),
            "anomaly": Self::labeled_json(&self.anomaly),
            "ingestDrop": self.ingest_drop.load(Ordering::Relaxed),
            "windowTrim": self.window_trim.load(Ordering::Relaxed),
            "keyEvict": self.key_evict.load(Ordering::Relaxed),
            "publishOk": self.publish_ok.load(Ordering::Relaxed),
            "publishFail": self.publish_fail.load(Ordering::Relaxed),
            "persistOk": self.persist_ok.load(Ordering::Relaxed),
            "persistFail": self.persist_fail.load(Ordering::Relaxed),
            "backfill": self.backfill.load(Ordering::Relaxed),
            "conflict": self.conflict.load(Ordering::Relaxed),
            "predictedPublish": self.predicted_publish.load(Ordering::Relaxed),
            "markPublishedFail": self.mark_published_fail.load(Ordering::Relaxed),
        })
    }
}
