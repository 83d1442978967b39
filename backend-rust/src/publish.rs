//! # publish
//!
//! Fan-out of fusion decisions to the realtime cache and the historical
//! store, and the only writer of the durable last-published map.
//!
//! Ordering contract per key: publish realtime → mark_published (durable +
//! mirror, only after a successful publish) → persist history. A failed
//! publish is retried with backoff and never advances last-published; a
//! failed persist is logged and counted while other keys continue.

use std::sync::Arc;
use std::time::Duration;

use telemetry_types::FusedRecord;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::RealtimeCache;
use crate::decider::Decision;
use crate::history::HistoryStore;
use crate::metrics::Metrics;
use crate::smoother::Prediction;
use crate::window::{KeyRef, WindowStore};

/// Publish retry delays; after the last one the event is dropped from the
/// realtime stream (history still gets it).
const PUBLISH_RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(200), Duration::from_secs(1)];

pub struct Publisher {
    cache: Arc<dyn RealtimeCache>,
    history: Arc<dyn HistoryStore>,
    window: Arc<WindowStore>,
    metrics: Arc<Metrics>,
    allowed_lateness_ms: i64,
}

impl Publisher {
    pub fn new(
        cache: Arc<dyn RealtimeCache>,
        history: Arc<dyn HistoryStore>,
        window: Arc<WindowStore>,
        metrics: Arc<Metrics>,
        allowed_lateness_ms: i64,
    ) -> Self {
        Self {
            cache,
            history,
            window,
            metrics,
            allowed_lateness_ms,
        }
    }

    /// Execute one decision for a key. Returns the event timestamp that was
    /// published realtime, if any.
    pub async fn handle(&self, key: &KeyRef, decision: Decision, now_ms: i64) -> Option<i64> {
        let best = decision.best?;
        let rec = FusedRecord::from_msg(&best, decision.score, false);
        let payload = match serde_json::to_string(&rec) {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %key.1, "record serialization failed: {e}");
                return None;
            }
        };

        // The decider's lateness gate used its own wall clock; re-check here
        // so a slow worker never publishes a stale event.
        let within_lateness = (now_ms - rec.event_ts) <= self.allowed_lateness_ms;
        let mut published = None;

        if decision.publish && within_lateness {
            if self.publish_with_retry(&rec, &payload).await {
                Metrics::inc(&self.metrics.publish_ok);
                self.mark_published(key, rec.event_ts).await;
                published = Some(rec.event_ts);
            } else {
                Metrics::inc(&self.metrics.publish_fail);
                warn!(key = %key.1, event_ts = rec.event_ts, "publish dropped after retries");
            }
        } else if decision.backfill_only || !within_lateness {
            Metrics::inc(&self.metrics.backfill);
            debug!(key = %key.1, event_ts = rec.event_ts, "backfill only");
        }

        self.persist(&rec).await;
        published
    }

    /// Dead-reckoned records go to the realtime side only: no history row,
    /// no last-published advance — a late real measurement must still win.
    pub async fn publish_predicted(&self, key: &KeyRef, rec: &FusedRecord) {
        let payload = match serde_json::to_string(rec) {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %key.1, "predicted record serialization failed: {e}");
                return;
            }
        };
        if let Err(e) = self.cache.publish(rec.kind.update_channel(), &payload).await {
            debug!(key = %key.1, "predicted publish failed: {e}");
            return;
        }
        if let Err(e) = self.cache.cache_record(rec, &payload).await {
            debug!(key = %key.1, "predicted cache write failed: {e}");
        }
        Metrics::inc(&self.metrics.predicted_publish);
    }

    async fn publish_with_retry(&self, rec: &FusedRecord, payload: &str) -> bool {
        let channel = rec.kind.update_channel();
        let mut attempt = 0;
        loop {
            match self.cache.publish(channel, payload).await {
                Ok(()) => {
                    // Latest-state cache is best-effort alongside the stream.
                    if let Err(e) = self.cache.cache_record(rec, payload).await {
                        warn!(key = %rec.key, "latest-state cache write failed: {e}");
                    }
                    return true;
                }
                Err(e) => {
                    if attempt >= PUBLISH_RETRY_DELAYS.len() {
                        warn!(key = %rec.key, "publish failed: {e}");
                        return false;
                    }
                    debug!(key = %rec.key, attempt, "publish retry: {e}");
                    sleep(PUBLISH_RETRY_DELAYS[attempt]).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Advance the durable store first, then the mirror; a durable failure
    /// leaves the mirror untouched so the next decide can retry the publish.
    async fn mark_published(&self, key: &KeyRef, event_ts: i64) {
        match self.history.mark_published(key.0, &key.1, event_ts).await {
            Ok(()) => self.window.set_last_published(key, event_ts),
            Err(e) => {
                Metrics::inc(&self.metrics.mark_published_fail);
                warn!(key = %key.1, "mark_published failed: {e}");
            }
        }
    }

    async fn persist(&self, rec: &FusedRecord) {
        if let Err(e) = self.history.upsert_object(rec).await {
            Metrics::inc(&self.metrics.persist_fail);
            warn!(key = %rec.key, "object upsert failed: {e}");
            return;
        }
        match self.history.upsert_position(rec).await {
            Ok(()) => Metrics::inc(&self.metrics.persist_ok),
            Err(e) => {
                Metrics::inc(&self.metrics.persist_fail);
                warn!(key = %rec.key, "position upsert failed: {e}");
            }
        }
    }
}

/// Build the published shape for a dead-reckoned position.
pub fn predicted_record(template: &FusedRecord, p: &Prediction, target_ms: i64) -> FusedRecord {
    let mut rec = template.clone();
    rec.lat = p.lat;
    rec.lon = p.lon;
    rec.speed = p.speed_kn;
    rec.course = p.course;
    rec.score = template.score.min(p.confidence);
    rec.predicted = true;
    rec.event_ts = target_ms;
    rec
}

// ── Tests ─────────────────────────────────────────────────────────────────────
