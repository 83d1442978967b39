//! # orchestrator
//!
//! Owns the pipeline: consumes the ingest queue in batches, validates and
//! ingests into the window store, tracks dirty keys, and on each tick routes
//! them to a fixed worker pool. All work for one key hashes to the same
//! worker, which makes ingest → decide → publish → persist → mark_published
//! linearizable per key without a per-key lock.
//!
//! Shutdown is cooperative: adapters stop first, the ingest queue closes, the
//! orchestrator drains what remains, flushes the dirty set once, then the
//! workers' channels close.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use telemetry_types::FusedRecord;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterHealth, IngestQueue};
use crate::config::{ResourceConfig, SourceWeights, WindowConfig};
use crate::decider;
use crate::fusion;
use crate::history::HistoryStore;
use crate::metrics::Metrics;
use crate::publish::{predicted_record, Publisher};
use crate::smoother::Smoother;
use crate::validate::Validator;
use crate::window::{KeyRef, WindowStore};

const INGEST_BATCH: usize = 256;
const FILTER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Keys idle this long past their tick become predictor candidates.
const PREDICT_IDLE_FACTOR: u64 = 2;
/// Minimum filter confidence for a dead-reckoned publish.
const PREDICT_MIN_CONFIDENCE: f64 = 0.2;

/// Everything a worker needs to run one key end to end.
pub struct Pipeline {
    pub window: Arc<WindowStore>,
    pub smoother: Arc<Smoother>,
    pub publisher: Arc<Publisher>,
    pub history: Arc<dyn HistoryStore>,
    pub metrics: Arc<Metrics>,
    pub weights: SourceWeights,
    pub window_cfg: WindowConfig,
}

impl Pipeline {
    /// Decide → publish/persist → smoother update for one key.
    pub async fn process_key(&self, key: &KeyRef, now_ms: i64) {
        if !self.window.last_published_loaded(key) {
            match self.history.load_last_published(key.0, &key.1).await {
                Ok(ts) => self.window.prime_last_published(key, ts),
                Err(e) => {
                    // Without the mirror we cannot guarantee monotonicity;
                    // skip this key until the store answers.
                    warn!(key = %key.1, "last-published hydrate failed: {e}");
                    return;
                }
            }
        }

        let win = self.window.get(key);
        let last = self.window.get_last_published(key);
        let (decision, conflicts) =
            decider::decide(&win, last, now_ms, &self.window_cfg, &self.weights);

        for conflict in &conflicts {
            Metrics::inc(&self.metrics.conflict);
            match serde_json::to_value(conflict) {
                Ok(detail) => info!(target: "pelorus_backend::conflict", %detail, "field conflict"),
                Err(_) => info!(field = conflict.field, "field conflict"),
            }
        }

        let best = decision.best.clone();
        let published = self.publisher.handle(key, decision, now_ms).await;
        if published.is_some() {
            if let Some(best) = best {
                self.smoother.observe(key, &best);
            }
        }
    }

    /// Dead-reckon one idle key and publish the prediction realtime-only.
    async fn predict_key(&self, key: &KeyRef, now_ms: i64) {
        let Some(p) = self.smoother.predict(key, now_ms) else {
            return;
        };
        if p.confidence < PREDICT_MIN_CONFIDENCE {
            return;
        }
        // Rebuild identity from the freshest window entry; without one the
        // filter alone cannot name the object's identifiers.
        let win = self.window.get(key);
        let Some(latest) = win.last() else { return };
        let template = FusedRecord::from_msg(latest, fusion::score(latest, now_ms, &self.weights), false);
        let rec = predicted_record(&template, &p, now_ms);
        self.publisher.publish_predicted(key, &rec).await;
        self.smoother.mark_predicted(key, now_ms);
    }
}

pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    queue: Arc<IngestQueue>,
    validator: Arc<Validator>,
    resources: ResourceConfig,
    dirty: Mutex<HashSet<KeyRef>>,
    healths: Vec<Arc<AdapterHealth>>,
}

impl Orchestrator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        queue: Arc<IngestQueue>,
        validator: Arc<Validator>,
        resources: ResourceConfig,
        healths: Vec<Arc<AdapterHealth>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            queue,
            validator,
            resources,
            dirty: Mutex::new(HashSet::new()),
            healths,
        })
    }

    fn route(&self, key: &KeyRef, pool: usize) -> usize {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        (h.finish() as usize) % pool
    }

    /// Validate and ingest one batch from the ingest queue, marking touched
    /// keys dirty.
    fn ingest(&self, batch: Vec<telemetry_types::NormMsg>, now_ms: i64) {
        let mut dirty = self.dirty.lock();
        for mut msg in batch {
            if self.validator.validate(&mut msg, now_ms).is_err() {
                continue; // reason counted by the validator
            }
            Metrics::inc(&self.pipeline.metrics.ingested);
            let key: KeyRef = (msg.kind, msg.key.clone());
            if self.pipeline.window.push(msg, now_ms) {
                dirty.insert(key);
            }
        }
    }

    fn window(&self) -> &WindowStore {
        &self.pipeline.window
    }

    async fn flush_dirty(&self, workers: &[mpsc::Sender<KeyRef>]) {
        let keys: Vec<KeyRef> = {
            let mut dirty = self.dirty.lock();
            dirty.drain().collect()
        };
        for key in keys {
            let slot = self.route(&key, workers.len());
            if workers[slot].send(key).await.is_err() {
                warn!("decision worker {slot} is gone");
            }
        }
    }

    /// Main loop. Returns once shutdown is signalled and the queue is
    /// drained.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let pool = self.resources.worker_pool_size.max(1);
        let mut workers: Vec<mpsc::Sender<KeyRef>> = Vec::with_capacity(pool);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(pool);
        for id in 0..pool {
            let (tx, mut rx) = mpsc::channel::<KeyRef>(1024);
            let pipeline = self.pipeline.clone();
            workers.push(tx);
            handles.push(tokio::spawn(async move {
                while let Some(key) = rx.recv().await {
                    let now_ms = Utc::now().timestamp_millis();
                    pipeline.process_key(&key, now_ms).await;
                }
                debug!("decision worker {id} stopped");
            }));
        }

        let mut tick = tokio::time::interval(Duration::from_millis(self.resources.tick_ms.max(100)));
        let mut cleanup = tokio::time::interval(FILTER_CLEANUP_INTERVAL);
        let predict_every = self.resources.predict_interval_ms;
        let mut predict = tokio::time::interval(Duration::from_millis(predict_every.max(1000)));

        info!(pool, "orchestrator running");
        loop {
            tokio::select! {
                batch = self.queue.recv_batch(INGEST_BATCH) => {
                    match batch {
                        Some(batch) => self.ingest(batch, Utc::now().timestamp_millis()),
                        None => break, // queue closed and drained
                    }
                }
                _ = tick.tick() => {
                    self.flush_dirty(&workers).await;
                }
                _ = predict.tick(), if predict_every > 0 => {
                    let now_ms = Utc::now().timestamp_millis();
                    let idle_after = (self.resources.tick_ms * PREDICT_IDLE_FACTOR) as i64;
                    for key in self.pipeline.smoother.predictable_keys(now_ms, idle_after, predict_every as i64) {
                        self.pipeline.predict_key(&key, now_ms).await;
                    }
                }
                _ = cleanup.tick() => {
                    let dropped = self.pipeline.smoother.cleanup(Utc::now().timestamp_millis());
                    if dropped > 0 {
                        debug!(dropped, "idle filters cleaned up");
                    }
                }
                _ = shutdown.changed() => {
                    info!("orchestrator draining");
                    self.queue.close();
                    let deadline = tokio::time::Instant::now()
                        + Duration::from_millis(self.resources.shutdown_drain_ms);
                    while let Ok(Some(batch)) = tokio::time::timeout_at(
                        deadline,
                        self.queue.recv_batch(INGEST_BATCH),
                    )
                    .await
                    {
                        self.ingest(batch, Utc::now().timestamp_millis());
                    }
                    break;
                }
            }
        }

        // Final dirty flush so the last ingested events get decided.
        self.flush_dirty(&workers).await;
        drop(workers);
        for handle in handles {
            let _ = handle.await;
        }
        info!("orchestrator stopped");
    }

    /// Status snapshot for the admin surface.
    pub fn status(&self) -> Value {
        let now_ms = Utc::now().timestamp_millis();
        let (filters_total, filters_active) = self.pipeline.smoother.counts(now_ms);
        json!({
            "adapters": self.healths.iter().map(|h| h.snapshot()).collect::<Vec<_>>(),
            "ingestQueue": self.queue.len(),
            "dirtyKeys": self.dirty.lock().len(),
            "windowStore": {
                "keys": self.window().tracked_keys(),
                "messages": self.window().total_messages(),
            },
            "filters": { "total": filters_total, "active": filters_active },
            "counters": self.pipeline.metrics.snapshot(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::SmootherConfig;
    use crate::history::MemoryHistory;
    use telemetry_types::{NormMsg, ObjectKind};

    fn window_cfg() -> WindowConfig {
        WindowConfig {
            window_ms: 300_000,
            allowed_lateness_ms: 600_000,
            max_event_age_ms: 86_400_000,
            vessel_speed_limit_kn: 90.0,
            max_events_per_key: 256,
            max_tracked_keys: 200_000,
        }
    }

    fn pipeline() -> (Arc<Pipeline>, Arc<MemoryCache>, Arc<MemoryHistory>) {
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(MemoryCache::new());
        let history = Arc::new(MemoryHistory::new());
        let window = Arc::new(WindowStore::new(window_cfg(), 4, metrics.clone()));
        let smoother = Arc::new(Smoother::new(
            SmootherConfig {
                alpha: 0.25,
                beta: 0.08,
                max_prediction_s: 600.0,
                max_filter_age_ms: 30 * 60 * 1000,
            },
            4,
        ));
        let publisher = Arc::new(Publisher::new(
            cache.clone(),
            history.clone(),
            window.clone(),
            metrics.clone(),
            600_000,
        ));
        (
            Arc::new(Pipeline {
                window,
                smoother,
                publisher,
                history: history.clone(),
                metrics,
                weights: SourceWeights::from_env().unwrap(),
                window_cfg: window_cfg(),
            }),
            cache,
            history,
        )
    }

    fn vessel(key: &str, ts: i64, lat: f64) -> NormMsg {
        NormMsg {
            kind: ObjectKind::Vessel,
            source: "aisstream".into(),
            key: key.into(),
            event_ts: ts,
            lat,
            lon: 20.0,
            speed: Some(10.0),
            course: Some(45.0),
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

    #[tokio::test]
    async fn process_key_publishes_then_stays_monotone() {
        let (p, cache, history) = pipeline();
        let now = Utc::now().timestamp_millis();
        let key: KeyRef = (ObjectKind::Vessel, "123456789".into());

        p.window.push(vessel("123456789", now - 60_000, 10.0), now);
        p.process_key(&key, now).await;
        assert_eq!(cache.published_on("vessel:position:update").len(), 1);

        // same window again: nothing newer, no duplicate publish
        p.process_key(&key, now).await;
        assert_eq!(cache.published_on("vessel:position:update").len(), 1);

        // a newer event publishes again
        p.window.push(vessel("123456789", now - 30_000, 10.001), now);
        p.process_key(&key, now).await;
        assert_eq!(cache.published_on("vessel:position:update").len(), 2);

        assert_eq!(
            history
                .load_last_published(ObjectKind::Vessel, "123456789")
                .await
                .unwrap(),
            Some(now - 30_000)
        );
    }

    #[tokio::test]
    async fn process_key_hydrates_mirror_from_durable_store() {
        let (p, cache, history) = pipeline();
        let now = Utc::now().timestamp_millis();
        let key: KeyRef = (ObjectKind::Vessel, "123456789".into());

        // a previous run published a newer event
        history
            .mark_published(ObjectKind::Vessel, "123456789", now - 10_000)
            .await
            .unwrap();
        p.window.push(vessel("123456789", now - 60_000, 10.0), now);
        p.process_key(&key, now).await;

        // older event: backfilled, not published
        assert!(cache.published_on("vessel:position:update").is_empty());
        assert_eq!(history.position_count(), 1);
    }

    #[tokio::test]
    async fn published_measurements_feed_the_smoother() {
        let (p, _cache, _history) = pipeline();
        let now = Utc::now().timestamp_millis();
        let key: KeyRef = (ObjectKind::Vessel, "123456789".into());
        p.window.push(vessel("123456789", now - 5_000, 10.0), now);
        p.process_key(&key, now).await;
        assert!(p.smoother.predict(&key, now).is_some());
    }
}
