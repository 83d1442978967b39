//! # adsb_queue
//!
//! Worker consuming named ADSB batches. For each batch it normalizes and
//! validates the records, feeds them into the fusion ingest channel, then
//! chunks the accepted rows into groups of 10 and persists at most 5 chunks
//! concurrently, fanning each record out to:
//!
//! - a Redis hash upsert under the configured flights hash (TTL'd),
//! - the historical store (aircraft upsert + position upsert),
//! - a realtime publish on `aircraft:position:update`.
//!
//! Persistence failures are logged and counted; the worker always moves on to
//! the next record.

use std::sync::Arc;

use chrono::Utc;
use futures_util::{stream, StreamExt};
use telemetry_types::{FusedRecord, NormMsg};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::adapters::adsb_stream::AdsbBatch;
use crate::adapters::{AdapterHealth, AdapterState, IngestQueue};
use crate::cache::RealtimeCache;
use crate::config::{AdsbConfig, SourceWeights};
use crate::fusion;
use crate::history::HistoryStore;
use crate::metrics::Metrics;
use crate::normalize;
use crate::validate::Validator;

const CHUNK_SIZE: usize = 10;
const PERSIST_CONCURRENCY: usize = 5;

pub struct AdsbQueueWorker {
    cfg: AdsbConfig,
    rx: mpsc::Receiver<AdsbBatch>,
    queue: Arc<IngestQueue>,
    cache: Arc<dyn RealtimeCache>,
    history: Arc<dyn HistoryStore>,
    validator: Arc<Validator>,
    weights: SourceWeights,
    health: Arc<AdapterHealth>,
    metrics: Arc<Metrics>,
}

impl AdsbQueueWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AdsbConfig,
        rx: mpsc::Receiver<AdsbBatch>,
        queue: Arc<IngestQueue>,
        cache: Arc<dyn RealtimeCache>,
        history: Arc<dyn HistoryStore>,
        validator: Arc<Validator>,
        weights: SourceWeights,
        health: Arc<AdapterHealth>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cfg,
            rx,
            queue,
            cache,
            history,
            validator,
            weights,
            health,
            metrics,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.health.set_state(AdapterState::Idle);
        loop {
            tokio::select! {
                batch = self.rx.recv() => {
                    match batch {
                        Some(batch) => self.process(batch).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    // Drain whatever is already queued, then stop.
                    while let Ok(batch) = self.rx.try_recv() {
                        self.process(batch).await;
                    }
                    break;
                }
            }
        }
        info!("adsb queue worker stopped");
        self.health.set_state(AdapterState::Stopped);
    }

    async fn process(&self, batch: AdsbBatch) {
        self.health.set_state(AdapterState::Connected);
        let now_ms = Utc::now().timestamp_millis();

        let mut accepted: Vec<(FusedRecord, String)> = Vec::new();
        for raw in &batch.records {
            let mut msg: NormMsg = match normalize::normalize_aircraft(raw, "adsb_exchange") {
                Ok(msg) => msg,
                Err(reason) => {
                    self.metrics.parse_reject("adsb_exchange");
                    debug!(batch = %batch.name, reason = reason.as_str(), "adsb record rejected");
                    continue;
                }
            };
            if self.validator.validate(&mut msg, now_ms).is_err() {
                continue; // reason already counted by the validator
            }

            let score = fusion::score(&msg, now_ms, &self.weights);
            let rec = FusedRecord::from_msg(&msg, score, false);
            // The fusion pipeline decides the canonical publish separately.
            self.queue.push(msg);

            match serde_json::to_string(&rec) {
                Ok(payload) => accepted.push((rec, payload)),
                Err(e) => warn!("adsb record serialization failed: {e}"),
            }
        }

        let rows = accepted.len();
        let chunks: Vec<Vec<(FusedRecord, String)>> = accepted
            .chunks(CHUNK_SIZE)
            .map(|c| c.to_vec())
            .collect();

        stream::iter(chunks)
            .map(|chunk| self.persist_chunk(chunk))
            .buffer_unordered(PERSIST_CONCURRENCY)
            .collect::<Vec<()>>()
            .await;

        debug!(batch = %batch.name, rows, "adsb batch processed");
        self.health.saw_rows(rows, now_ms);
        self.health.set_state(AdapterState::Idle);
    }

    async fn persist_chunk(&self, chunk: Vec<(FusedRecord, String)>) {
        for (rec, payload) in chunk {
            let hexident = rec.icao24.clone().unwrap_or_else(|| rec.key.clone());

            if let Err(e) = self
                .cache
                .upsert_flight_hash(
                    &self.cfg.redis_hash_key,
                    &hexident,
                    &payload,
                    self.cfg.redis_ttl_s,
                )
                .await
            {
                Metrics::inc(&self.metrics.publish_fail);
                warn!(key = %rec.key, "flight hash upsert failed: {e}");
            }

            match self.history.upsert_object(&rec).await {
                Ok(()) => {
                    if let Err(e) = self.history.upsert_position(&rec).await {
                        Metrics::inc(&self.metrics.persist_fail);
                        warn!(key = %rec.key, "position upsert failed: {e}");
                    } else {
                        Metrics::inc(&self.metrics.persist_ok);
                    }
                }
                Err(e) => {
                    Metrics::inc(&self.metrics.persist_fail);
                    warn!(key = %rec.key, "aircraft upsert failed: {e}");
                }
            }

            if let Err(e) = self
                .cache
                .publish("aircraft:position:update", &payload)
                .await
            {
                Metrics::inc(&self.metrics.publish_fail);
                warn!(key = %rec.key, "aircraft publish failed: {e}");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
