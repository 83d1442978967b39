//! # adsb_stream
//!
//! HTTP streaming pull for aircraft ADSB data. Issues `POST /adsb/stream`
//! against the external API and reads a newline-delimited JSON stream where
//! every line is one array batch of raw aircraft records.
//!
//! Field and position filters are accepted and forwarded upstream verbatim —
//! they are pass-through, not applied locally. Key casing is normalized once
//! per batch; each batch is then handed to the queue worker as a named batch,
//! which owns normalization, the fusion feed, and the persistence fan-out.
//!
//! Limits: 60 s overall stream timeout, 5 s per-batch silence timeout, and
//! hard caps on batches and aircraft rows per call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::adapters::{AdapterHealth, AdapterState, Backoff};
use crate::config::AdsbConfig;
use crate::metrics::Metrics;
use crate::normalize;

const OVERALL_TIMEOUT: Duration = Duration::from_secs(60);
const BATCH_SILENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// One named batch of raw (key-lowered) records handed to the queue worker.
#[derive(Debug)]
pub struct AdsbBatch {
    pub name: String,
    pub records: Vec<Value>,
}

pub struct AdsbStreamAdapter {
    cfg: AdsbConfig,
    batch_tx: mpsc::Sender<AdsbBatch>,
    health: Arc<AdapterHealth>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
}

impl AdsbStreamAdapter {
    pub fn new(
        cfg: AdsbConfig,
        batch_tx: mpsc::Sender<AdsbBatch>,
        health: Arc<AdapterHealth>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cfg,
            batch_tx,
            health,
            metrics,
            http: reqwest::Client::new(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.cfg.enabled || self.cfg.external_api_url.is_empty() {
            info!("ADSB stream adapter disabled");
            self.health.set_state(AdapterState::Stopped);
            return;
        }
        if self.cfg.field_filter.is_some() || self.cfg.position_filter.is_some() {
            info!("adsb stream filters accepted (pass-through), forwarded upstream verbatim");
        }

        let mut backoff = Backoff::new();
        let interval = Duration::from_secs(self.cfg.interval_s.max(1));

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.health.set_state(AdapterState::Connecting);
            let wait = match self.stream_once().await {
                Ok(rows) => {
                    debug!(rows, "adsb stream cycle complete");
                    backoff.reset();
                    self.health.set_state(AdapterState::Idle);
                    interval
                }
                Err(e) => {
                    warn!("adsb stream cycle failed: {e:#}");
                    self.health.set_state(AdapterState::Reconnecting);
                    backoff.next()
                }
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.health.set_state(AdapterState::Stopped);
    }

    /// One stream call: post filters, then consume NDJSON array batches
    /// until the stream ends, goes silent, or a safety cap trips.
    async fn stream_once(&self) -> anyhow::Result<usize> {
        let url = format!(
            "{}/adsb/stream",
            self.cfg.external_api_url.trim_end_matches('/')
        );
        let body = json!({
            "FieldFilter": self.cfg.field_filter,
            "PositionFilter": self.cfg.position_filter,
            "Limit": self.cfg.limit_query,
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .timeout(OVERALL_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("adsb stream returned {}", resp.status());
        }
        self.health.set_state(AdapterState::Connected);

        let deadline = Instant::now() + OVERALL_TIMEOUT;
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut batches = 0usize;
        let mut total_rows = 0usize;

        'read: loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("adsb stream hit overall timeout");
                break;
            }
            let chunk = match timeout(BATCH_SILENCE_TIMEOUT.min(remaining), stream.next()).await {
                Err(_) => {
                    debug!("adsb stream silent, ending cycle");
                    break;
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let rows = self.ingest_batch(line, batches);
                if rows > 0 {
                    batches += 1;
                    total_rows += rows;
                }
                if batches >= self.cfg.max_batches {
                    warn!(batches, "adsb stream batch cap reached");
                    break 'read;
                }
                if total_rows >= self.cfg.max_aircraft {
                    warn!(total_rows, "adsb stream aircraft cap reached");
                    break 'read;
                }
            }
        }

        Ok(total_rows)
    }

    /// Parse one NDJSON line (an array batch), normalize key casing per
    /// batch, and hand the named batch to the queue worker.
    fn ingest_batch(&self, line: &str, seq: usize) -> usize {
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                self.metrics.parse_reject("adsb_exchange");
                debug!("adsb stream line rejected: {e}");
                return 0;
            }
        };
        let Some(records) = parsed.as_array() else {
            self.metrics.parse_reject("adsb_exchange");
            return 0;
        };

        let lowered: Vec<Value> = records.iter().map(normalize::lower_keys).collect();
        let rows = lowered.len();
        if rows > 0 {
            let batch = AdsbBatch {
                name: format!("adsb-{}-{seq}", Utc::now().timestamp_millis()),
                records: lowered,
            };
            if self.batch_tx.try_send(batch).is_err() {
                Metrics::inc(&self.metrics.ingest_drop);
                debug!("adsb batch queue full, dropping named batch");
            }
        }

        self.health.saw_rows(rows, Utc::now().timestamp_millis());
        rows
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AdsbConfig {
        AdsbConfig {
            enabled: true,
            interval_s: 30,
            limit_query: 10_000,
            redis_hash_key: "adsb:current_flights".into(),
            redis_ttl_s: 300,
            external_api_url: "http://adsb.example".into(),
            max_batches: 500,
            max_aircraft: 50_000,
            field_filter: None,
            position_filter: None,
            batch_queue_cap: 64,
        }
    }

    fn adapter() -> (AdsbStreamAdapter, mpsc::Receiver<AdsbBatch>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(8);
        let health = AdapterHealth::new("adsb_stream", true);
        let a = AdsbStreamAdapter::new(cfg(), tx, health, metrics.clone());
        (a, rx, metrics)
    }

    #[tokio::test]
    async fn batch_line_lowers_key_casing() {
        let (a, mut rx, _) = adapter();
        let line = r#"[{"Hexident":"ABCD12","Latitude":51.4,"Longitude":-0.4,"Unixtime":1755000000},{"Hexident":"EF3456","Latitude":48.1,"Longitude":2.3,"Unixtime":1755000001}]"#;
        let rows = a.ingest_batch(line, 0);
        assert_eq!(rows, 2);
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert!(batch.name.starts_with("adsb-"));
        // keys were lowered per batch
        assert!(batch.records[0].get("hexident").is_some());
        assert!(batch.records[0].get("Hexident").is_none());
    }

    #[tokio::test]
    async fn malformed_lines_count_parse_rejects() {
        let (a, _rx, metrics) = adapter();
        assert_eq!(a.ingest_batch("not json", 0), 0);
        assert_eq!(a.ingest_batch("{\"an\":\"object, not an array\"}", 1), 0);
        let snap = metrics.snapshot();
        assert_eq!(snap["parseReject"]["adsb_exchange"], 2);
    }

    #[tokio::test]
    async fn saturated_batch_queue_counts_drops() {
        let metrics = Arc::new(Metrics::new());
        let (tx, _rx) = mpsc::channel(1);
        let health = AdapterHealth::new("adsb_stream", true);
        let a = AdsbStreamAdapter::new(cfg(), tx, health, metrics.clone());
        let line = r#"[{"hexident":"abc","latitude":1.0,"longitude":2.0,"unixtime":1755000000}]"#;
        a.ingest_batch(line, 0);
        a.ingest_batch(line, 1); // channel full, dropped + counted
        assert_eq!(
            metrics
                .ingest_drop
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
