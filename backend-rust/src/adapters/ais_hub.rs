//! # ais_hub
//!
//! Streaming push-hub client for vessel telemetry. Maintains a long-lived
//! session against a remote query hub, listening for three events:
//!
//! - `QueryCount` — expected size of the incoming batch
//! - `QueryData`  — an array of raw AIS records
//! - `QueryEnd`   — batch terminator
//!
//! Transports are tried in order: the hub's negotiated default, then
//! websocket, then server-sent events, then long polling. Queries are
//! triggered periodically through `POST /api/query`, either with a fixed
//! filter or a time-window predicate (`updatetime >= 'T0'`). When the feed
//! runs cold the lookback escalates through 30 s → 2 min → 5 min → 15 min
//! across query-syntax variants, and after two consecutive empty cycles a
//! set of diagnostic probes (1 h, 24 h, small capped sample) runs once.
//!
//! Frames are JSON records separated by `0x1e`, hub-protocol style:
//! `{"type":1,"target":"QueryData","arguments":[[...]]}`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterHealth, AdapterState, Backoff, IngestQueue};
use crate::config::AisHubConfig;
use crate::metrics::Metrics;
use crate::normalize;

const FRAME_SEP: char = '\u{1e}';
/// Ingest-queue depth below which the buffer counts as cold.
const COLD_LOW_WATER: usize = 16;
const COLD_LOOKBACK_S: [i64; 4] = [30, 120, 300, 900];
const DIAG_LOOKBACK_S: [i64; 2] = [3_600, 86_400];
const DIAG_SAMPLE_LIMIT: usize = 50;
const LONG_POLL_TIMEOUT_S: u64 = 30;

// ── Query planning ────────────────────────────────────────────────────────────

/// Tracks trigger state across query cycles: the incremental T0 watermark,
/// consecutive empty cycles, cold-start escalation stage, and which query
/// syntax variant to try next.
struct QueryPlan {
    incremental_t0_ms: Option<i64>,
    batch_rows: usize,
    batch_max_ts: i64,
    empty_cycles: u32,
    cold_stage: usize,
    variant: usize,
    diagnostics_ran: bool,
}

impl QueryPlan {
    fn new() -> Self {
        Self {
            incremental_t0_ms: None,
            batch_rows: 0,
            batch_max_ts: 0,
            empty_cycles: 0,
            cold_stage: 0,
            variant: 0,
            diagnostics_ran: false,
        }
    }

    fn fmt_t0(t0_ms: i64) -> String {
        Utc.timestamp_millis_opt(t0_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    /// Render one time-window predicate in the given syntax variant.
    fn render(t0_ms: i64, variant: usize) -> String {
        let t0 = Self::fmt_t0(t0_ms);
        match variant % 3 {
            0 => format!("updatetime >= '{t0}'"),
            1 => format!("updatetime > '{t0}'"),
            _ => format!("UpdateTime >= '{t0}'"),
        }
    }

    /// Build the query for the next trigger cycle.
    fn next_query(&mut self, cfg: &AisHubConfig, now_ms: i64, queue_depth: usize) -> String {
        if !cfg.query.is_empty() {
            return cfg.query.clone();
        }

        let cold = queue_depth < COLD_LOW_WATER && self.batch_rows == 0;
        let lookback_ms = if cold {
            let stage = self.cold_stage.min(COLD_LOOKBACK_S.len() - 1);
            COLD_LOOKBACK_S[stage] * 1000
        } else {
            cfg.query_minutes * 60_000
        };

        let t0 = if cfg.query_incremental && !cold {
            self.incremental_t0_ms
                .unwrap_or(now_ms - lookback_ms)
                .min(now_ms)
        } else {
            now_ms - lookback_ms
        };

        let q = Self::render(t0, self.variant);
        if cold {
            self.variant = self.variant.wrapping_add(1);
            self.cold_stage = (self.cold_stage + 1).min(COLD_LOOKBACK_S.len() - 1);
        }
        q
    }

    /// Account a finished batch cycle; returns true when the diagnostic
    /// probes should run now.
    fn cycle_done(&mut self) -> bool {
        if self.batch_rows == 0 {
            self.empty_cycles += 1;
        } else {
            self.empty_cycles = 0;
            self.cold_stage = 0;
            self.diagnostics_ran = false;
            if self.batch_max_ts > 0 {
                self.incremental_t0_ms = Some(self.batch_max_ts + 60_000);
            }
        }
        self.batch_rows = 0;
        self.batch_max_ts = 0;

        let run_diag = self.empty_cycles >= 2 && !self.diagnostics_ran;
        if run_diag {
            self.diagnostics_ran = true;
        }
        run_diag
    }
}

// ── Hub frames ────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum HubEvent {
    QueryCount(u64),
    QueryData(Vec<Value>),
    QueryEnd,
    Ping,
    Other,
}

fn parse_frame(frame: &str) -> Option<HubEvent> {
    let v: Value = serde_json::from_str(frame).ok()?;
    if v.get("type").and_then(Value::as_u64) == Some(6) {
        return Some(HubEvent::Ping);
    }
    let target = v.get("target").and_then(Value::as_str)?;
    let args = v.get("arguments").and_then(Value::as_array);
    match target {
        "QueryCount" => {
            let n = args
                .and_then(|a| a.first())
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Some(HubEvent::QueryCount(n))
        }
        "QueryData" => {
            let records = match args.and_then(|a| a.first()) {
                Some(Value::Array(records)) => records.clone(),
                Some(single @ Value::Object(_)) => vec![single.clone()],
                _ => Vec::new(),
            };
            Some(HubEvent::QueryData(records))
        }
        "QueryEnd" => Some(HubEvent::QueryEnd),
        _ => Some(HubEvent::Other),
    }
}

/// Split a text chunk into complete 0x1e-terminated frames, keeping any
/// partial tail in `buf`.
fn drain_frames(buf: &mut String, chunk: &str, out: &mut VecDeque<String>) {
    buf.push_str(chunk);
    while let Some(pos) = buf.find(FRAME_SEP) {
        let frame: String = buf.drain(..=pos).take_while(|c| *c != FRAME_SEP).collect();
        if !frame.trim().is_empty() {
            out.push_back(frame);
        }
    }
}

// ── Transports ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    WebSocket,
    ServerSentEvents,
    LongPolling,
}

impl Transport {
    fn as_str(&self) -> &'static str {
        match self {
            Transport::WebSocket => "websocket",
            Transport::ServerSentEvents => "sse",
            Transport::LongPolling => "longpolling",
        }
    }

    fn from_negotiated(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "websockets" | "websocket" => Some(Transport::WebSocket),
            "serversentevents" | "sse" => Some(Transport::ServerSentEvents),
            "longpolling" => Some(Transport::LongPolling),
            _ => None,
        }
    }
}

enum HubStream {
    Ws {
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        buf: String,
        frames: VecDeque<String>,
    },
    Sse {
        body: futures_util::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
        buf: String,
        frames: VecDeque<String>,
    },
    Poll {
        client: reqwest::Client,
        url: String,
        frames: VecDeque<String>,
    },
}

impl HubStream {
    async fn next_frame(&mut self) -> anyhow::Result<Option<String>> {
        loop {
            match self {
                HubStream::Ws { stream, buf, frames } => {
                    if let Some(f) = frames.pop_front() {
                        return Ok(Some(f));
                    }
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => drain_frames(buf, &text, frames),
                        Some(Ok(Message::Ping(p))) => {
                            let _ = stream.send(Message::Pong(p)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(None),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                HubStream::Sse { body, buf, frames } => {
                    if let Some(f) = frames.pop_front() {
                        return Ok(Some(f));
                    }
                    match body.next().await {
                        Some(Ok(bytes)) => {
                            let chunk = String::from_utf8_lossy(&bytes).to_string();
                            // SSE framing: every `data:` line carries one hub frame
                            for line in chunk.lines() {
                                if let Some(data) = line.strip_prefix("data:") {
                                    drain_frames(buf, data.trim(), frames);
                                    if !data.contains(FRAME_SEP) {
                                        // SSE events usually omit the separator
                                        let data = data.trim();
                                        if !data.is_empty() {
                                            frames.push_back(data.to_string());
                                            buf.clear();
                                        }
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(None),
                    }
                }
                HubStream::Poll { client, url, frames } => {
                    if let Some(f) = frames.pop_front() {
                        return Ok(Some(f));
                    }
                    let resp = client
                        .get(url.as_str())
                        .timeout(Duration::from_secs(LONG_POLL_TIMEOUT_S))
                        .send()
                        .await?;
                    if !resp.status().is_success() {
                        anyhow::bail!("long poll returned {}", resp.status());
                    }
                    let text = resp.text().await?;
                    let mut buf = String::new();
                    drain_frames(&mut buf, &text, frames);
                    if frames.is_empty() && !buf.trim().is_empty() {
                        frames.push_back(buf);
                    }
                }
            }
        }
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

pub struct AisHubAdapter {
    cfg: AisHubConfig,
    queue: Arc<IngestQueue>,
    health: Arc<AdapterHealth>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
}

impl AisHubAdapter {
    pub fn new(
        cfg: AisHubConfig,
        queue: Arc<IngestQueue>,
        health: Arc<AdapterHealth>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_s))
            .build()
            .unwrap_or_default();
        Self {
            cfg,
            queue,
            health,
            metrics,
            http,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.cfg.enabled || self.cfg.host.is_empty() {
            info!("AIS hub adapter disabled");
            self.health.set_state(AdapterState::Stopped);
            return;
        }

        let mut backoff = Backoff::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.health.set_state(AdapterState::Connecting);
            match self.session(&mut shutdown).await {
                Ok(()) => break, // graceful shutdown
                Err(e) => {
                    warn!("AIS hub session error: {e:#}");
                    self.health.set_state(AdapterState::Reconnecting);
                    let delay = backoff.next();
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        self.health.set_state(AdapterState::Stopped);
    }

    /// One connected hub session: negotiate, attach a transport, then pump
    /// events and trigger queries until the stream ends or shutdown.
    async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let (connection_id, mut transports) = self.negotiate().await?;
        transports.extend([
            Transport::WebSocket,
            Transport::ServerSentEvents,
            Transport::LongPolling,
        ]);

        let mut stream = None;
        for t in dedup(transports) {
            match self.connect_transport(t, &connection_id).await {
                Ok(s) => {
                    info!(transport = t.as_str(), "AIS hub connected");
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(transport = t.as_str(), "transport failed: {e:#}");
                }
            }
        }
        let mut stream = stream.ok_or_else(|| anyhow::anyhow!("all hub transports failed"))?;
        self.health.set_state(AdapterState::Connected);

        let mut plan = QueryPlan::new();
        let mut trigger = interval(Duration::from_millis(
            self.cfg.auto_trigger_interval_ms.max(1_000),
        ));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("AIS hub draining on shutdown");
                    return Ok(());
                }
                _ = trigger.tick(), if self.cfg.auto_trigger => {
                    self.health.set_state(AdapterState::Triggering);
                    let query = plan.next_query(&self.cfg, Utc::now().timestamp_millis(), self.queue.len());
                    if let Err(e) = self.trigger_query(&connection_id, &query).await {
                        warn!("AIS hub trigger failed: {e:#}");
                    }
                    self.health.set_state(AdapterState::Idle);
                }
                frame = stream.next_frame() => {
                    match frame? {
                        None => anyhow::bail!("hub stream closed"),
                        Some(raw) => {
                            if let Some(event) = parse_frame(&raw) {
                                if self.handle_event(event, &mut plan).await {
                                    // diagnostics requested after empty cycles
                                    self.run_diagnostics(&connection_id).await;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn negotiate(&self) -> anyhow::Result<(String, Vec<Transport>)> {
        let url = format!("{}/hub/negotiate", self.cfg.host.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.cfg.connect_timeout_s))
            .json(&json!({ "device": self.cfg.device }))
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => {
                let body: Value = resp.json().await.unwrap_or_else(|_| json!({}));
                let connection_id = body
                    .get("connectionId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let transports = body
                    .get("availableTransports")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(|t| {
                                t.get("transport")
                                    .and_then(Value::as_str)
                                    .and_then(Transport::from_negotiated)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok((connection_id, transports))
            }
            Ok(resp) => {
                debug!("negotiate returned {}", resp.status());
                Ok((uuid::Uuid::new_v4().to_string(), Vec::new()))
            }
            Err(e) => {
                // Some hubs skip negotiation entirely; fall through to the
                // transport ladder with a synthetic connection id.
                debug!("negotiate failed: {e}");
                Ok((uuid::Uuid::new_v4().to_string(), Vec::new()))
            }
        }
    }

    async fn connect_transport(
        &self,
        transport: Transport,
        connection_id: &str,
    ) -> anyhow::Result<HubStream> {
        let host = self.cfg.host.trim_end_matches('/');
        match transport {
            Transport::WebSocket => {
                let ws_host = host
                    .replacen("https://", "wss://", 1)
                    .replacen("http://", "ws://", 1);
                let url = format!(
                    "{ws_host}/hub?id={connection_id}&device={}",
                    self.cfg.device
                );
                let (mut stream, _) = timeout(
                    Duration::from_secs(self.cfg.connect_timeout_s),
                    tokio_tungstenite::connect_async(&url),
                )
                .await??;
                stream
                    .send(Message::Text(format!(
                        "{{\"protocol\":\"json\",\"version\":1}}{FRAME_SEP}"
                    )))
                    .await?;
                Ok(HubStream::Ws {
                    stream,
                    buf: String::new(),
                    frames: VecDeque::new(),
                })
            }
            Transport::ServerSentEvents => {
                let url = format!("{host}/hub?id={connection_id}&transport=sse");
                let resp = self
                    .http
                    .get(&url)
                    .header("accept", "text/event-stream")
                    .timeout(Duration::from_secs(self.cfg.connect_timeout_s * 60))
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    anyhow::bail!("sse connect returned {}", resp.status());
                }
                Ok(HubStream::Sse {
                    body: resp.bytes_stream().boxed(),
                    buf: String::new(),
                    frames: VecDeque::new(),
                })
            }
            Transport::LongPolling => {
                let url = format!("{host}/hub?id={connection_id}&transport=longpolling");
                // Probe once so a dead endpoint fails the ladder here.
                let resp = self
                    .http
                    .get(&url)
                    .timeout(Duration::from_secs(self.cfg.connect_timeout_s))
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    anyhow::bail!("long poll probe returned {}", resp.status());
                }
                Ok(HubStream::Poll {
                    client: self.http.clone(),
                    url,
                    frames: VecDeque::new(),
                })
            }
        }
    }

    /// Handle one hub event; returns true when diagnostics should run.
    async fn handle_event(&self, event: HubEvent, plan: &mut QueryPlan) -> bool {
        match event {
            HubEvent::QueryCount(n) => {
                debug!(expected = n, "hub announced batch");
                false
            }
            HubEvent::QueryData(records) => {
                let now_ms = Utc::now().timestamp_millis();
                let mut accepted = 0usize;
                for raw in &records {
                    match normalize::normalize_vessel(raw, "signalr") {
                        Ok(msg) => {
                            plan.batch_max_ts = plan.batch_max_ts.max(msg.event_ts);
                            self.queue.push(msg);
                            accepted += 1;
                        }
                        Err(reason) => {
                            self.metrics.parse_reject("signalr");
                            debug!(reason = reason.as_str(), "AIS record rejected");
                        }
                    }
                }
                plan.batch_rows += accepted;
                self.health.saw_rows(accepted, now_ms);
                false
            }
            HubEvent::QueryEnd => {
                let run_diag = plan.cycle_done();
                if run_diag {
                    warn!("AIS hub: two consecutive empty cycles, running diagnostics");
                }
                run_diag
            }
            HubEvent::Ping | HubEvent::Other => false,
        }
    }

    async fn trigger_query(&self, connection_id: &str, query: &str) -> anyhow::Result<()> {
        let url = format!("{}/api/query", self.cfg.host.trim_end_matches('/'));
        let payload = json!({
            "ConnectionId": connection_id,
            "UserId": self.cfg.user_id,
            "Query": query,
            "UsingLastUpdateTime": self.cfg.using_last_update_time,
        });
        debug!(%query, "triggering hub query");
        let resp = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.cfg.connect_timeout_s))
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("trigger returned {}", resp.status());
        }
        Ok(())
    }

    /// Probe queries issued after two consecutive empty cycles: a 1 h and a
    /// 24 h lookback plus a small capped sample, to distinguish "feed is
    /// quiet" from "our predicate is wrong".
    async fn run_diagnostics(&self, connection_id: &str) {
        let now_ms = Utc::now().timestamp_millis();
        for lookback_s in DIAG_LOOKBACK_S {
            let q = QueryPlan::render(now_ms - lookback_s * 1000, 0);
            if let Err(e) = self.trigger_query(connection_id, &q).await {
                warn!(lookback_s, "diagnostic probe failed: {e:#}");
            }
        }
        let sample = format!("limit {DIAG_SAMPLE_LIMIT}");
        if let Err(e) = self.trigger_query(connection_id, &sample).await {
            warn!("diagnostic sample probe failed: {e:#}");
        }
    }
}

fn dedup(transports: Vec<Transport>) -> Vec<Transport> {
    let mut out = Vec::new();
    for t in transports {
        if !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AisHubConfig {
        AisHubConfig {
            enabled: true,
            host: "http://hub.example".into(),
            device: "pelorus".into(),
            user_id: "tester".into(),
            query: String::new(),
            auto_trigger: true,
            auto_trigger_interval_ms: 30_000,
            query_minutes: 5,
            query_incremental: true,
            using_last_update_time: true,
            connect_timeout_s: 15,
        }
    }

    #[test]
    fn frames_split_on_record_separator() {
        let mut buf = String::new();
        let mut out = VecDeque::new();
        drain_frames(&mut buf, "{\"a\":1}\u{1e}{\"b\":", &mut out);
        assert_eq!(out.len(), 1);
        drain_frames(&mut buf, "2}\u{1e}", &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], "{\"b\":2}");
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_hub_events() {
        match parse_frame(r#"{"type":1,"target":"QueryCount","arguments":[42]}"#) {
            Some(HubEvent::QueryCount(42)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match parse_frame(r#"{"type":1,"target":"QueryData","arguments":[[{"MMSI":"1"}]]}"#) {
            Some(HubEvent::QueryData(records)) => assert_eq!(records.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_frame(r#"{"type":1,"target":"QueryEnd","arguments":[]}"#) {
            Some(HubEvent::QueryEnd) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match parse_frame(r#"{"type":6}"#) {
            Some(HubEvent::Ping) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn fixed_query_passes_through() {
        let mut cfg = cfg();
        cfg.query = "mmsi = '123'".into();
        let mut plan = QueryPlan::new();
        assert_eq!(plan.next_query(&cfg, 1_755_000_000_000, 100), "mmsi = '123'");
    }

    #[test]
    fn time_window_query_uses_lookback_minutes() {
        let cfg = cfg();
        let mut plan = QueryPlan::new();
        // warm queue: no cold escalation
        let q = plan.next_query(&cfg, 1_754_964_000_000, 100);
        // now − 5 min = 2025-08-12T01:55:00Z
        assert_eq!(q, "updatetime >= '2025-08-12 01:55:00'");
    }

    #[test]
    fn incremental_t0_advances_from_batch() {
        let cfg = cfg();
        let mut plan = QueryPlan::new();
        plan.batch_rows = 10;
        plan.batch_max_ts = 1_754_964_000_000;
        assert!(!plan.cycle_done());
        // T0 = max batch ts + 60 s
        assert_eq!(plan.incremental_t0_ms, Some(1_754_964_060_000));
        let q = plan.next_query(&cfg, 1_754_964_120_000, 100);
        assert_eq!(q, "updatetime >= '2025-08-12 02:01:00'");
    }

    #[test]
    fn cold_start_escalates_lookback_and_variants() {
        let cfg = cfg();
        let mut plan = QueryPlan::new();
        let now = 1_754_964_000_000;
        // empty queue, no rows: cold path
        let q0 = plan.next_query(&cfg, now, 0);
        assert!(q0.contains("01:59:30"), "30 s lookback first: {q0}");
        let q1 = plan.next_query(&cfg, now, 0);
        assert!(q1.contains("01:58:00"), "2 min lookback second: {q1}");
        let q2 = plan.next_query(&cfg, now, 0);
        assert!(q2.contains("01:55:00"), "5 min lookback third: {q2}");
        let q3 = plan.next_query(&cfg, now, 0);
        assert!(q3.contains("01:45:00"), "15 min lookback fourth: {q3}");
        // variants rotate across the escalation
        assert!(q1.starts_with("updatetime >") || q1.starts_with("UpdateTime"));
    }

    #[test]
    fn diagnostics_after_two_empty_cycles_runs_once() {
        let mut plan = QueryPlan::new();
        assert!(!plan.cycle_done());
        assert!(plan.cycle_done());
        // does not re-trigger every cycle
        assert!(!plan.cycle_done());
        // data resets the breaker
        plan.batch_rows = 1;
        assert!(!plan.cycle_done());
        assert!(!plan.cycle_done());
        assert!(plan.cycle_done());
    }
}
