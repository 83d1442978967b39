//! # adapters
//!
//! Long-running ingest tasks. Every adapter owns its connection lifecycle
//! (exponential backoff, jittered), normalizes upstream records, and delivers
//! them into the shared bounded ingest queue. On overflow the queue drops its
//! oldest entry and counts it — an adapter never blocks its upstream.

pub mod adsb_queue;
pub mod adsb_stream;
pub mod ais_hub;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use rand::Rng;
use serde_json::{json, Value};
use telemetry_types::NormMsg;
use tokio::sync::Notify;

use crate::metrics::Metrics;

// ── Adapter state machine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdapterState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Triggering = 3,
    Idle = 4,
    Reconnecting = 5,
    Stopped = 6,
}

impl AdapterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterState::Disconnected => "disconnected",
            AdapterState::Connecting => "connecting",
            AdapterState::Connected => "connected",
            AdapterState::Triggering => "triggering",
            AdapterState::Idle => "idle",
            AdapterState::Reconnecting => "reconnecting",
            AdapterState::Stopped => "stopped",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => AdapterState::Connecting,
            2 => AdapterState::Connected,
            3 => AdapterState::Triggering,
            4 => AdapterState::Idle,
            5 => AdapterState::Reconnecting,
            6 => AdapterState::Stopped,
            _ => AdapterState::Disconnected,
        }
    }
}

/// Shared health/counters for one adapter, read by the status surface.
pub struct AdapterHealth {
    pub name: &'static str,
    pub enabled: AtomicBool,
    state: AtomicU8,
    pub last_event_ms: AtomicI64,
    pub batches: AtomicU64,
    pub rows: AtomicU64,
}

impl AdapterHealth {
    pub fn new(name: &'static str, enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            enabled: AtomicBool::new(enabled),
            state: AtomicU8::new(AdapterState::Disconnected as u8),
            last_event_ms: AtomicI64::new(0),
            batches: AtomicU64::new(0),
            rows: AtomicU64::new(0),
        })
    }

    pub fn set_state(&self, state: AdapterState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn saw_rows(&self, rows: usize, now_ms: i64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows as u64, Ordering::Relaxed);
        self.last_event_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "name": self.name,
            "enabled": self.enabled.load(Ordering::Relaxed),
            "state": self.state().as_str(),
            "lastEventMs": self.last_event_ms.load(Ordering::Relaxed),
            "batches": self.batches.load(Ordering::Relaxed),
            "rows": self.rows.load(Ordering::Relaxed),
        })
    }
}

// ── Backoff ───────────────────────────────────────────────────────────────────

/// Reconnect backoff: 1 s, 2 s, 5 s, 10 s, then capped at 10 s, ±20 % jitter.
pub struct Backoff {
    attempt: usize,
}

const BACKOFF_STEPS_MS: [u64; 4] = [1_000, 2_000, 5_000, 10_000];

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next(&mut self) -> Duration {
        let base = BACKOFF_STEPS_MS[self.attempt.min(BACKOFF_STEPS_MS.len() - 1)];
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis((base as f64 * jitter) as u64)
    }

    /// The un-jittered delay the next call will base itself on.
    pub fn peek_base_ms(&self) -> u64 {
        BACKOFF_STEPS_MS[self.attempt.min(BACKOFF_STEPS_MS.len() - 1)]
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

// ── Bounded ingest queue (drop-oldest) ────────────────────────────────────────

/// The single channel every adapter feeds. Bounded; overflow displaces the
/// oldest queued message and bumps `ingest_drop` so slow consumers can never
/// stall an upstream read loop.
pub struct IngestQueue {
    queue: ArrayQueue<NormMsg>,
    notify: Notify,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl IngestQueue {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    pub fn push(&self, msg: NormMsg) {
        if self.queue.force_push(msg).is_some() {
            Metrics::inc(&self.metrics.ingest_drop);
        }
        self.notify.notify_one();
    }

    /// Mark the queue closed; consumers drain what remains, then stop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Receive up to `max` messages, waiting for at least one unless the
    /// queue is closed and empty (then `None`).
    pub async fn recv_batch(&self, max: usize) -> Option<Vec<NormMsg>> {
        loop {
            let mut out = Vec::new();
            while out.len() < max {
                match self.queue.pop() {
                    Some(msg) => out.push(msg),
                    None => break,
                }
            }
            if !out.is_empty() {
                return Some(out);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
