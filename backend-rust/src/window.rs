//! # window
//!
//! Sharded per-key sliding windows of normalized messages, ordered by event
//! time, plus the in-memory mirror of the durable last-published store.
//!
//! The window store exclusively owns every `Window`; callers get copies on
//! read. Shard count is fixed at construction and must be at least the worker
//! pool size so per-key serialization never contends across workers on the
//! same shard lock for long.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use telemetry_types::{NormMsg, ObjectKind};

use crate::config::WindowConfig;
use crate::metrics::Metrics;

pub type KeyRef = (ObjectKind, String);

/// Last-published mirror entry. `loaded` distinguishes "never hydrated from
/// the durable store" from "hydrated, never published".
#[derive(Debug, Clone, Copy, Default)]
struct LastPublished {
    loaded: bool,
    ts: Option<i64>,
}

#[derive(Debug, Default)]
struct Window {
    msgs: VecDeque<NormMsg>,
    last_seen_wall: i64,
    last_published: LastPublished,
}

#[derive(Default)]
struct Shard {
    keys: HashMap<KeyRef, Window>,
}

pub struct WindowStore {
    shards: Vec<Mutex<Shard>>,
    key_count: AtomicUsize,
    cfg: WindowConfig,
    metrics: Arc<Metrics>,
}

impl WindowStore {
    pub fn new(cfg: WindowConfig, shard_count: usize, metrics: Arc<Metrics>) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
            key_count: AtomicUsize::new(0),
            cfg,
            metrics,
        }
    }

    fn shard(&self, key: &KeyRef) -> &Mutex<Shard> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        &self.shards[(h.finish() as usize) % self.shards.len()]
    }

    /// Append a message to its key's window, keeping event-time order, then
    /// prune by event time and trim overflow. Returns false when the message
    /// was itself pruned on arrival (older than the window start).
    pub fn push(&self, msg: NormMsg, now_wall: i64) -> bool {
        let key: KeyRef = (msg.kind, msg.key.clone());
        let horizon = now_wall - self.cfg.window_ms;
        let mut retained;

        {
            let mut shard = self.shard(&key).lock();
            let is_new = !shard.keys.contains_key(&key);
            let win = shard.keys.entry(key.clone()).or_default();
            if is_new {
                self.key_count.fetch_add(1, Ordering::Relaxed);
            }

            // Insert preserving event-time order; ties keep arrival order.
            let pos = win
                .msgs
                .iter()
                .rposition(|m| m.event_ts <= msg.event_ts)
                .map(|p| p + 1)
                .unwrap_or(0);
            win.msgs.insert(pos, msg);

            while win.msgs.front().is_some_and(|m| m.event_ts < horizon) {
                win.msgs.pop_front();
            }
            while win.msgs.len() > self.cfg.max_events_per_key {
                win.msgs.pop_front();
                Metrics::inc(&self.metrics.window_trim);
            }

            win.last_seen_wall = now_wall;
            retained = !win.msgs.is_empty();
            if !retained {
                // Keep the key only if it still carries a useful mirror entry.
                retained = win.last_published.ts.is_some();
                if !retained {
                    shard.keys.remove(&key);
                    self.key_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        if self.key_count.load(Ordering::Relaxed) > self.cfg.max_tracked_keys {
            self.evict_lru();
        }
        retained
    }

    /// Copy-on-read view of a key's window.
    pub fn get(&self, key: &KeyRef) -> Vec<NormMsg> {
        self.shard(key)
            .lock()
            .keys
            .get(key)
            .map(|w| w.msgs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_last_published(&self, key: &KeyRef) -> Option<i64> {
        self.shard(key)
            .lock()
            .keys
            .get(key)
            .and_then(|w| w.last_published.ts)
    }

    /// Whether the mirror was hydrated from the durable store for this key.
    pub fn last_published_loaded(&self, key: &KeyRef) -> bool {
        self.shard(key)
            .lock()
            .keys
            .get(key)
            .map(|w| w.last_published.loaded)
            .unwrap_or(false)
    }

    /// Hydrate the mirror from the durable store without advancing it.
    pub fn prime_last_published(&self, key: &KeyRef, ts: Option<i64>) {
        let mut shard = self.shard(key).lock();
        if let Some(win) = shard.keys.get_mut(key) {
            if !win.last_published.loaded {
                win.last_published = LastPublished { loaded: true, ts };
            }
        }
    }

    pub fn set_last_published(&self, key: &KeyRef, ts: i64) {
        let mut shard = self.shard(key).lock();
        if let Some(win) = shard.keys.get_mut(key) {
            win.last_published = LastPublished {
                loaded: true,
                ts: Some(ts),
            };
        }
    }

    /// Delete keys with the oldest `last_seen_wall` until under the cap.
    pub fn evict_lru(&self) -> usize {
        let cap = self.cfg.max_tracked_keys;
        let total = self.key_count.load(Ordering::Relaxed);
        if total <= cap {
            return 0;
        }
        let excess = total - cap;

        let mut seen: Vec<(i64, KeyRef)> = Vec::with_capacity(total);
        for shard in &self.shards {
            let shard = shard.lock();
            seen.extend(
                shard
                    .keys
                    .iter()
                    .map(|(k, w)| (w.last_seen_wall, k.clone())),
            );
        }
        seen.sort_by_key(|(seen_wall, _)| *seen_wall);

        let mut evicted = 0;
        for (_, key) in seen.into_iter().take(excess) {
            let mut shard = self.shard(&key).lock();
            if shard.keys.remove(&key).is_some() {
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                Metrics::inc(&self.metrics.key_evict);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn tracked_keys(&self) -> usize {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn total_messages(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().keys.values().map(|w| w.msgs.len()).sum::<usize>())
            .sum()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
