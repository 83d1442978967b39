//! # decider
//!
//! Per-key fusion decision: publish realtime, backfill history only, or do
//! nothing. Pure over its inputs so every branch is unit-testable.
//!
//! Publication is strictly event-time-monotone per key: a candidate whose
//! event time equals the last published timestamp is not publishable, which
//! also makes exact duplicates idempotent.

use telemetry_types::NormMsg;

use crate::config::{SourceWeights, WindowConfig};
use crate::fusion::{self, ConflictEvent};

#[derive(Debug, Default)]
pub struct Decision {
    pub best: Option<NormMsg>,
    pub publish: bool,
    pub backfill_only: bool,
    /// Composite score of the fused candidate, for the published record.
    pub score: f64,
}

fn is_valid_ts(ts: i64) -> bool {
    ts > 0
}

/// Validity + event-age gate re-checked at decide time with the current
/// wall clock; ingest-time validation may be arbitrarily stale by now.
fn sane(msg: &NormMsg, now_wall: i64, cfg: &WindowConfig) -> bool {
    is_valid_ts(msg.event_ts)
        && (-90.0..=90.0).contains(&msg.lat)
        && (-180.0..=180.0).contains(&msg.lon)
        && (now_wall - msg.event_ts).abs() <= cfg.max_event_age_ms
}

/// Decide for one key given a copy of its window and the last published
/// event timestamp (from the mirror of the durable store).
pub fn decide(
    window: &[NormMsg],
    last_published: Option<i64>,
    now_wall: i64,
    cfg: &WindowConfig,
    weights: &SourceWeights,
) -> (Decision, Vec<ConflictEvent>) {
    let window: Vec<&NormMsg> = window.iter().filter(|m| sane(m, now_wall, cfg)).collect();

    let newer: Vec<NormMsg> = window
        .iter()
        .filter(|m| {
            (now_wall - m.event_ts) <= cfg.allowed_lateness_ms
                && last_published.map_or(true, |last| m.event_ts > last)
        })
        .map(|m| (*m).clone())
        .collect();

    if let Some(out) = fusion::merge(&newer, weights, now_wall) {
        return (
            Decision {
                best: Some(out.msg),
                publish: true,
                backfill_only: false,
                score: out.score,
            },
            out.conflicts,
        );
    }

    let all: Vec<NormMsg> = window.into_iter().cloned().collect();
    if let Some(out) = fusion::merge(&all, weights, now_wall) {
        let best_ts = out.msg.event_ts;
        if let Some(last) = last_published {
            if best_ts <= last {
                return (
                    Decision {
                        best: Some(out.msg),
                        publish: false,
                        backfill_only: true,
                        score: out.score,
                    },
                    out.conflicts,
                );
            }
        }
        return (
            Decision {
                best: Some(out.msg),
                publish: true,
                backfill_only: false,
                score: out.score,
            },
            out.conflicts,
        );
    }

    (Decision::default(), Vec::new())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
