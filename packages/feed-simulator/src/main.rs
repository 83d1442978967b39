//! main.rs — Synthetic upstream feed server
//!
//! Runs two concurrent loops plus an HTTP surface:
//!   1. Physics loop: advances vessel + aircraft tracks each tick
//!   2. Hub loop: on every `/api/query` trigger, emits a
//!      QueryCount → QueryData → QueryEnd cycle to connected hub sockets
//!   3. Axum server: `/adsb/stream` (NDJSON array batches), `/adsb/fetch`
//!      (echo), `/adsb/query` (snapshot), `/hub/negotiate` + `/hub` (WS)
//!
//! Point the backend at `http://localhost:<port>` for both AIS_HOST and
//! ADSB_EXTERNAL_API_URL and the whole pipeline runs without real feeds.

mod tracks;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

use tracks::{AircraftTrack, VesselTrack};

const FRAME_SEP: char = '\u{1e}';

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "feed-sim", about = "Pelorus synthetic AIS/ADSB upstream feeds")]
struct Args {
    /// Number of simulated vessels
    #[arg(long, default_value = "12")]
    vessels: usize,
    /// Number of simulated aircraft
    #[arg(long, default_value = "6")]
    aircraft: usize,
    /// HTTP + hub port
    #[arg(long, default_value = "9800")]
    port: u16,
    /// Physics tick, milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,
    /// Fleet center latitude
    #[arg(long, default_value = "37.8")]
    lat: f64,
    /// Fleet center longitude
    #[arg(long, default_value = "-122.4")]
    lon: f64,
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct Fleet {
    vessels: Vec<VesselTrack>,
    aircraft: Vec<AircraftTrack>,
}

#[derive(Clone)]
struct AppState {
    fleet: Arc<RwLock<Fleet>>,
    /// Hub frames fanned out to every connected hub socket.
    hub_tx: broadcast::Sender<String>,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feed_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    info!(
        "feed-sim starting — {} vessels, {} aircraft around ({}, {})",
        args.vessels, args.aircraft, args.lat, args.lon
    );

    let fleet = Fleet {
        vessels: (0..args.vessels)
            .map(|i| VesselTrack::spawn(i, args.lat, args.lon))
            .collect(),
        aircraft: (0..args.aircraft)
            .map(|i| AircraftTrack::spawn(i, args.lat, args.lon))
            .collect(),
    };
    let (hub_tx, _) = broadcast::channel(256);
    let state = AppState {
        fleet: Arc::new(RwLock::new(fleet)),
        hub_tx,
    };

    // Physics loop
    {
        let state = state.clone();
        let tick_ms = args.tick_ms.max(100);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(tick_ms));
            let dt_s = tick_ms as f64 / 1000.0;
            loop {
                tick.tick().await;
                let mut fleet = state.fleet.write().await;
                for v in &mut fleet.vessels {
                    v.step(dt_s);
                }
                for a in &mut fleet.aircraft {
                    a.step(dt_s);
                }
            }
        });
    }

    let app = Router::new()
        .route("/adsb/stream", post(adsb_stream))
        .route("/adsb/fetch", post(adsb_fetch))
        .route("/adsb/query", post(adsb_query))
        .route("/hub/negotiate", post(hub_negotiate))
        .route("/hub", get(hub_ws))
        .route("/api/query", post(api_query))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    info!("feed-sim listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("bind feed-sim port");
    axum::serve(listener, app).await.expect("serve feed-sim");
}

// ── ADSB endpoints ────────────────────────────────────────────────────────────

/// Newline-delimited JSON stream: a handful of array batches, then EOF.
async fn adsb_stream(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    debug!(filters = %body, "adsb stream requested");
    let fleet = state.fleet.read().await;
    let now_ms = Utc::now().timestamp_millis();

    // Split the fleet into batches of up to 4 aircraft per line.
    let records: Vec<Value> = fleet.aircraft.iter().map(|a| a.to_record(now_ms)).collect();
    drop(fleet);

    let mut lines = String::new();
    for chunk in records.chunks(4) {
        lines.push_str(&Value::Array(chunk.to_vec()).to_string());
        lines.push('\n');
    }

    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(lines.into())
        .unwrap_or_else(|_| Response::new(String::new().into()))
}

/// Echo endpoint the real upstream offers for batch replay.
async fn adsb_fetch(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "echo": body }))
}

/// Historical query stub: returns the current snapshot.
async fn adsb_query(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    debug!(query = %body, "adsb query");
    let fleet = state.fleet.read().await;
    let now_ms = Utc::now().timestamp_millis();
    let records: Vec<Value> = fleet.aircraft.iter().map(|a| a.to_record(now_ms)).collect();
    Json(json!({ "rows": records }))
}

// ── Hub endpoints ─────────────────────────────────────────────────────────────

async fn hub_negotiate() -> Json<Value> {
    Json(json!({
        "connectionId": format!("sim-{}", Utc::now().timestamp_millis()),
        "availableTransports": [ { "transport": "WebSockets" } ],
    }))
}

async fn hub_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| hub_session(socket, state))
}

async fn hub_session(mut socket: WebSocket, state: AppState) {
    info!("hub client connected");
    let mut rx = state.hub_tx.subscribe();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    // handshake or ping from the client; ack with empty frame
                    Some(Ok(Message::Text(text))) => {
                        if text.contains("\"protocol\"") {
                            let _ = socket.send(Message::Text(format!("{{}}{FRAME_SEP}"))).await;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                }
            }
            frame = rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "hub socket lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    info!("hub client disconnected");
}

/// Query trigger: emits one QueryCount → QueryData → QueryEnd cycle.
async fn api_query(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    let query = body.get("Query").and_then(Value::as_str).unwrap_or("");
    info!(%query, "hub query triggered");

    let fleet = state.fleet.read().await;
    let now_ms = Utc::now().timestamp_millis();
    let records: Vec<Value> = fleet.vessels.iter().map(|v| v.to_record(now_ms)).collect();
    drop(fleet);

    let frames = [
        json!({ "type": 1, "target": "QueryCount", "arguments": [records.len()] }),
        json!({ "type": 1, "target": "QueryData", "arguments": [records] }),
        json!({ "type": 1, "target": "QueryEnd", "arguments": [] }),
    ];
    for frame in frames {
        let _ = state.hub_tx.send(format!("{frame}{FRAME_SEP}"));
    }

    Json(json!({ "accepted": true }))
}
