//! HTTP + WebSocket surface of the daemon.
//!
//! Routing, ingress validation, and fan-out live here; enrichment, the
//! ring, the topic registry, and voice are delegated to their modules.
//! Every response carries permissive CORS headers so local dashboards on
//! any dev-server origin can talk to the bus, and request bodies are
//! capped at the shared 1 MiB limit.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use beacon_protocol::{
    create_event, parse_envelope, Envelope, EventContext, Source, MAX_BODY_BYTES,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::pipeline::{enrich, EnrichDefaults, Enriched};
use crate::store::{EventStore, QueryFilter};
use crate::voice::{NotifyOutcome, Phase, VoiceService};

const DEFAULT_QUERY_LIMIT: i64 = 100;
const MAX_QUERY_LIMIT: i64 = 1000;
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared handles behind every route. Cheap to clone; the store is the
/// only mutex-guarded piece, and WebSocket fan-out never holds it.
#[derive(Clone)]
pub struct AppState {
    store: Arc<Mutex<EventStore>>,
    bus: Arc<EventBus>,
    voice: Arc<VoiceService>,
    ws_clients: Arc<AtomicUsize>,
    nonce: Arc<str>,
    started_at: Instant,
    defaults: EnrichDefaults,
}

impl AppState {
    pub fn new(
        store: EventStore,
        voice: VoiceService,
        nonce: String,
        defaults: EnrichDefaults,
    ) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            bus: Arc::new(EventBus::new()),
            voice: Arc::new(voice),
            ws_clients: Arc::new(AtomicUsize::new(0)),
            nonce: nonce.into(),
            started_at: Instant::now(),
            defaults,
        }
    }

    pub fn voice(&self) -> &VoiceService {
        &self.voice
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, EventStore> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store then publish. Publication happens outside the store's
    /// critical section so slow fan-out cannot back up ingress.
    fn accept(&self, envelope: Envelope) {
        self.lock_store().push(envelope.clone());
        self.bus.publish(&envelope);
        self.signal_voice(&envelope);
    }

    /// Lifecycle events that name an agent double as voice cues.
    fn signal_voice(&self, envelope: &Envelope) {
        let phase = match envelope.event_type.as_str() {
            "hook.session_start" | "hook.subagent_start" => Phase::Start,
            "hook.stop" | "hook.subagent_stop" => Phase::Stop,
            _ => return,
        };
        let agent = envelope
            .data
            .get("agentType")
            .or_else(|| envelope.data.get("agent_type"))
            .and_then(Value::as_str);
        if let Some(agent) = agent {
            // Fire and forget; rejections are the queue's business.
            let _ = self.voice.notify(agent, phase);
        }
    }
}

pub fn build_router(state: AppState, assets: Option<PathBuf>) -> Router {
    let router = Router::new()
        .route("/events/filter-options", get(filter_options))
        .route("/events/:name", post(ingest_hook))
        .route("/events", post(ingest_event).get(query_events))
        .route("/health", get(health))
        .route("/voice/notify", post(voice_notify))
        .route("/ws", get(ws_upgrade));

    let router = match assets {
        // Unmatched routes fall through to commodity asset serving.
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router.fallback(not_found),
    };

    router
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

/// POST `/events/:name` — hook ingress through the enrichment pipeline.
async fn ingest_hook(
    Path(name): Path<String>,
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let payload = match parse_object(&body) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    match enrich(&name, &payload, &state.defaults) {
        Enriched::Skipped { reason } => {
            debug!(name = %name, reason, "Hook ingress skipped");
            (
                StatusCode::OK,
                Json(json!({"status": "skipped", "reason": reason})),
            )
        }
        Enriched::Event(envelope) => {
            let id = envelope.id.clone();
            state.accept(envelope);
            (StatusCode::CREATED, Json(json!({"id": id})))
        }
    }
}

/// POST `/events` — programmatic ingress. Accepts a full envelope or a
/// partial `{type, data, ...}` that is wrapped with server defaults.
async fn ingest_event(State(state): State<AppState>, body: axum::body::Bytes) -> impl IntoResponse {
    let payload = match parse_object(&body) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    let envelope = if payload.contains_key("schemaVersion") {
        match parse_envelope(Value::Object(payload)) {
            Ok(envelope) => envelope,
            Err(err) => return bad_request(err.to_string()),
        }
    } else {
        match wrap_partial(&payload, &state.defaults) {
            Ok(envelope) => envelope,
            Err(message) => return bad_request(message),
        }
    };

    let id = envelope.id.clone();
    state.accept(envelope);
    (StatusCode::CREATED, Json(json!({"ok": true, "id": id})))
}

fn wrap_partial(payload: &Map<String, Value>, defaults: &EnrichDefaults) -> Result<Envelope, String> {
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| "type must be a non-empty string".to_string())?;

    let data = payload
        .get("data")
        .ok_or_else(|| "data is required".to_string())?
        .as_object()
        .ok_or_else(|| "data must be a JSON object".to_string())?
        .clone();

    let source = match payload.get("source") {
        None => Source::Cli,
        Some(value) => match value.as_str() {
            Some("cli") => Source::Cli,
            Some("hook") => Source::Hook,
            _ => return Err("source must be \"cli\" or \"hook\"".to_string()),
        },
    };

    let ctx = EventContext {
        app: string_or(payload, "app", &defaults.app),
        app_root: string_or(payload, "appRoot", &defaults.app_root),
        source,
        correlation_id: payload
            .get("correlationId")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    Ok(create_event(event_type, data, &ctx))
}

fn string_or(payload: &Map<String, Value>, key: &str, default: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(default)
        .to_string()
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>, (StatusCode, Json<Value>)> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| bad_request(format!("body is not valid JSON: {}", err)))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(bad_request("body must be a JSON object".to_string())),
    }
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(rename = "type")]
    event_type: Option<String>,
    since: Option<String>,
    limit: Option<i64>,
}

/// GET `/events` — chronological history slice.
async fn query_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let since = match query.since.as_deref() {
        None => None,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(_) => return bad_request("since must be an RFC3339 timestamp".to_string()),
        },
    };

    let filter = QueryFilter {
        event_type: query.event_type,
        since,
        limit: Some(query.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)),
    };

    let events = state.lock_store().query(&filter);
    (StatusCode::OK, Json(json!(events)))
}

/// GET `/events/filter-options` — distinct values for dashboard filters.
async fn filter_options(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.lock_store();
    Json(json!({
        "types": store.distinct_types(),
        "apps": store.distinct_apps(),
    }))
}

/// GET `/health`.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (total, types, persist_errors) = {
        let store = state.lock_store();
        (store.len(), store.type_counts(), store.persist_errors())
    };

    Json(json!({
        "status": "ok",
        "nonce": state.nonce.as_ref(),
        "uptime_s": state.started_at.elapsed().as_secs(),
        "events": {"total": total, "types": types},
        "persistErrors": persist_errors,
        "wsClients": state.ws_clients.load(Ordering::Relaxed),
        "version": env!("CARGO_PKG_VERSION"),
        "voice": {
            "mode": state.voice.mode(),
            "queueDepth": state.voice.depth(),
            "isPlaying": state.voice.is_playing(),
        },
    }))
}

// ---------------------------------------------------------------------------
// Voice
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct VoiceRequest {
    #[serde(rename = "agentType")]
    agent_type: String,
    phase: Phase,
}

/// POST `/voice/notify`.
async fn voice_notify(State(state): State<AppState>, body: axum::body::Bytes) -> impl IntoResponse {
    let request: VoiceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"queued": false, "reason": "invalid_body"})),
            )
        }
    };

    match state.voice.notify(&request.agent_type, request.phase) {
        NotifyOutcome::Queued { label, text } => (
            StatusCode::OK,
            Json(json!({"queued": true, "label": label, "text": text})),
        ),
        NotifyOutcome::Rejected { reason } => {
            (StatusCode::OK, Json(json!({"queued": false, "reason": reason})))
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "type")]
    event_type: Option<String>,
}

/// GET `/ws` — upgrade and attach to one topic.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.event_type))
}

async fn handle_socket(socket: WebSocket, state: AppState, event_type: Option<String>) {
    let count = state.ws_clients.fetch_add(1, Ordering::Relaxed) + 1;
    info!(active = count, filter = ?event_type, "WebSocket subscriber attached");

    let (mut sender, mut receiver) = socket.split();
    let mut events = state.bus.subscribe(event_type.as_deref());

    let mut send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(envelope) => {
                            let frame = match serde_json::to_string(&envelope) {
                                Ok(frame) => frame,
                                Err(err) => {
                                    warn!(error = %err, "Failed to serialize envelope for WS");
                                    continue;
                                }
                            };
                            if sender.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        // Slow subscribers drop frames on their own channel;
                        // publication to everyone else is unaffected.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(missed, "WebSocket subscriber lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let count = state.ws_clients.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(active = count, "WebSocket subscriber detached");
}
