//! HTTP + WebSocket facade over the engine.
//!
//! Thin request/response glue: auth, validation errors, and the event
//! stream with late-join catch-up. CORS is fully permissive; this is a
//! development-mode posture.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::auth::IdentityVerifier;
use crate::dispatcher::Engine;
use crate::messages::{rfc3339_nanos, ErrorBody, ErrorCode, Event, ExecuteRequest, RunStateResponse};
use crate::runs::{Run, RunEntry};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub verifier: Arc<IdentityVerifier>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/execute", post(execute))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/v1/runs/:run_id/cancel", post(cancel_run))
        .route("/v1/runs/:run_id/events", get(run_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

impl HttpError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: ErrorCode::Unauthorized,
            message: "Unauthorized".to_string(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: ErrorCode::InvalidRequest,
            message: "run not found".to_string(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody::new(self.code, self.message));
        (self.status, body).into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), HttpError> {
    let token = bearer_token(headers).ok_or_else(HttpError::unauthorized)?;
    state
        .verifier
        .verify(token)
        .await
        .map_err(|_| HttpError::unauthorized())?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<impl IntoResponse, HttpError> {
    authorize(&state, &headers).await?;
    let Json(req) = body.map_err(|_| HttpError::bad_request("Invalid JSON"))?;
    let resp = state
        .engine
        .submit(req)
        .map_err(|err| HttpError::bad_request(err.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(resp)))
}

async fn get_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<RunStateResponse>, HttpError> {
    authorize(&state, &headers).await?;
    let entry = state.engine.get(&run_id).ok_or_else(HttpError::not_found)?;
    let snap = entry.snapshot();
    Ok(Json(RunStateResponse::from(&snap)))
}

async fn cancel_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    authorize(&state, &headers).await?;
    match state.engine.cancel(&run_id) {
        None => Err(HttpError::not_found()),
        Some(false) => Err(HttpError::conflict("run is not cancelable")),
        Some(true) => Ok((StatusCode::ACCEPTED, Json(json!({"ok": true})))),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    token: String,
}

async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, HttpError> {
    // Auth and lookup come before the upgrade so bad requests get real
    // status codes instead of a 426.
    state
        .verifier
        .verify(&query.token)
        .await
        .map_err(|_| HttpError::unauthorized())?;
    let entry = state.engine.get(&run_id).ok_or_else(HttpError::not_found)?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws.on_upgrade(move |socket| stream_run_events(socket, entry)))
}

/// Replay a minimal catch-up from the snapshot, then forward live events
/// until the socket closes or the run's bus is done with us.
async fn stream_run_events(socket: WebSocket, entry: Arc<RunEntry>) {
    let (mut sink, source) = socket.split();

    let snap = entry.snapshot();
    let (catchup, terminal) = catchup_events(&snap);
    for event in &catchup {
        if send_event(&mut sink, event).await.is_err() {
            return;
        }
    }
    if terminal {
        let _ = sink.close().await;
        return;
    }

    let stream_token = CancellationToken::new();
    let mut rx = entry.subscribe(stream_token.clone());
    let drain = tokio::spawn(drain_client(source, stream_token.clone()));

    while let Some(event) = rx.recv().await {
        if send_event(&mut sink, &event).await.is_err() {
            debug!(run_id = %entry.id(), "event stream write failed");
            break;
        }
    }

    stream_token.cancel();
    drain.abort();
    let _ = sink.close().await;
}

/// Late-join replay: what a fresh subscriber sees before live events.
/// The second return value is true when the run is already terminal and
/// the stream should close after the replay.
pub fn catchup_events(snap: &Run) -> (Vec<Event>, bool) {
    let mut events = Vec::new();

    if let Some(started_at) = snap.started_at {
        events.push(Event::started(&snap.id, rfc3339_nanos(started_at)));
        if let Some(stats) = snap.stats_event() {
            events.push(stats);
        }
    }
    if !snap.stdout.is_empty() {
        events.push(Event::stdout(
            &snap.id,
            String::from_utf8_lossy(&snap.stdout).into_owned(),
        ));
    }
    if !snap.stderr.is_empty() {
        events.push(Event::stderr(
            &snap.id,
            String::from_utf8_lossy(&snap.stderr).into_owned(),
        ));
    }

    if let Some(finished_at) = snap.finished_at {
        if let (Some(code), Some(message)) = (snap.error_code, snap.error_message.as_deref()) {
            events.push(Event::error(&snap.id, code, message));
        }
        events.push(Event::finished(
            &snap.id,
            snap.exit_code.unwrap_or(-1),
            rfc3339_nanos(finished_at),
        ));
        return (events, true);
    }
    (events, false)
}

/// Consume the client side of the socket so a close tears the
/// subscription down promptly.
async fn drain_client(mut source: SplitStream<WebSocket>, token: CancellationToken) {
    while let Some(msg) = source.next().await {
        if msg.is_err() {
            break;
        }
    }
    token.cancel();
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &Event,
) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(_) => return Ok(()),
    };
    sink.send(Message::Text(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::EventKind;
    use crate::runs::{RunRegistry, RunStatus};
    use chrono::Utc;

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(header::AUTHORIZATION, "bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn catchup_for_a_queued_run_is_empty() {
        let registry = RunRegistry::new();
        let entry = registry.create();
        let (events, terminal) = catchup_events(&entry.snapshot());
        assert!(events.is_empty());
        assert!(!terminal);
    }

    #[test]
    fn catchup_for_a_finished_run_replays_and_closes() {
        let registry = RunRegistry::new();
        let entry = registry.create();
        entry.update(|r| {
            r.status = RunStatus::Finished;
            r.exit_code = Some(0);
            r.started_at = Some(Utc::now());
            r.finished_at = Some(Utc::now());
        });
        entry.append_stdout(b"hi\n");

        let (events, terminal) = catchup_events(&entry.snapshot());
        assert!(terminal);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Started,
                EventKind::Stats,
                EventKind::Stdout,
                EventKind::Finished
            ]
        );
        assert_eq!(events[2].data.as_deref(), Some("hi\n"));
        assert_eq!(events[3].exit_code, Some(0));
    }

    #[test]
    fn catchup_for_a_prep_failure_has_no_started_event() {
        let registry = RunRegistry::new();
        let entry = registry.create();
        entry.update(|r| {
            r.status = RunStatus::Failed;
            r.exit_code = Some(-1);
            r.error_code = Some(ErrorCode::Docker);
            r.error_message = Some("docker daemon not reachable".to_string());
            r.finished_at = Some(Utc::now());
        });

        let (events, terminal) = catchup_events(&entry.snapshot());
        assert!(terminal);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Error, EventKind::Finished]);
        assert_eq!(events[0].code, Some(ErrorCode::Docker));
        assert_eq!(events[1].exit_code, Some(-1));
    }
}
