// --- HTTP API ----------------------------------------------------------------
//
// The dashboard talks to the engine through these JSON endpoints:
//   GET  /api/v1/media/:owner                  list an owner's uploads
//   POST /api/v1/media/:owner?kind=&filename=  upload (raw request body)
//   POST /api/v1/stream/start                  start the owner's stream
//   POST /api/v1/stream/stop                   stop it
//   GET  /api/v1/stream/:owner                 running session + last exit
//   GET  /api/v1/stream/:owner/events          poll lifecycle events
//   GET  /api/v1/stream/:owner/events/ws       same events, pushed

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::System;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, warn};

use crate::catalog::MediaCatalog;
use crate::command::{CommandBuilder, EncodingProfile};
use crate::destination::{self, Destination, DestinationPreset};
use crate::error::StreamError;
use crate::events::{EventSink, LifecycleEvent};
use crate::media::{self, MediaDescriptor, MediaId, MediaKind, OwnerId, StreamMode};
use crate::registry::{ExitSummary, SessionId, SessionRegistry, SessionSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub catalog: MediaCatalog,
    pub builder: Arc<CommandBuilder>,
    pub registry: SessionRegistry,
    pub events: EventSink,
    pub sys: Arc<tokio::sync::Mutex<System>>,
    pub max_upload_bytes: usize,
}

pub struct ApiError(StreamError);

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(StreamError::Catalog(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_validation_error() => StatusCode::BAD_REQUEST,
            StreamError::SessionAlreadyActive(_) => StatusCode::CONFLICT,
            StreamError::NoActiveSession(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("request failed: {}", self.0);
        }
        let body = Json(json!({ "error": self.0.to_string(), "kind": self.0.kind() }));
        (status, body).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    let uploads = ServeDir::new(state.catalog.upload_dir());
    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes);

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/system/info", get(system_info))
        .route("/api/v1/destinations/presets", get(api_destination_presets))
        .route(
            "/api/v1/media/:owner",
            get(api_media_list).post(api_media_upload).layer(upload_limit),
        )
        .route("/api/v1/stream/start", post(api_stream_start))
        .route("/api/v1/stream/stop", post(api_stream_stop))
        .route("/api/v1/stream/:owner", get(api_stream_status))
        .route("/api/v1/stream/:owner/events", get(api_stream_events))
        .route("/api/v1/stream/:owner/events/ws", get(api_stream_events_ws))
        .nest_service("/uploads", uploads)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "version": state.version,
        "features": ["media", "stream", "events"]
    }))
}

#[derive(Serialize)]
struct SystemInfo {
    name: String,
    version: String,
    arch: String,
    cpu_model: String,
    cpu_cores: usize,
    load_1m: f32,
    load_5m: f32,
    load_15m: f32,
    hostname: Option<String>,
    active_sessions: usize,
    encoding: EncodingProfile,
}

async fn system_info(State(st): State<AppState>) -> Json<SystemInfo> {
    let active_sessions = st.registry.active_count().await;

    let mut sys = st.sys.lock().await;
    sys.refresh_all();
    let cpu_model = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| "Unknown CPU".to_string());
    let cpu_cores = sys.cpus().len();
    let la = System::load_average();

    Json(SystemInfo {
        name: "CloudStream Engine".to_string(),
        version: st.version.clone(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_model,
        cpu_cores,
        load_1m: la.one as f32,
        load_5m: la.five as f32,
        load_15m: la.fifteen as f32,
        hostname: System::host_name(),
        active_sessions,
        encoding: st.builder.profile().clone(),
    })
}

async fn api_destination_presets() -> Json<Vec<DestinationPreset>> {
    Json(destination::presets())
}

/// Media as the dashboard sees it: no server paths, a fetchable URL instead.
#[derive(Serialize)]
struct MediaView {
    id: MediaId,
    owner: OwnerId,
    kind: MediaKind,
    filename: String,
    size: u64,
    url: String,
}

impl From<MediaDescriptor> for MediaView {
    fn from(m: MediaDescriptor) -> Self {
        let stored = m
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            url: format!("/uploads/{}/{}", m.owner, stored),
            id: m.id,
            owner: m.owner,
            kind: m.kind,
            filename: m.filename,
            size: m.size,
        }
    }
}

async fn api_media_list(
    State(state): State<AppState>,
    Path(owner): Path<OwnerId>,
) -> Result<Json<Vec<MediaView>>, ApiError> {
    let media = state.catalog.list_media(owner).await?;
    Ok(Json(media.into_iter().map(MediaView::from).collect()))
}

#[derive(Deserialize)]
struct UploadParams {
    kind: String,
    filename: String,
}

async fn api_media_upload(
    State(state): State<AppState>,
    Path(owner): Path<OwnerId>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<MediaView>), ApiError> {
    let kind = MediaKind::parse(&params.kind).ok_or_else(|| {
        StreamError::InvalidUpload(format!("unknown media kind '{}'", params.kind))
    })?;
    let stored = state
        .catalog
        .store_media(owner, kind, &params.filename, body)
        .await?;
    Ok((StatusCode::CREATED, Json(stored.into())))
}

fn default_loop() -> bool {
    true
}

#[derive(Deserialize)]
struct StartRequest {
    owner_id: OwnerId,
    destination_base_url: String,
    destination_key: String,
    mode: StreamMode,
    #[serde(default)]
    selected_media_ids: Vec<MediaId>,
    #[serde(rename = "loop", default = "default_loop")]
    looped: bool,
}

#[derive(Serialize)]
struct StartResponse {
    session_id: SessionId,
}

async fn api_stream_start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let owner = req.owner_id;
    let destination = Destination::new(&req.destination_base_url, &req.destination_key)?;
    let selections = state.catalog.lookup(owner, &req.selected_media_ids).await?;
    let composition = media::resolve(req.mode, &selections)?;
    let invocation = state
        .builder
        .build(owner, &composition, &destination, req.looped)?;
    let session_id = state.registry.start(owner, invocation).await?;
    Ok(Json(StartResponse { session_id }))
}

#[derive(Deserialize)]
struct StopRequest {
    owner_id: OwnerId,
}

async fn api_stream_stop(
    State(state): State<AppState>,
    Json(req): Json<StopRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = state.registry.stop(req.owner_id).await?;
    Ok(Json(json!({ "ok": true, "session_id": session_id })))
}

#[derive(Serialize)]
struct StatusResponse {
    session: Option<SessionSnapshot>,
    last_exit: Option<ExitSummary>,
}

async fn api_stream_status(
    State(state): State<AppState>,
    Path(owner): Path<OwnerId>,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        session: state.registry.status(owner).await,
        last_exit: state.registry.last_exit(owner).await,
    })
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
    /// Only events with a larger sequence number.
    after: Option<u64>,
}

impl EventsQuery {
    fn limit(&self, capacity: usize) -> usize {
        self.limit.unwrap_or(capacity).min(capacity)
    }
}

async fn api_stream_events(
    State(state): State<AppState>,
    Path(owner): Path<OwnerId>,
    Query(q): Query<EventsQuery>,
) -> Json<Vec<LifecycleEvent>> {
    let limit = q.limit(state.events.capacity());
    let events = match q.after {
        Some(after) => state.events.tail_after(owner, after, limit),
        None => state.events.tail(owner, limit),
    };
    Json(events)
}

async fn api_stream_events_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(owner): Path<OwnerId>,
    Query(q): Query<EventsQuery>,
) -> Response {
    let limit = q.limit(state.events.capacity());
    let after = q.after.unwrap_or(0);
    ws.on_upgrade(move |socket| push_events(socket, state.events, owner, after, limit))
}

async fn push_events(mut socket: WebSocket, events: EventSink, owner: OwnerId, after: u64, limit: usize) {
    // Subscribe before replaying so nothing falls between the two.
    let mut live = events.subscribe();
    let mut last_seq = after;

    for event in events.tail_after(owner, after, limit) {
        last_seq = event.seq;
        if send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            received = live.recv() => match received {
                Ok(event) => {
                    if event.owner != owner || event.seq <= last_seq {
                        continue;
                    }
                    last_seq = event.seq;
                    if send_event(&mut socket, &event).await.is_err() {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(%owner, skipped, "event push lagged");
                }
                Err(RecvError::Closed) => return,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &LifecycleEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{ProcessSupervisor, SupervisorSettings};
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        _dir: TempDir,
        router: Router,
        registry: SessionRegistry,
    }

    // A stand-in transcoder: accepts any arguments and runs until stopped.
    fn fake_transcoder(dir: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let catalog = MediaCatalog::new(dir.path().join("db.sqlite"), dir.path().join("uploads"));
        catalog.init().await.unwrap();
        let events = EventSink::new(100);
        let supervisor = ProcessSupervisor::new(SupervisorSettings::default(), events.clone());
        let registry = SessionRegistry::new(supervisor, events.clone());
        let builder = CommandBuilder::new(
            fake_transcoder(dir.path()),
            dir.path().join("run"),
            EncodingProfile::default(),
        );
        let state = AppState {
            version: "test".into(),
            catalog,
            builder: Arc::new(builder),
            registry: registry.clone(),
            events,
            sys: Arc::new(tokio::sync::Mutex::new(System::new())),
            max_upload_bytes: 1024 * 1024,
        };
        TestApp {
            _dir: dir,
            router: build_router(state),
            registry,
        }
    }

    async fn call(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn upload(router: &Router, owner: i64, kind: &str, filename: &str) -> i64 {
        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/media/{owner}?kind={kind}&filename={filename}"))
            .body(Body::from("fake media bytes"))
            .unwrap();
        let (status, body) = call(router, req).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_i64().unwrap()
    }

    fn start_body(owner: i64, ids: &[i64]) -> serde_json::Value {
        json!({
            "owner_id": owner,
            "destination_base_url": "rtmp://live.twitch.tv/app/",
            "destination_key": "live_123_secret",
            "mode": "VIDEO",
            "selected_media_ids": ids,
            "loop": true,
        })
    }

    #[tokio::test]
    async fn upload_then_list() {
        let t = app().await;
        let id = upload(&t.router, 1, "video", "clip.mp4").await;
        let (status, body) = call(&t.router, get("/api/v1/media/1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], id);
        assert_eq!(body[0]["kind"], "video");
        assert!(body[0]["url"].as_str().unwrap().starts_with("/uploads/1/"));
        assert!(body[0].get("path").is_none());
    }

    #[tokio::test]
    async fn upload_with_unknown_kind_is_rejected() {
        let t = app().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/media/1?kind=gif&filename=a.gif")
            .body(Body::from("x"))
            .unwrap();
        let (status, body) = call(&t.router, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_upload");
    }

    #[tokio::test]
    async fn start_without_selection_is_incomplete() {
        let t = app().await;
        let (status, body) = call(&t.router, post_json("/api/v1/stream/start", start_body(1, &[]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "incomplete_selection");
    }

    #[tokio::test]
    async fn start_with_bad_destination_is_rejected() {
        let t = app().await;
        let id = upload(&t.router, 1, "video", "clip.mp4").await;
        let mut req = start_body(1, &[id]);
        req["destination_base_url"] = json!("http://example.com/live");
        let (status, body) = call(&t.router, post_json("/api/v1/stream/start", req)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "destination_invalid");
        assert!(t.registry.status(OwnerId(1)).await.is_none());
    }

    #[tokio::test]
    async fn start_with_someone_elses_media_is_rejected() {
        let t = app().await;
        let theirs = upload(&t.router, 2, "video", "clip.mp4").await;
        let (status, body) = call(&t.router, post_json("/api/v1/stream/start", start_body(1, &[theirs]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_composition");
    }

    #[tokio::test]
    async fn full_session_lifecycle() {
        let t = app().await;
        let id = upload(&t.router, 1, "video", "clip.mp4").await;

        let (status, body) = call(&t.router, post_json("/api/v1/stream/start", start_body(1, &[id]))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let (status, body) = call(&t.router, post_json("/api/v1/stream/start", start_body(1, &[id]))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "session_already_active");

        let (_, body) = call(&t.router, get("/api/v1/stream/1")).await;
        assert_eq!(body["session"]["session_id"], session_id.as_str());
        assert_eq!(body["session"]["state"], "running");
        assert_eq!(body["session"]["stream"]["target"], "rtmp://live.twitch.tv/app/****");

        let (_, events) = call(&t.router, get("/api/v1/stream/1/events?limit=10")).await;
        let started = &events[0];
        assert_eq!(started["kind"], "started");
        assert!(!started["message"].as_str().unwrap().contains("live_123_secret"));

        let (status, _) = call(&t.router, post_json("/api/v1/stream/stop", json!({ "owner_id": 1 }))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&t.router, post_json("/api/v1/stream/stop", json!({ "owner_id": 1 }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "no_active_session");

        let (_, body) = call(&t.router, get("/api/v1/stream/1")).await;
        assert!(body["session"].is_null());
        assert_eq!(body["last_exit"]["state"], "stopped");
    }

    #[tokio::test]
    async fn events_after_cursor() {
        let t = app().await;
        let (_, body) = call(&t.router, get("/api/v1/stream/5/events")).await;
        assert_eq!(body, json!([]));

        let id = upload(&t.router, 5, "video", "clip.mp4").await;
        call(&t.router, post_json("/api/v1/stream/start", start_body(5, &[id]))).await;
        call(&t.router, post_json("/api/v1/stream/stop", json!({ "owner_id": 5 }))).await;

        let (_, all) = call(&t.router, get("/api/v1/stream/5/events")).await;
        let first = all[0]["seq"].as_u64().unwrap();
        let (_, newer) = call(&t.router, get(&format!("/api/v1/stream/5/events?after={first}"))).await;
        assert!(newer.as_array().unwrap().iter().all(|e| e["seq"].as_u64().unwrap() > first));
        assert_eq!(newer[0]["kind"], "stopped");
    }

    #[tokio::test]
    async fn presets_and_health() {
        let t = app().await;
        let (status, body) = call(&t.router, get("/api/v1/destinations/presets")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "YouTube");

        let resp = t.router.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
