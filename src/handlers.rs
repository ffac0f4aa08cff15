use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json, Response,
    },
};
use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::assembly::assemble;
use crate::error::TransferError;
use crate::events::progress_snapshot;
use crate::files;
use crate::ingest::ingest_chunk;
use crate::models::{
    AssembleResponse, ChunkUploadResponse, CleanupResponse, FileInfo, FileListResponse,
    NewSession, NewSessionResponse, RoomState, ShareQuery, StatusResponse,
};
use crate::room::RoomService;
use crate::session::{cleanup_session, create_session, session_status};
use crate::state::AppState;

type BoxedEvents = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;
type EventStream = Sse<BoxedEvents>;

// health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "aetherdrop",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

// create an upload session
pub async fn init_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewSession>,
) -> Result<(StatusCode, Json<NewSessionResponse>), TransferError> {
    tracing::debug!("Initializing upload {} for file {}", payload.upload_id, payload.filename);
    let descriptor = create_session(&state, payload).await?;

    Ok((
        StatusCode::CREATED,
        Json(NewSessionResponse {
            upload_id: descriptor.upload_id,
            share_id: descriptor.share_id,
        }),
    ))
}

// store one chunk, raw bytes in the body
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path((upload_id, index)): Path<(String, usize)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkUploadResponse>, TransferError> {
    tracing::trace!("Received chunk {} for upload {} ({} bytes)", index, upload_id, body.len());

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let outcome = ingest_chunk(&state, &upload_id, index, &body, content_length).await?;
    Ok(Json(outcome))
}

// received chunk indices for an upload
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<Json<StatusResponse>, TransferError> {
    Ok(Json(session_status(&state, &upload_id).await?))
}

// assemble all chunks into the final file
pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<Json<AssembleResponse>, TransferError> {
    tracing::debug!("Completing upload: {}", upload_id);
    Ok(Json(assemble(&state, &upload_id).await?))
}

// delete an unfinished upload
pub async fn cleanup_upload(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<Json<CleanupResponse>, TransferError> {
    tracing::debug!("Request to clean up upload: {}", upload_id);
    Ok(Json(cleanup_session(&state, &upload_id).await?))
}

// live progress for one upload
pub async fn progress_events(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<EventStream, TransferError> {
    // subscribe before snapshotting so nothing between the two is lost
    let subscription = state.progress.subscribe(&upload_id);
    let initial = progress_snapshot(&state, &upload_id).await?;
    tracing::debug!("📡 Progress stream opened for {}", upload_id);

    Ok(event_stream(&state, sse_event(&initial), subscription.into_stream()))
}

// current state of a room
pub async fn room_state(
    State(state): State<Arc<AppState>>,
    Path(share_id): Path<String>,
) -> Result<Json<RoomState>, TransferError> {
    let room = state.rooms.state(&state.store, &state.tracker, &share_id).await?;
    Ok(Json(room))
}

// live events for a room
pub async fn room_events(
    State(state): State<Arc<AppState>>,
    Path(share_id): Path<String>,
) -> Result<EventStream, TransferError> {
    let subscription = state.rooms.subscribe(&share_id);
    let room = state.rooms.state(&state.store, &state.tracker, &share_id).await?;
    tracing::debug!("📡 Room stream opened for {}", share_id);

    let initial = sse_event(&RoomService::room_state_event(&room));
    Ok(event_stream(&state, initial, subscription.into_stream()))
}

// list uploads of a share
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ShareQuery>,
) -> Result<Json<FileListResponse>, TransferError> {
    Ok(Json(files::list_files(&state, query.share_id.as_deref()).await?))
}

// info for a single upload
pub async fn file_info(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
    Query(query): Query<ShareQuery>,
) -> Result<Json<FileInfo>, TransferError> {
    Ok(Json(
        files::file_info(&state, &upload_id, query.share_id.as_deref()).await?,
    ))
}

// serve an assembled file to a share holder
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((upload_id, filename)): Path<(String, String)>,
    Query(query): Query<ShareQuery>,
    request: Request,
) -> Result<Response, TransferError> {
    let path =
        files::resolve_download(&state, &upload_id, &filename, query.share_id.as_deref()).await?;
    tracing::debug!("Serving {:?}", path);

    let response = ServeFile::new(path)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    Ok(response.map(Body::new))
}

fn sse_event<T: Serialize>(value: &T) -> Event {
    Event::default().json_data(value).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize event: {}", e);
        Event::default().comment("serialization failed")
    })
}

// first event, then whatever the hub delivers, with heartbeats in between
fn event_stream(
    state: &AppState,
    initial: Event,
    messages: impl Stream<Item = crate::hub::Message> + Send + 'static,
) -> EventStream {
    let stream = stream::once(async move { initial })
        .chain(messages.map(|msg| Event::default().data(msg)))
        .map(Ok::<_, Infallible>);
    let stream: BoxedEvents = Box::pin(stream);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.heartbeat_interval)
            .text("keepalive"),
    )
}
