use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::{debug, error, Level};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ReservationPatch, RoomUpdate};
use crate::model::*;
use crate::notify::{Snapshot, Topic};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let rooms = Router::new()
        .route("/", get(list_rooms).post(create_room))
        .route("/:id", get(show_room).put(update_room).delete(delete_room));

    let reservations = Router::new()
        .route("/", get(list_reservations).post(create_reservation))
        .route(
            "/:id",
            get(show_reservation)
                .put(update_reservation)
                .delete(delete_reservation),
        )
        .route("/active/:room_id", get(show_active_reservation))
        .route("/deactivate/:room_id", put(deactivate_room_reservations));

    let events = Router::new()
        .route("/rooms", get(room_events))
        .route("/reservations", get(reservation_events));

    Router::new()
        .route("/health", get(health))
        .nest("/rooms", rooms)
        .nest("/reservations", reservations)
        .nest("/events", events)
        .route_layer(middleware::from_fn(track_metrics))
        .fallback(route_not_found)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        )
        .with_state(AppState { engine })
}

// ── Errors ───────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => match e {
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Validation(_) | EngineError::LimitExceeded(_) => {
                    StatusCode::BAD_REQUEST
                }
                EngineError::Overlap(_)
                | EngineError::DuplicateName(_)
                | EngineError::Inactive(_)
                | EngineError::InProgress(_) => StatusCode::CONFLICT,
                EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        let message = match &self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Engine(e) => e.to_string(),
        };
        if status.is_server_error() {
            error!("request failed: {message}");
            return (status, Json(json!({ "error": message }))).into_response();
        }
        (status, Json(json!({ "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_id(raw: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(raw).map_err(|_| ApiError::BadRequest(format!("invalid id: {raw}")))
}

// ── Wire types ───────────────────────────────────────────

/// Reservation as clients see it: RFC 3339 instants instead of millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationView {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: ReservationStatus,
}

impl From<Reservation> for ReservationView {
    fn from(r: Reservation) -> Self {
        Self {
            id: r.id,
            room_id: r.room_id,
            user: r.user,
            start: to_datetime(r.span.start),
            end: to_datetime(r.span.end),
            status: r.status,
        }
    }
}

fn to_datetime(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    pub capacity: u32,
    #[serde(default = "default_room_status")]
    pub status: RoomStatus,
}

fn default_room_status() -> RoomStatus {
    RoomStatus::Available
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoomRequest {
    pub name: String,
    pub capacity: u32,
    pub status: Option<RoomStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReservationRequest {
    pub room_id: Ulid,
    pub user: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReservationRequest {
    pub room_id: Option<Ulid>,
    pub user: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub status: Option<ReservationStatus>,
}

impl From<UpdateReservationRequest> for ReservationPatch {
    fn from(req: UpdateReservationRequest) -> Self {
        Self {
            room_id: req.room_id,
            user: req.user,
            start: req.start.map(|t| t.timestamp_millis()),
            end: req.end.map(|t| t.timestamp_millis()),
            status: req.status,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeactivatedResponse {
    pub deactivated: usize,
}

// ── Handlers ─────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn route_not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "route not found" })))
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<Room>> {
    Json(state.engine.list_rooms())
}

async fn show_room(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Room> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.get_room(&id)?))
}

async fn create_room(
    State(state): State<AppState>,
    payload: Result<Json<CreateRoomRequest>, JsonRejection>,
) -> ApiResult<Room> {
    let Json(req) = payload?;
    let room = state
        .engine
        .create_room(&req.name, req.capacity, req.status)
        .await?;
    Ok(Json(room))
}

async fn update_room(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateRoomRequest>, JsonRejection>,
) -> ApiResult<Room> {
    let id = parse_id(&id)?;
    let Json(req) = payload?;
    let update = RoomUpdate {
        name: req.name,
        capacity: req.capacity,
        status: req.status,
    };
    Ok(Json(state.engine.update_room(id, update).await?))
}

async fn delete_room(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Room> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.delete_room(id).await?))
}

async fn list_reservations(State(state): State<AppState>) -> Json<Vec<ReservationView>> {
    Json(
        state
            .engine
            .list_reservations()
            .into_iter()
            .map(ReservationView::from)
            .collect(),
    )
}

async fn show_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ReservationView> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.get_reservation(&id)?.into()))
}

async fn create_reservation(
    State(state): State<AppState>,
    payload: Result<Json<CreateReservationRequest>, JsonRejection>,
) -> ApiResult<ReservationView> {
    let Json(req) = payload?;
    let span = Span::new(req.start.timestamp_millis(), req.end.timestamp_millis());
    let reservation = state
        .engine
        .create_reservation(req.room_id, &req.user, span)
        .await?;
    Ok(Json(reservation.into()))
}

async fn update_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateReservationRequest>, JsonRejection>,
) -> ApiResult<ReservationView> {
    let id = parse_id(&id)?;
    let Json(req) = payload?;
    let reservation = state.engine.update_reservation(id, req.into()).await?;
    Ok(Json(reservation.into()))
}

async fn delete_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ReservationView> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.delete_reservation(id).await?.into()))
}

async fn show_active_reservation(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> ApiResult<ReservationView> {
    let room_id = parse_id(&room_id)?;
    Ok(Json(state.engine.active_reservation(&room_id)?.into()))
}

async fn deactivate_room_reservations(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> ApiResult<DeactivatedResponse> {
    let room_id = parse_id(&room_id)?;
    let deactivated = state.engine.deactivate_room_reservations(room_id).await?;
    Ok(Json(DeactivatedResponse { deactivated }))
}

// ── Push streams ─────────────────────────────────────────

async fn room_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    Sse::new(snapshot_stream(&state.engine, Topic::Rooms)).keep_alive(KeepAlive::default())
}

async fn reservation_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    Sse::new(snapshot_stream(&state.engine, Topic::Reservations))
        .keep_alive(KeepAlive::default())
}

struct SubscriberGauge(Topic);

impl SubscriberGauge {
    fn new(topic: Topic) -> Self {
        metrics::gauge!(crate::observability::SUBSCRIBERS_ACTIVE, "topic" => topic.event_name())
            .increment(1.0);
        Self(topic)
    }
}

impl Drop for SubscriberGauge {
    fn drop(&mut self) {
        metrics::gauge!(crate::observability::SUBSCRIBERS_ACTIVE, "topic" => self.0.event_name())
            .decrement(1.0);
    }
}

/// Full snapshot on connect, then every published snapshot. Subscribes
/// before reading the initial state so no write can fall between the two.
fn snapshot_stream(
    engine: &Engine,
    topic: Topic,
) -> impl Stream<Item = Result<SseEvent, Infallible>> + use<> {
    let rx = engine.notify.subscribe(topic);
    let initial = sse_event(&engine.snapshot(topic));
    let gauge = SubscriberGauge::new(topic);

    let updates = stream::unfold((rx, gauge), |(mut rx, gauge)| async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => return Some((Ok(sse_event(&snapshot)), (rx, gauge))),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, topic = gauge.0.event_name(), "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    stream::once(async move { Ok(initial) }).chain(updates)
}

fn sse_event(snapshot: &Snapshot) -> SseEvent {
    let event = SseEvent::default().event(snapshot.topic().event_name());
    let data = match snapshot {
        Snapshot::Rooms(rooms) => serde_json::to_string(rooms.as_slice()),
        Snapshot::Reservations(all) => serde_json::to_string(
            &all.iter()
                .cloned()
                .map(ReservationView::from)
                .collect::<Vec<_>>(),
        ),
    };
    match data {
        Ok(data) => event.data(data),
        Err(e) => {
            error!("failed to encode snapshot: {e}");
            event.comment("encode error")
        }
    }
}

// ── Metrics middleware ───────────────────────────────────

async fn track_metrics(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        crate::observability::HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        crate::observability::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method,
        "route" => route
    )
    .record(started.elapsed().as_secs_f64());
    response
}
