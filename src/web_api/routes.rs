//! REST API routes.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::alerts::AlertFilter;
use crate::camera_registry::RegisterCameraRequest;
use crate::error::{Error, Result};
use crate::ingest::{parse_timestamp, IngestFrame, SubmitOutcome};
use crate::matcher::MovementFilter;
use crate::models::{now_ms, RiskLevel};
use crate::state::AppState;
use crate::zones::ZoneRequest;

use super::stream_routes::{snapshot as camera_snapshot, stream_video};
use super::ws_routes::{ws_alerts, ws_dashboard, ws_frames};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Cameras
        .route("/cameras/register", post(register_camera))
        .route("/cameras", get(list_cameras))
        .route("/cameras/:id", get(get_camera))
        // Frames
        .route("/frames/upload", post(upload_frame))
        // Analytics
        .route("/analytics/:camera_id/realtime", get(realtime_analytics))
        .route("/analytics/:camera_id/history", get(history_analytics))
        .route("/analytics/:camera_id/heatmap", get(heatmap))
        .route("/analytics/:camera_id/entry-exit", get(entry_exit))
        // Zones
        .route("/zones", post(create_zone))
        .route(
            "/zones/:id",
            get(get_zones).put(update_zone).delete(delete_zone),
        )
        // Alerts
        .route("/alerts/active", get(active_alerts))
        .route("/alerts/:id/acknowledge", post(acknowledge_alert))
        // Cross-camera movements
        .route("/movements", get(list_movements))
        .route("/movements/statistics", get(movement_statistics))
        .route("/movements/camera/:id", get(movements_for_camera))
        .route("/movements/pair/:a/:b", get(movements_for_pair));

    Router::new()
        .route("/health", get(super::health_check))
        .nest("/api/v1", api)
        .route("/stream/:camera_id", get(stream_video))
        .route("/cameras/:camera_id/snapshot", get(camera_snapshot))
        .route("/ws/frames", get(ws_frames))
        .route("/ws/dashboard/:camera_id", get(ws_dashboard))
        .route("/ws/alerts", get(ws_alerts))
        .with_state(state)
}

// ========================================
// Camera Handlers
// ========================================

async fn register_camera(
    State(state): State<AppState>,
    Json(req): Json<RegisterCameraRequest>,
) -> Result<impl IntoResponse> {
    let existed = state.cameras.get(&req.camera_id).await.is_some();
    let camera = state.cameras.register(req).await?;

    // A re-registering edge node means a restarted capture loop: start its
    // pipeline from clean tracker state.
    if existed {
        state.coordinator.reset_camera(&camera.camera_id).await;
    }

    Ok(Json(camera))
}

#[derive(Debug, Deserialize)]
struct ListCamerasParams {
    status: Option<String>,
}

async fn list_cameras(
    State(state): State<AppState>,
    Query(params): Query<ListCamerasParams>,
) -> impl IntoResponse {
    let cameras = state.cameras.list(params.status.as_deref()).await;
    Json(json!({ "total": cameras.len(), "cameras": cameras }))
}

async fn get_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let camera = state.cameras.require(&id).await?;
    Ok(Json(camera))
}

// ========================================
// Frame Upload
// ========================================

async fn upload_frame(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let started = std::time::Instant::now();

    let mut camera_id: Option<String> = None;
    let mut frame_bytes: Option<Vec<u8>> = None;
    let mut timestamp: Option<String> = None;
    let mut frame_id: Option<u64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "camera_id" => {
                camera_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| Error::BadRequest(e.to_string()))?,
                )
            }
            "frame" => {
                frame_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| Error::BadRequest(e.to_string()))?
                        .to_vec(),
                )
            }
            "timestamp" => {
                timestamp = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| Error::BadRequest(e.to_string()))?,
                )
            }
            "frame_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::BadRequest(e.to_string()))?;
                frame_id = Some(
                    text.parse()
                        .map_err(|_| Error::Validation("frame_id must be an integer".into()))?,
                );
            }
            _ => {}
        }
    }

    let camera_id =
        camera_id.ok_or_else(|| Error::Validation("camera_id field is required".into()))?;
    let frame_bytes =
        frame_bytes.ok_or_else(|| Error::Validation("frame field is required".into()))?;
    state.cameras.require(&camera_id).await?;

    // Dimensions come from the image header, not the client
    let (width, height) = image::ImageReader::new(std::io::Cursor::new(&frame_bytes))
        .with_guessed_format()
        .map_err(|_| Error::CorruptInput("Unreadable frame payload".into()))?
        .into_dimensions()
        .map_err(|_| Error::CorruptInput("Frame is not a decodable image".into()))?;

    let frame_id = match frame_id {
        Some(id) => id,
        None => state.coordinator.next_frame_id(&camera_id).await,
    };

    let outcome = state
        .coordinator
        .submit(IngestFrame {
            camera_id,
            frame_id,
            timestamp: parse_timestamp(timestamp.as_deref()),
            jpeg: frame_bytes,
            width,
            height,
        })
        .await;

    let status = match outcome {
        SubmitOutcome::Queued | SubmitOutcome::ReplacedOldest => "queued",
        SubmitOutcome::RejectedStale => "rejected",
    };

    Ok(Json(json!({
        "status": status,
        "frame_id": frame_id,
        "processing_time_ms": started.elapsed().as_secs_f64() * 1000.0,
    })))
}

// ========================================
// Analytics Handlers
// ========================================

async fn realtime_analytics(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<impl IntoResponse> {
    state.cameras.require(&camera_id).await?;
    Ok(Json(state.analytics.latest(&camera_id).await))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    start_time: Option<String>,
    end_time: Option<String>,
    #[serde(default = "default_interval")]
    interval: i64,
}

fn default_interval() -> i64 {
    60
}

async fn history_analytics(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse> {
    state.cameras.require(&camera_id).await?;

    let end = parse_optional_ts(params.end_time.as_deref()).unwrap_or_else(now_ms);
    let start = parse_optional_ts(params.start_time.as_deref())
        .unwrap_or_else(|| end - Duration::hours(1));
    let interval = params.interval.max(1);

    let data = state
        .analytics
        .history(&camera_id, start, end, interval)
        .await?;

    Ok(Json(json!({
        "camera_id": camera_id,
        "start_time": start,
        "end_time": end,
        "interval": interval,
        "data": data,
    })))
}

#[derive(Debug, Deserialize)]
struct HeatmapParams {
    #[serde(default = "default_heatmap_duration")]
    duration: i64,
}

fn default_heatmap_duration() -> i64 {
    300
}

async fn heatmap(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(params): Query<HeatmapParams>,
) -> Result<impl IntoResponse> {
    let camera = state.cameras.require(&camera_id).await?;
    let (width, height) = camera.resolution_wh().unwrap_or((1920, 1080));

    let payload = state
        .analytics
        .heatmap(&camera_id, params.duration.max(1), width, height)
        .await?;
    Ok(Json(payload))
}

#[derive(Debug, Deserialize)]
struct EntryExitParams {
    #[serde(default = "default_event_limit")]
    limit: i64,
}

fn default_event_limit() -> i64 {
    100
}

async fn entry_exit(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(params): Query<EntryExitParams>,
) -> Result<impl IntoResponse> {
    state.cameras.require(&camera_id).await?;
    let (entry_count, exit_count, events) = state
        .zones
        .recent_events(&camera_id, params.limit.clamp(1, 1000))
        .await?;

    Ok(Json(json!({
        "camera_id": camera_id,
        "entry_count": entry_count,
        "exit_count": exit_count,
        "events": events,
    })))
}

// ========================================
// Zone Handlers
// ========================================

async fn create_zone(
    State(state): State<AppState>,
    Json(req): Json<ZoneRequest>,
) -> Result<impl IntoResponse> {
    state.cameras.require(&req.camera_id).await?;
    let zone = state.zones.create(req).await?;
    Ok((StatusCode::CREATED, Json(zone)))
}

/// `GET /zones/{camera_id}`: the path segment is a camera id.
async fn get_zones(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<impl IntoResponse> {
    state.cameras.require(&camera_id).await?;
    let zones = state.zones.zones_for_camera(&camera_id).await;
    Ok(Json(json!({ "zones": zones })))
}

/// `PUT /zones/{zone_id}`: the path segment is a numeric zone id.
async fn update_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ZoneRequest>,
) -> Result<impl IntoResponse> {
    let zone_id = parse_id(&id)?;
    let zone = state.zones.update(zone_id, req).await?;
    Ok(Json(zone))
}

async fn delete_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let zone_id = parse_id(&id)?;
    state.zones.delete(zone_id).await?;
    Ok(Json(json!({ "status": "deleted", "zone_id": zone_id })))
}

// ========================================
// Alert Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct AlertParams {
    camera_id: Option<String>,
    severity: Option<String>,
    #[serde(default = "default_event_limit")]
    limit: i64,
}

async fn active_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertParams>,
) -> Result<impl IntoResponse> {
    let filter = AlertFilter {
        camera_id: params.camera_id,
        severity: params
            .severity
            .map(|s| RiskLevel::from_str(&s.to_uppercase())),
        limit: params.limit.clamp(1, 1000),
    };
    let alerts = state.alerts.active(&filter).await?;
    Ok(Json(json!({ "total": alerts.len(), "alerts": alerts })))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let alert_id = parse_id(&id)?;
    let alert = state.alerts.acknowledge(alert_id).await?;
    Ok(Json(json!({
        "status": "acknowledged",
        "alert_id": alert.id,
        "alert": alert,
    })))
}

// ========================================
// Movement Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct MovementParams {
    entry_camera_id: Option<String>,
    exit_camera_id: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    #[serde(default = "default_event_limit")]
    limit: i64,
}

async fn list_movements(
    State(state): State<AppState>,
    Query(params): Query<MovementParams>,
) -> Result<impl IntoResponse> {
    let filter = MovementFilter {
        entry_camera_id: params.entry_camera_id,
        exit_camera_id: params.exit_camera_id,
        start_time: parse_optional_ts(params.start_time.as_deref()),
        end_time: parse_optional_ts(params.end_time.as_deref()),
        limit: params.limit.clamp(1, 1000),
    };
    Ok(Json(state.matcher.movements(&filter).await?))
}

async fn movements_for_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<MovementParams>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .matcher
            .movements_for_camera(&id, params.limit.clamp(1, 1000))
            .await?,
    ))
}

async fn movements_for_pair(
    State(state): State<AppState>,
    Path((a, b)): Path<(String, String)>,
    Query(params): Query<MovementParams>,
) -> Result<impl IntoResponse> {
    let limit = params.limit.clamp(1, 1000);
    let mut forward = state
        .matcher
        .movements(&MovementFilter {
            entry_camera_id: Some(a.clone()),
            exit_camera_id: Some(b.clone()),
            limit,
            ..Default::default()
        })
        .await?;
    let backward = state
        .matcher
        .movements(&MovementFilter {
            entry_camera_id: Some(b),
            exit_camera_id: Some(a),
            limit,
            ..Default::default()
        })
        .await?;

    forward.extend(backward);
    forward.sort_by(|x, y| y.entry_timestamp.cmp(&x.entry_timestamp));
    forward.truncate(limit as usize);
    Ok(Json(forward))
}

async fn movement_statistics(
    State(state): State<AppState>,
    Query(params): Query<MovementParams>,
) -> Result<impl IntoResponse> {
    let stats = state
        .matcher
        .statistics(
            parse_optional_ts(params.start_time.as_deref()),
            parse_optional_ts(params.end_time.as_deref()),
        )
        .await?;
    Ok(Json(stats))
}

// ========================================
// Helpers
// ========================================

fn parse_id(raw: &str) -> Result<i64> {
    raw.parse()
        .map_err(|_| Error::BadRequest(format!("Invalid id: {raw}")))
}

fn parse_optional_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
