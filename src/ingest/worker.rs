//! The per-camera worker: drains the ingest queue in order and drives the
//! stage graph for each surviving frame.

use super::CameraHandle;
use crate::alerts::AlertService;
use crate::analytics::{congestion_from_density, estimate_density, AnalyticsService, MotionTracker};
use crate::camera_registry::CameraRegistry;
use crate::detector::PersonDetector;
use crate::frame_cache::FrameCache;
use crate::ingest::IngestFrame;
use crate::matcher::CrossCameraMatcher;
use crate::models::{now_ms, AnalyticsSample, RiskLevel};
use crate::push_fabric::{PushFabric, Topic};
use crate::reid::{ema_update, AppearanceEncoder};
use crate::risk::{classify_alert, AlertKind, AlertPolicy, RiskEngine};
use crate::state::PipelineConfig;
use crate::storage::PipelineStore;
use crate::tracker::{IouTracker, TrackerConfig};
use crate::zones::{ZoneEvaluator, ZoneService};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared collaborators handed to every camera worker.
pub struct PipelineStages {
    pub detector: Arc<dyn PersonDetector>,
    pub encoder: Arc<dyn AppearanceEncoder>,
    pub store: PipelineStore,
    pub cameras: Arc<CameraRegistry>,
    pub zones: Arc<ZoneService>,
    pub analytics: Arc<AnalyticsService>,
    pub alerts: Arc<AlertService>,
    pub frame_cache: Arc<FrameCache>,
    pub matcher: Arc<CrossCameraMatcher>,
    pub push: Arc<PushFabric>,
}

/// Worker-owned pipeline state: single writer, rebuilt from scratch if a
/// stage panics.
struct CameraPipelineState {
    tracker: IouTracker,
    zone_eval: ZoneEvaluator,
    motion: MotionTracker,
    risk: RiskEngine,
    alert_policy: AlertPolicy,
}

impl CameraPipelineState {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            tracker: IouTracker::new(TrackerConfig {
                iou_threshold: config.track_iou_threshold,
                min_hits: config.track_min_hits,
                max_age: config.track_max_age,
            }),
            zone_eval: ZoneEvaluator::new(),
            motion: MotionTracker::new(),
            risk: RiskEngine::new(
                config.reference_speed,
                config.speed_jump_threshold,
                config.warning_threshold,
                config.critical_threshold,
            ),
            alert_policy: AlertPolicy::new(config.alert_resample_interval),
        }
    }
}

/// Spawn the long-lived worker task for one camera.
pub(crate) fn spawn(
    handle: Arc<CameraHandle>,
    stages: Arc<PipelineStages>,
    config: PipelineConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let camera_id = handle.camera_id.clone();
        let mut state = Some(CameraPipelineState::new(&config));

        loop {
            // Wait for a frame, a shutdown, or retirement
            let frame = loop {
                if handle.retired.load(Ordering::Acquire) {
                    tracing::debug!(camera_id = %camera_id, "Camera worker retired");
                    return;
                }
                if *shutdown.borrow() {
                    let remaining = handle.queue.lock().map(|mut q| q.drain(..).count());
                    tracing::info!(
                        camera_id = %camera_id,
                        discarded = remaining.unwrap_or(0),
                        "Camera worker stopped"
                    );
                    return;
                }
                let popped = handle.queue.lock().ok().and_then(|mut q| q.pop_front());
                if let Some(frame) = popped {
                    break frame;
                }
                tokio::select! {
                    _ = handle.notify.notified() => {}
                    res = shutdown.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            };

            // Run the stages on a scoped task so a panicking stage cannot
            // take the worker down; on panic the pipeline state is rebuilt.
            let frame_id = frame.frame_id;
            let owned_state = state.take().expect("pipeline state present");
            let stages_ref = stages.clone();
            let config_ref = config.clone();
            let result = tokio::spawn(async move {
                let mut st = owned_state;
                let decoded = process_frame(&stages_ref, &config_ref, &mut st, frame).await;
                (st, decoded)
            })
            .await;

            match result {
                Ok((st, decoded)) => {
                    if !decoded {
                        handle.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    state = Some(st);
                }
                Err(e) => {
                    tracing::error!(
                        camera_id = %camera_id,
                        frame_id,
                        error = %e,
                        "Pipeline stage panicked, re-initialising stages"
                    );
                    state = Some(CameraPipelineState::new(&config));
                }
            }
            handle.stats.processed.fetch_add(1, Ordering::Relaxed);
        }
    });
}

/// Run one frame through the stage graph. Every failure degrades: log,
/// count, continue. Nothing here may take the camera down. Returns false
/// when the frame could not be decoded.
async fn process_frame(
    stages: &PipelineStages,
    config: &PipelineConfig,
    state: &mut CameraPipelineState,
    frame: IngestFrame,
) -> bool {
    let camera_id = frame.camera_id.clone();

    // Decode; a corrupt frame is skipped with a counter
    let rgb = match image::load_from_memory(&frame.jpeg) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            tracing::warn!(
                camera_id = %camera_id,
                frame_id = frame.frame_id,
                error = %e,
                "Frame decode failed, skipping"
            );
            return false;
        }
    };
    let (width, height) = rgb.dimensions();
    if frame.width != 0 && (frame.width != width || frame.height != height) {
        tracing::warn!(
            camera_id = %camera_id,
            claimed = format!("{}x{}", frame.width, frame.height),
            actual = format!("{}x{}", width, height),
            "Frame dimensions mismatch"
        );
    }

    // Stage 1: detection (errors surface as an empty list inside the stage)
    let mut detections = stages.detector.detect(&frame.jpeg, width, height).await;

    // Stage 2: tracking
    let tracks = state.tracker.update(&detections, frame.timestamp);

    // Tag detections with the track that claimed them
    for det in detections.iter_mut() {
        det.track_id = tracks
            .iter()
            .find(|t| t.bbox == det.bbox)
            .map(|t| t.track_id);
    }

    // Stage 3: re-id on confirmed tracks, EMA into the stored embedding
    for track in &tracks {
        let fresh = stages.encoder.extract(&rgb, &track.bbox);
        if fresh.iter().all(|v| *v == 0.0) || fresh.iter().any(|v| v.is_nan()) {
            continue;
        }
        let fused = match state.tracker.embedding(track.track_id) {
            Some(stored) => {
                let mut fused = stored.clone();
                ema_update(&mut fused, &fresh, config.embedding_alpha);
                fused
            }
            None => fresh,
        };
        state.tracker.set_embedding(track.track_id, fused.clone());

        if let Some(entry) = state.tracker.get(track.track_id) {
            if let Err(e) = stages
                .store
                .upsert_track(
                    &camera_id,
                    track,
                    entry.avg_confidence,
                    entry.first_seen,
                    entry.last_seen,
                    Some(&fused),
                )
                .await
            {
                tracing::warn!(camera_id = %camera_id, track_id = track.track_id, error = %e, "Track persist failed");
            }
        }
    }

    // Stage 4: persist frame metadata and detections
    match stages
        .store
        .insert_frame(&camera_id, frame.frame_id, frame.timestamp, width, height)
        .await
    {
        Ok(frame_ref) => {
            if let Err(e) = stages
                .store
                .insert_detections(frame_ref, &camera_id, &detections, frame.timestamp)
                .await
            {
                tracing::warn!(camera_id = %camera_id, error = %e, "Detection persist failed");
            }
        }
        Err(e) => {
            tracing::warn!(
                camera_id = %camera_id,
                frame_id = frame.frame_id,
                error = %e,
                "Frame persist failed"
            );
        }
    }

    // Stage 5: zone evaluation and entry/exit events
    let zones = stages.zones.zones_for_camera(&camera_id).await;
    let zone_result = state.zone_eval.evaluate(&zones, &tracks);
    state
        .zone_eval
        .retain_tracks(&state.tracker.active_track_ids());
    state
        .zone_eval
        .retain_zones(&zones.iter().map(|z| z.id).collect::<Vec<_>>());

    for crossing in &zone_result.crossings {
        match stages
            .zones
            .record_event(
                &camera_id,
                crossing.zone_id,
                crossing.track_id,
                crossing.kind,
                frame.timestamp,
            )
            .await
        {
            Ok(event) => stages.matcher.submit(event),
            Err(e) => {
                tracing::warn!(camera_id = %camera_id, error = %e, "Entry/exit persist failed")
            }
        }
    }
    for (zone_id, delta) in &zone_result.occupancy_deltas {
        if let Err(e) = stages.zones.adjust_occupancy(*zone_id, *delta).await {
            tracing::warn!(zone_id = *zone_id, error = %e, "Occupancy update failed");
        }
    }
    stages.zones.set_live_counts(&zone_result.inside_counts).await;

    // Stage 6: analytics and risk
    let density = estimate_density(&tracks, width, height, config.density_norm);
    let congestion = congestion_from_density(density);
    let frame_motion = state.motion.update(&tracks, frame.timestamp);
    let (risk_score, _factors) = state.risk.score(density, congestion, &frame_motion.motions);
    let risk_level = state.risk.level(risk_score);

    let sample = AnalyticsSample {
        camera_id: camera_id.clone(),
        timestamp: frame.timestamp,
        people_count: tracks.len() as u32,
        density,
        avg_speed: frame_motion.avg_speed,
        flow_direction: frame_motion.flow,
        congestion_level: congestion,
        risk_score,
        risk_level,
    };
    stages.analytics.record(sample.clone()).await;

    // Stage 7: alerts (after the sample is persisted)
    for zone_id in &zone_result.newly_overcapacity {
        let message = zones
            .iter()
            .find(|z| z.id == *zone_id)
            .map(|z| format!("Zone '{}' is over capacity", z.zone_name))
            .unwrap_or_else(|| format!("Zone {zone_id} is over capacity"));
        emit_alert(
            stages,
            &camera_id,
            AlertKind::ZoneOvercapacity.as_str(),
            RiskLevel::Warning,
            risk_score,
            &message,
        )
        .await;
    }

    if state.alert_policy.should_alert(risk_level, frame.timestamp) {
        let (kind, message) = classify_alert(risk_level, risk_score, density, congestion);
        emit_alert(
            stages,
            &camera_id,
            kind.as_str(),
            risk_level,
            risk_score,
            &message,
        )
        .await;
    }

    // Stage 8: cache the frame for streaming
    let seq = stages
        .frame_cache
        .put(&camera_id, rgb, detections, tracks, sample.clone())
        .await;
    tracing::trace!(camera_id = %camera_id, seq, "Frame cached");

    // Stage 9: broadcast metrics, then bookkeeping
    stages
        .push
        .publish(
            &Topic::Metrics(camera_id.clone()),
            &json!({
                "type": "metrics",
                "camera_id": camera_id,
                "data": sample,
                "timestamp": frame.timestamp,
            }),
        )
        .await;

    stages.cameras.touch_last_frame(&camera_id, now_ms()).await;

    tracing::debug!(
        camera_id = %camera_id,
        frame_id = frame.frame_id,
        people = sample.people_count,
        risk = %sample.risk_level.as_str(),
        "Frame processed"
    );
    true
}

async fn emit_alert(
    stages: &PipelineStages,
    camera_id: &str,
    kind: &str,
    severity: RiskLevel,
    risk_score: f32,
    message: &str,
) {
    match stages
        .alerts
        .create(camera_id, kind, severity, risk_score, message)
        .await
    {
        Ok(alert) => {
            stages
                .push
                .publish(&Topic::Alerts, &json!({ "type": "alert", "alert": alert }))
                .await;
        }
        Err(e) => tracing::warn!(camera_id = %camera_id, error = %e, "Alert persist failed"),
    }
}
