//! MJPEG streaming and snapshot endpoints.
//!
//! The live stream repeatedly takes the latest cached frame, annotates it,
//! and writes one multipart JPEG part, pacing itself to the configured
//! update rate. When no new frame has arrived the last rendered image is
//! resent rather than blocking the client.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::annotator::{self, RenderOptions};
use crate::error::Result;
use crate::frame_cache::FrameCache;
use crate::state::AppState;
use crate::zones::ZoneService;

const BOUNDARY: &str = "frame";

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    show_heatmap: bool,
    #[serde(default = "default_true")]
    show_zones: bool,
    #[serde(default = "default_true")]
    show_track_ids: bool,
    #[serde(default = "default_true")]
    show_metrics: bool,
}

fn default_true() -> bool {
    true
}

impl StreamParams {
    fn options(&self) -> RenderOptions {
        RenderOptions {
            show_heatmap: self.show_heatmap,
            show_zones: self.show_zones,
            show_track_ids: self.show_track_ids,
            show_metrics: self.show_metrics,
            ..RenderOptions::default()
        }
    }
}

/// Render the latest cached frame (or a placeholder) to JPEG. Returns the
/// cache sequence so callers can skip re-rendering unchanged frames.
async fn render_latest(
    frame_cache: &FrameCache,
    zones: &ZoneService,
    camera_id: &str,
    options: &RenderOptions,
    fallback_size: (u32, u32),
) -> (u64, Vec<u8>) {
    match frame_cache.get_latest(camera_id).await {
        Some(cached) => {
            let zone_list = zones.zones_for_camera(camera_id).await;
            let annotated = annotator::annotate(
                &cached.frame,
                &cached.detections,
                &cached.tracks,
                &zone_list,
                &cached.analytics,
                options,
            );
            (cached.seq, annotator::encode_jpeg(&annotated, 85))
        }
        None => {
            let placeholder =
                annotator::placeholder_frame(camera_id, fallback_size.0, fallback_size.1);
            (0, annotator::encode_jpeg(&placeholder, 85))
        }
    }
}

fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + 128);
    part.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    part.extend_from_slice(b"Content-Type: image/jpeg\r\n");
    part.extend_from_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// `GET /stream/{camera_id}`: multipart/x-mixed-replace JPEG stream.
pub async fn stream_video(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Response> {
    let camera = state.cameras.require(&camera_id).await?;
    let fallback = camera.resolution_wh().unwrap_or((640, 480));
    let options = params.options();
    let fps = state.config.pipeline.stream_fps.max(1);

    let frame_cache = state.frame_cache.clone();
    let zones = state.zones.clone();

    struct StreamState {
        frame_cache: Arc<FrameCache>,
        zones: Arc<ZoneService>,
        camera_id: String,
        options: RenderOptions,
        fallback: (u32, u32),
        interval: tokio::time::Interval,
        last_seq: u64,
        last_jpeg: Vec<u8>,
    }

    let mut interval = tokio::time::interval(Duration::from_millis(1000 / fps as u64));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let stream = futures::stream::unfold(
        StreamState {
            frame_cache,
            zones,
            camera_id,
            options,
            fallback,
            interval,
            last_seq: u64::MAX,
            last_jpeg: Vec::new(),
        },
        |mut st| async move {
            st.interval.tick().await;

            let latest_seq = st
                .frame_cache
                .get_latest(&st.camera_id)
                .await
                .map(|f| f.seq)
                .unwrap_or(0);

            if latest_seq != st.last_seq || st.last_jpeg.is_empty() {
                let (seq, jpeg) = render_latest(
                    &st.frame_cache,
                    &st.zones,
                    &st.camera_id,
                    &st.options,
                    st.fallback,
                )
                .await;
                st.last_seq = seq;
                st.last_jpeg = jpeg;
            }

            let chunk = multipart_chunk(&st.last_jpeg);
            Some((Ok::<_, std::convert::Infallible>(chunk), st))
        },
    );

    let response = Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| crate::error::Error::Internal(e.to_string()))?;
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct SnapshotParams {
    #[serde(default = "default_true")]
    annotated: bool,
    #[serde(default)]
    show_heatmap: bool,
    #[serde(default = "default_true")]
    show_zones: bool,
    #[serde(default = "default_true")]
    show_track_ids: bool,
    #[serde(default = "default_true")]
    show_metrics: bool,
}

/// `GET /cameras/{camera_id}/snapshot`: one JPEG.
pub async fn snapshot(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(params): Query<SnapshotParams>,
) -> Result<Response> {
    let camera = state.cameras.require(&camera_id).await?;
    let fallback = camera.resolution_wh().unwrap_or((640, 480));

    let jpeg = if params.annotated {
        let options = RenderOptions {
            show_heatmap: params.show_heatmap,
            show_zones: params.show_zones,
            show_track_ids: params.show_track_ids,
            show_metrics: params.show_metrics,
            ..RenderOptions::default()
        };
        render_latest(&state.frame_cache, &state.zones, &camera_id, &options, fallback)
            .await
            .1
    } else {
        match state.frame_cache.get_latest(&camera_id).await {
            Some(cached) => annotator::encode_jpeg(&cached.frame, 85),
            None => annotator::encode_jpeg(
                &annotator::placeholder_frame(&camera_id, fallback.0, fallback.1),
                85,
            ),
        }
    };

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}
