//! Application state
//!
//! Holds all shared components as explicit dependencies so tests can
//! substitute fakes. No module-level singletons.

use crate::alerts::AlertService;
use crate::analytics::AnalyticsService;
use crate::camera_registry::CameraRegistry;
use crate::frame_cache::FrameCache;
use crate::ingest::PipelineCoordinator;
use crate::matcher::CrossCameraMatcher;
use crate::push_fabric::PushFabric;
use crate::zones::ZoneService;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Database URL
    pub database_url: String,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Detector sidecar URL (person detection inference service)
    pub detector_url: String,
    /// Pipeline tunables
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://vision.db?mode=rwc".to_string()),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            detector_url: std::env::var("DETECTOR_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9090".to_string()),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Numeric knobs of the processing pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Per-camera ingest queue depth (drop-oldest beyond this)
    pub queue_capacity: usize,
    /// Minimum detection confidence
    pub confidence_threshold: f32,
    /// NMS IoU threshold
    pub nms_threshold: f32,
    /// Tracker association IoU threshold
    pub track_iou_threshold: f32,
    /// Frames before a tentative track is confirmed
    pub track_min_hits: u32,
    /// Missed frames before a track is terminated
    pub track_max_age: u32,
    /// Re-id embedding dimensionality
    pub embedding_dim: usize,
    /// EMA factor for embedding updates
    pub embedding_alpha: f32,
    /// Density normaliser: raw KDE mean mapping to density 1.0
    pub density_norm: f32,
    /// Reference speed (px/s) for the speed-variance risk factor
    pub reference_speed: f32,
    /// Per-track speed change (px/s) counting as sudden movement
    pub speed_jump_threshold: f32,
    /// Risk score below this is NORMAL
    pub warning_threshold: f32,
    /// Risk score at or above this is CRITICAL
    pub critical_threshold: f32,
    /// Re-emit interval for sustained non-NORMAL levels
    pub alert_resample_interval: Duration,
    /// Frames retained per camera in the frame cache
    pub frame_cache_capacity: usize,
    /// Frame cache entry TTL
    pub frame_cache_ttl: Duration,
    /// Target MJPEG stream rate (updates per second)
    pub stream_fps: u32,
    /// Minimum re-id similarity for a cross-camera match
    pub match_similarity_threshold: f32,
    /// Search window around an event for the counterpart event
    pub match_time_window: Duration,
    /// Per-subscriber push buffer depth
    pub push_buffer_capacity: usize,
    /// Consecutive dropped pushes before a subscriber is disconnected
    pub push_max_consecutive_drops: u32,
    /// Analytics rows buffered per camera while the store is unavailable
    pub write_buf_max: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            track_iou_threshold: 0.5,
            track_min_hits: 3,
            track_max_age: 30,
            embedding_dim: 512,
            embedding_alpha: 0.3,
            density_norm: 0.25,
            reference_speed: 100.0,
            speed_jump_threshold: 50.0,
            warning_threshold: 0.4,
            critical_threshold: 0.7,
            alert_resample_interval: Duration::from_secs(30),
            frame_cache_capacity: 10,
            frame_cache_ttl: Duration::from_secs(5),
            stream_fps: 30,
            match_similarity_threshold: 0.7,
            match_time_window: Duration::from_secs(600),
            push_buffer_capacity: 64,
            push_max_consecutive_drops: 3,
            write_buf_max: 1000,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database pool
    pub pool: SqlitePool,
    /// Application config
    pub config: AppConfig,
    /// Camera records
    pub cameras: Arc<CameraRegistry>,
    /// Frame ingestion and per-camera pipeline workers
    pub coordinator: Arc<PipelineCoordinator>,
    /// Zone CRUD and live occupancy
    pub zones: Arc<ZoneService>,
    /// Analytics queries, latest-sample cache, heatmaps
    pub analytics: Arc<AnalyticsService>,
    /// Alert persistence and queries
    pub alerts: Arc<AlertService>,
    /// Decoded frames for streaming/snapshots
    pub frame_cache: Arc<FrameCache>,
    /// Cross-camera movement matching
    pub matcher: Arc<CrossCameraMatcher>,
    /// Metrics/alert broadcast to subscribers
    pub push: Arc<PushFabric>,
}
