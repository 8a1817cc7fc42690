//! VISION Master Node
//!
//! Server-side crowd monitoring pipeline: edge agents push camera frames in,
//! the server runs per-camera vision analytics and fans results out over
//! REST, MJPEG streams and WebSocket push.
//!
//! ## Architecture (12 Components)
//!
//! 1. CameraRegistry - camera records and status
//! 2. Ingest - frame admission, per-camera queues and workers
//! 3. Detector - person detection stage (sidecar adapter)
//! 4. Tracker - IoU multi-object tracking
//! 5. ReID - appearance embeddings and similarity
//! 6. Zones - zone CRUD and entry/exit evaluation
//! 7. Analytics - density, speed, flow, congestion, history, heatmaps
//! 8. Risk - risk scoring and alert policy
//! 9. FrameCache - decoded frames for streaming
//! 10. Annotator - overlay rendering
//! 11. Matcher - cross-camera movement linking
//! 12. PushFabric - metric/alert distribution
//!
//! ## Design Principles
//!
//! - Per-camera state is owned by that camera's worker; cross-camera access
//!   goes through registries keyed by camera id
//! - Errors never cross camera boundaries
//! - The ingest surface always returns promptly; heavy work runs on workers

pub mod alerts;
pub mod analytics;
pub mod annotator;
pub mod camera_registry;
pub mod detector;
pub mod error;
pub mod frame_cache;
pub mod ingest;
pub mod matcher;
pub mod models;
pub mod push_fabric;
pub mod reid;
pub mod risk;
pub mod state;
pub mod storage;
pub mod tracker;
pub mod web_api;
pub mod zones;

pub use error::{Error, Result};
pub use state::{AppConfig, AppState, PipelineConfig};
