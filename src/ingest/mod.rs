//! Ingest - Frame Admission and Per-Camera Pipeline Workers
//!
//! ## Responsibilities
//!
//! - Accept frames from the upload endpoint and the WebSocket channel
//! - Per-camera bounded queue with drop-oldest admission and an
//!   out-of-order gate on frame_id
//! - One long-lived worker per camera driving the stage graph:
//!   detect -> track -> re-id -> zones -> analytics -> risk -> alerts
//!
//! Ordering: a camera's surviving frames are processed strictly in
//! increasing frame_id; cameras never block each other. A stage panic
//! re-initialises that camera's pipeline state and the worker moves on.

mod worker;

pub use worker::PipelineStages;

use crate::models::now_ms;
use crate::state::PipelineConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify, RwLock};

/// One inbound frame as received from a transport.
#[derive(Debug, Clone)]
pub struct IngestFrame {
    pub camera_id: String,
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// What happened to a submitted frame at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Enqueued with room to spare
    Queued,
    /// Enqueued; the oldest queued frame was discarded to make room
    ReplacedOldest,
    /// Rejected: frame_id not beyond the newest already admitted
    RejectedStale,
}

/// Per-camera ingest counters, surfaced as metrics.
#[derive(Debug, Default, Serialize)]
pub struct CameraIngestStats {
    pub received: u64,
    pub processed: u64,
    pub dropped_queue_full: u64,
    pub rejected_out_of_order: u64,
    pub decode_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub dropped_queue_full: AtomicU64,
    pub rejected_out_of_order: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> CameraIngestStats {
        CameraIngestStats {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            rejected_out_of_order: self.rejected_out_of_order.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Shared handle between the coordinator and one camera worker.
pub(crate) struct CameraHandle {
    pub camera_id: String,
    /// Bounded FIFO; admission and eviction happen under this lock
    pub queue: Mutex<VecDeque<IngestFrame>>,
    pub notify: Notify,
    /// Highest admitted frame_id (0 = none yet)
    pub last_seen_frame_id: AtomicU64,
    pub stats: StatCounters,
    /// Set to retire this worker (camera reset)
    pub retired: AtomicBool,
}

/// PipelineCoordinator instance
pub struct PipelineCoordinator {
    stages: Arc<PipelineStages>,
    config: PipelineConfig,
    cameras: RwLock<HashMap<String, Arc<CameraHandle>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PipelineCoordinator {
    pub fn new(stages: PipelineStages, config: PipelineConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            stages: Arc::new(stages),
            config,
            cameras: RwLock::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Admit a frame into its camera's queue, spawning the worker on first
    /// contact. Returns the admission outcome; never blocks on processing.
    pub async fn submit(&self, frame: IngestFrame) -> SubmitOutcome {
        let handle = self.handle_for(&frame.camera_id).await;
        handle.stats.received.fetch_add(1, Ordering::Relaxed);

        let outcome = {
            let mut queue = handle.queue.lock().expect("ingest queue poisoned");

            let last_seen = handle.last_seen_frame_id.load(Ordering::Acquire);
            if frame.frame_id <= last_seen {
                handle
                    .stats
                    .rejected_out_of_order
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    camera_id = %frame.camera_id,
                    frame_id = frame.frame_id,
                    last_seen,
                    "Rejected out-of-order frame"
                );
                return SubmitOutcome::RejectedStale;
            }
            handle
                .last_seen_frame_id
                .store(frame.frame_id, Ordering::Release);

            let mut outcome = SubmitOutcome::Queued;
            if queue.len() >= self.config.queue_capacity {
                let dropped = queue.pop_front();
                handle
                    .stats
                    .dropped_queue_full
                    .fetch_add(1, Ordering::Relaxed);
                outcome = SubmitOutcome::ReplacedOldest;
                if let Some(dropped) = dropped {
                    tracing::debug!(
                        camera_id = %frame.camera_id,
                        dropped_frame_id = dropped.frame_id,
                        "Queue full, dropped oldest frame"
                    );
                }
            }
            queue.push_back(frame);
            outcome
        };

        handle.notify.notify_one();
        outcome
    }

    /// Next frame id for clients that let the server assign one.
    pub async fn next_frame_id(&self, camera_id: &str) -> u64 {
        let handle = self.handle_for(camera_id).await;
        handle.last_seen_frame_id.load(Ordering::Acquire) + 1
    }

    /// Ingest counters for one camera.
    pub async fn stats(&self, camera_id: &str) -> Option<CameraIngestStats> {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).map(|h| h.stats.snapshot())
    }

    /// Retire a camera's worker and forget its pipeline state. The next
    /// frame spawns a fresh worker (fresh tracker, fresh zone state).
    pub async fn reset_camera(&self, camera_id: &str) {
        let mut cameras = self.cameras.write().await;
        if let Some(handle) = cameras.remove(camera_id) {
            handle.retired.store(true, Ordering::Release);
            handle.notify.notify_one();
            tracing::info!(camera_id = %camera_id, "Camera pipeline reset");
        }
    }

    /// Signal all workers to finish their in-flight frame and stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        tracing::info!("Pipeline coordinator shutting down");
    }

    async fn handle_for(&self, camera_id: &str) -> Arc<CameraHandle> {
        {
            let cameras = self.cameras.read().await;
            if let Some(handle) = cameras.get(camera_id) {
                return handle.clone();
            }
        }

        let mut cameras = self.cameras.write().await;
        if let Some(handle) = cameras.get(camera_id) {
            return handle.clone();
        }

        let handle = Arc::new(CameraHandle {
            camera_id: camera_id.to_string(),
            queue: Mutex::new(VecDeque::with_capacity(self.config.queue_capacity)),
            notify: Notify::new(),
            last_seen_frame_id: AtomicU64::new(0),
            stats: StatCounters::default(),
            retired: AtomicBool::new(false),
        });
        cameras.insert(camera_id.to_string(), handle.clone());

        tracing::info!(camera_id = %camera_id, "Spawning camera worker");
        worker::spawn(
            handle.clone(),
            self.stages.clone(),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        );
        handle
    }
}

/// Parse the inbound timestamp, defaulting to now. Accepts RFC 3339 with a
/// trailing `Z`.
pub fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(now_ms)
}
