//! FrameCache - Decoded Frames for Streaming
//!
//! ## Responsibilities
//!
//! - Keep the most recent decoded frames per camera with their annotations
//! - Expire entries by TTL (checked on every put and on reads)
//! - Serve the latest frame to the MJPEG streamer and snapshot handler
//!
//! Mutated by ingest workers, read by annotators; entries are `Arc`ed so
//! readers never copy pixel data.

use crate::models::{AnalyticsSample, Detection, TrackSnapshot};
use chrono::{DateTime, Duration, Utc};
use image::RgbImage;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One cached frame with everything the annotator needs.
#[derive(Debug)]
pub struct CachedFrame {
    /// Monotonically increasing per-camera sequence number
    pub seq: u64,
    /// Ingestion wall clock, used for TTL
    pub cached_at: DateTime<Utc>,
    pub frame: RgbImage,
    pub detections: Vec<Detection>,
    pub tracks: Vec<TrackSnapshot>,
    pub analytics: AnalyticsSample,
}

struct CameraRing {
    frames: VecDeque<Arc<CachedFrame>>,
    next_seq: u64,
}

/// FrameCache configuration
#[derive(Debug, Clone)]
pub struct FrameCacheConfig {
    /// Frames retained per camera
    pub capacity: usize,
    /// Entry time-to-live
    pub ttl: std::time::Duration,
}

impl Default for FrameCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            ttl: std::time::Duration::from_secs(5),
        }
    }
}

/// FrameCache instance
pub struct FrameCache {
    config: FrameCacheConfig,
    ttl: Duration,
    cache: RwLock<HashMap<String, CameraRing>>,
}

impl FrameCache {
    pub fn new(config: FrameCacheConfig) -> Self {
        let ttl = Duration::from_std(config.ttl).unwrap_or_else(|_| Duration::seconds(5));
        Self {
            config,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Store a frame, evicting expired entries of that camera first.
    /// Returns the sequence number assigned to the frame.
    pub async fn put(
        &self,
        camera_id: &str,
        frame: RgbImage,
        detections: Vec<Detection>,
        tracks: Vec<TrackSnapshot>,
        analytics: AnalyticsSample,
    ) -> u64 {
        let now = Utc::now();
        let mut cache = self.cache.write().await;
        let ring = cache.entry(camera_id.to_string()).or_insert_with(|| CameraRing {
            frames: VecDeque::with_capacity(self.config.capacity),
            next_seq: 1,
        });

        while ring
            .frames
            .front()
            .map_or(false, |f| now - f.cached_at > self.ttl)
        {
            ring.frames.pop_front();
        }

        let seq = ring.next_seq;
        ring.next_seq += 1;

        if ring.frames.len() >= self.config.capacity {
            ring.frames.pop_front();
        }
        ring.frames.push_back(Arc::new(CachedFrame {
            seq,
            cached_at: now,
            frame,
            detections,
            tracks,
            analytics,
        }));
        seq
    }

    /// Latest non-expired frame for a camera.
    pub async fn get_latest(&self, camera_id: &str) -> Option<Arc<CachedFrame>> {
        let cache = self.cache.read().await;
        let ring = cache.get(camera_id)?;
        let latest = ring.frames.back()?;
        if Utc::now() - latest.cached_at > self.ttl {
            return None;
        }
        Some(latest.clone())
    }

    /// Drop every expired entry across all cameras.
    pub async fn evict_expired(&self) {
        let now = Utc::now();
        let mut cache = self.cache.write().await;
        cache.retain(|_, ring| {
            while ring
                .frames
                .front()
                .map_or(false, |f| now - f.cached_at > self.ttl)
            {
                ring.frames.pop_front();
            }
            !ring.frames.is_empty()
        });
    }

    /// Number of live frames cached for a camera.
    pub async fn len(&self, camera_id: &str) -> usize {
        let cache = self.cache.read().await;
        cache.get(camera_id).map_or(0, |r| r.frames.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalyticsSample;

    fn cache_with_ttl(ttl_ms: u64) -> FrameCache {
        FrameCache::new(FrameCacheConfig {
            capacity: 3,
            ttl: std::time::Duration::from_millis(ttl_ms),
        })
    }

    fn frame() -> RgbImage {
        RgbImage::new(8, 8)
    }

    async fn put(cache: &FrameCache, camera: &str) -> u64 {
        cache
            .put(
                camera,
                frame(),
                Vec::new(),
                Vec::new(),
                AnalyticsSample::empty(camera),
            )
            .await
    }

    #[tokio::test]
    async fn get_latest_returns_newest_seq() {
        let cache = cache_with_ttl(60_000);
        put(&cache, "cam_A").await;
        put(&cache, "cam_A").await;
        let s3 = put(&cache, "cam_A").await;

        let latest = cache.get_latest("cam_A").await.unwrap();
        assert_eq!(latest.seq, s3);
        assert_eq!(s3, 3);
    }

    #[tokio::test]
    async fn capacity_bounds_ring() {
        let cache = cache_with_ttl(60_000);
        for _ in 0..10 {
            put(&cache, "cam_A").await;
        }
        assert_eq!(cache.len("cam_A").await, 3);
        assert_eq!(cache.get_latest("cam_A").await.unwrap().seq, 10);
    }

    #[tokio::test]
    async fn expired_entries_are_not_served() {
        let cache = cache_with_ttl(30);
        put(&cache, "cam_A").await;
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(cache.get_latest("cam_A").await.is_none());
    }

    #[tokio::test]
    async fn evict_expired_drops_empty_cameras() {
        let cache = cache_with_ttl(30);
        put(&cache, "cam_A").await;
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        cache.evict_expired().await;
        assert_eq!(cache.len("cam_A").await, 0);
    }

    #[tokio::test]
    async fn cameras_are_independent() {
        let cache = cache_with_ttl(60_000);
        put(&cache, "cam_A").await;
        let b = put(&cache, "cam_B").await;
        assert_eq!(b, 1);
        assert_eq!(cache.len("cam_A").await, 1);
        assert_eq!(cache.len("cam_B").await, 1);
    }
}
