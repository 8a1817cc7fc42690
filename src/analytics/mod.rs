//! Analytics - Per-Frame Crowd Metrics
//!
//! ## Responsibilities
//!
//! - Compute density, speed, flow and congestion per processed frame
//! - Cache the latest sample per camera for REST reads and push broadcast
//! - Persist samples, buffering through transient store failures
//! - Serve history aggregation and heatmap rendering
//!
//! The engine math lives in `engine`; this module owns storage and caches.

mod engine;

pub use engine::{
    accumulate_heatmap, colormap_jet, congestion_from_density, estimate_density, FrameMotion,
    MotionTracker,
};

use crate::error::Result;
use crate::models::{AnalyticsSample, CongestionLevel, FlowVector, RiskLevel};
use crate::storage::PipelineStore;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use image::ImageEncoder as _;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, RwLock};

/// One aggregated history bucket.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryBucket {
    pub timestamp: DateTime<Utc>,
    pub people_count: i64,
    pub density: f32,
    pub avg_speed: f32,
    pub risk_score: f32,
}

/// Rendered heatmap payload.
#[derive(Debug, Clone, Serialize)]
pub struct HeatmapPayload {
    pub camera_id: String,
    pub heatmap: String,
    pub resolution: Resolution,
    pub timestamp: DateTime<Utc>,
    pub duration: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// AnalyticsService instance
pub struct AnalyticsService {
    pool: SqlitePool,
    store: PipelineStore,
    /// camera_id -> most recent sample
    latest: RwLock<HashMap<String, AnalyticsSample>>,
    /// camera_id -> rows awaiting a recovered store
    write_buffer: Mutex<HashMap<String, VecDeque<AnalyticsSample>>>,
    write_buf_max: usize,
}

impl AnalyticsService {
    pub fn new(pool: SqlitePool, write_buf_max: usize) -> Self {
        let store = PipelineStore::new(pool.clone());
        Self {
            pool,
            store,
            latest: RwLock::new(HashMap::new()),
            write_buffer: Mutex::new(HashMap::new()),
            write_buf_max,
        }
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    /// Record a sample: cache it as latest, then persist. A failed insert
    /// parks the row in the per-camera buffer (bounded, drop-oldest); the
    /// buffer flushes ahead of the next successful write.
    pub async fn record(&self, sample: AnalyticsSample) {
        {
            let mut latest = self.latest.write().await;
            latest.insert(sample.camera_id.clone(), sample.clone());
        }

        let pending = {
            let mut buffers = self.write_buffer.lock().await;
            buffers.remove(&sample.camera_id).unwrap_or_default()
        };

        let mut failed: VecDeque<AnalyticsSample> = VecDeque::new();
        for row in pending.into_iter().chain(std::iter::once(sample.clone())) {
            if !failed.is_empty() {
                failed.push_back(row);
                continue;
            }
            if let Err(e) = self.insert(&row).await {
                tracing::warn!(
                    camera_id = %row.camera_id,
                    error = %e,
                    "Analytics write failed, buffering"
                );
                failed.push_back(row);
            }
        }

        if !failed.is_empty() {
            let mut buffers = self.write_buffer.lock().await;
            let buffer = buffers.entry(sample.camera_id.clone()).or_default();
            buffer.extend(failed);
            while buffer.len() > self.write_buf_max {
                buffer.pop_front();
            }
        }
    }

    async fn insert(&self, sample: &AnalyticsSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analytics (camera_id, timestamp, people_count, density, avg_speed,
                                   flow_x, flow_y, congestion_level, risk_score, risk_level)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sample.camera_id)
        .bind(sample.timestamp)
        .bind(sample.people_count)
        .bind(sample.density)
        .bind(sample.avg_speed)
        .bind(sample.flow_direction.x)
        .bind(sample.flow_direction.y)
        .bind(sample.congestion_level.as_str())
        .bind(sample.risk_score)
        .bind(sample.risk_level.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest sample for a camera, from the in-memory slot, falling back to
    /// the store, then to the all-zero sample.
    pub async fn latest(&self, camera_id: &str) -> AnalyticsSample {
        if let Some(sample) = self.latest.read().await.get(camera_id) {
            return sample.clone();
        }
        match self.fetch_latest(camera_id).await {
            Ok(Some(sample)) => sample,
            _ => AnalyticsSample::empty(camera_id),
        }
    }

    async fn fetch_latest(&self, camera_id: &str) -> Result<Option<AnalyticsSample>> {
        let row = sqlx::query(
            r#"
            SELECT camera_id, timestamp, people_count, density, avg_speed,
                   flow_x, flow_y, congestion_level, risk_score, risk_level
            FROM analytics WHERE camera_id = ?
            ORDER BY timestamp DESC, id DESC LIMIT 1
            "#,
        )
        .bind(camera_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(AnalyticsSample {
                camera_id: row.try_get("camera_id")?,
                timestamp: row.try_get("timestamp")?,
                people_count: row.try_get::<i64, _>("people_count")? as u32,
                density: row.try_get("density")?,
                avg_speed: row.try_get::<Option<f32>, _>("avg_speed")?.unwrap_or(0.0),
                flow_direction: FlowVector {
                    x: row.try_get("flow_x")?,
                    y: row.try_get("flow_y")?,
                },
                congestion_level: CongestionLevel::from_str(
                    &row.try_get::<String, _>("congestion_level")?,
                ),
                risk_score: row.try_get("risk_score")?,
                risk_level: RiskLevel::from_str(&row.try_get::<String, _>("risk_level")?),
            })
        })
        .transpose()
    }

    /// History samples bucketed by `interval` seconds. Buckets holding no
    /// samples are omitted; values are arithmetic means.
    pub async fn history(
        &self,
        camera_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_seconds: i64,
    ) -> Result<Vec<HistoryBucket>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, people_count, density, avg_speed, risk_score
            FROM analytics
            WHERE camera_id = ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(camera_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let interval = Duration::seconds(interval_seconds.max(1));
        let mut buckets: Vec<HistoryBucket> = Vec::new();
        let mut bucket_start = start;
        let mut acc: Vec<(i64, f32, f32, f32)> = Vec::new();
        let mut row_iter = rows.into_iter().peekable();

        while bucket_start < end {
            let bucket_end = bucket_start + interval;

            while let Some(row) = row_iter.peek() {
                let ts: DateTime<Utc> = row.try_get("timestamp")?;
                if ts >= bucket_end {
                    break;
                }
                let row = row_iter.next().unwrap();
                acc.push((
                    row.try_get::<i64, _>("people_count")?,
                    row.try_get::<f32, _>("density")?,
                    row.try_get::<Option<f32>, _>("avg_speed")?.unwrap_or(0.0),
                    row.try_get::<f32, _>("risk_score")?,
                ));
            }

            if !acc.is_empty() {
                let n = acc.len() as f32;
                buckets.push(HistoryBucket {
                    timestamp: bucket_start,
                    people_count: (acc.iter().map(|a| a.0).sum::<i64>() as f32 / n) as i64,
                    density: acc.iter().map(|a| a.1).sum::<f32>() / n,
                    avg_speed: acc.iter().map(|a| a.2).sum::<f32>() / n,
                    risk_score: acc.iter().map(|a| a.3).sum::<f32>() / n,
                });
                acc.clear();
            }

            bucket_start = bucket_end;
        }

        Ok(buckets)
    }

    /// Render a detection heatmap over the trailing `duration` seconds as a
    /// base64 PNG.
    pub async fn heatmap(
        &self,
        camera_id: &str,
        duration_seconds: i64,
        width: u32,
        height: u32,
    ) -> Result<HeatmapPayload> {
        let end = crate::models::now_ms();
        let start = end - Duration::seconds(duration_seconds.max(1));
        let detections = self.store.detections_between(camera_id, start, end).await?;

        let centers: Vec<(f32, f32, f32)> = detections
            .iter()
            .map(|d| {
                let (cx, cy) = d.bbox.center();
                (cx, cy, d.bbox.width.max(d.bbox.height))
            })
            .collect();

        let grid = accumulate_heatmap(&centers, width, height);

        let mut img = image::RgbImage::new(width, height);
        for (i, pixel) in img.pixels_mut().enumerate() {
            *pixel = image::Rgb(colormap_jet(grid[i]));
        }

        let mut png = Vec::new();
        image::codecs::png::PngEncoder::new(std::io::Cursor::new(&mut png))
            .write_image(
                img.as_raw(),
                width,
                height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| crate::error::Error::Internal(format!("PNG encode failed: {e}")))?;

        Ok(HeatmapPayload {
            camera_id: camera_id.to_string(),
            heatmap: base64::engine::general_purpose::STANDARD.encode(&png),
            resolution: Resolution { width, height },
            timestamp: end,
            duration: duration_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_ms;
    use crate::storage::test_pool;

    fn sample(camera: &str, ts: DateTime<Utc>, people: u32, density: f32) -> AnalyticsSample {
        AnalyticsSample {
            camera_id: camera.to_string(),
            timestamp: ts,
            people_count: people,
            density,
            avg_speed: 10.0,
            flow_direction: FlowVector { x: 1.0, y: 0.0 },
            congestion_level: congestion_from_density(density),
            risk_score: density * 0.3,
            risk_level: RiskLevel::Normal,
        }
    }

    #[tokio::test]
    async fn latest_prefers_memory_slot() {
        let service = AnalyticsService::new(test_pool().await, 1000);
        assert_eq!(service.latest("cam_A").await.people_count, 0);

        service.record(sample("cam_A", now_ms(), 3, 0.2)).await;
        assert_eq!(service.latest("cam_A").await.people_count, 3);
    }

    #[tokio::test]
    async fn history_buckets_average_and_skip_empty() {
        let service = AnalyticsService::new(test_pool().await, 1000);
        let t0 = now_ms();

        service.record(sample("cam_A", t0, 2, 0.2)).await;
        service
            .record(sample("cam_A", t0 + Duration::seconds(1), 4, 0.4))
            .await;
        // 60s gap, then one more sample
        service
            .record(sample("cam_A", t0 + Duration::seconds(120), 6, 0.6))
            .await;

        let buckets = service
            .history("cam_A", t0, t0 + Duration::seconds(180), 60)
            .await
            .unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].people_count, 3);
        assert!((buckets[0].density - 0.3).abs() < 1e-5);
        assert_eq!(buckets[1].people_count, 6);
    }

    #[tokio::test]
    async fn heatmap_is_base64_png() {
        let service = AnalyticsService::new(test_pool().await, 1000);
        let payload = service.heatmap("cam_A", 300, 64, 48).await.unwrap();

        let png = base64::engine::general_purpose::STANDARD
            .decode(&payload.heatmap)
            .unwrap();
        assert_eq!(&png[1..4], b"PNG");
        assert_eq!(payload.resolution.width, 64);
        assert_eq!(payload.duration, 300);
    }

    #[tokio::test]
    async fn buffered_rows_flush_after_recovery() {
        let pool = test_pool().await;
        let service = AnalyticsService::new(pool.clone(), 1000);
        let t0 = now_ms();

        // Break the store by dropping the table, write, then restore it
        sqlx::query("ALTER TABLE analytics RENAME TO analytics_hidden")
            .execute(&pool)
            .await
            .unwrap();
        service.record(sample("cam_A", t0, 1, 0.1)).await;

        sqlx::query("ALTER TABLE analytics_hidden RENAME TO analytics")
            .execute(&pool)
            .await
            .unwrap();
        service
            .record(sample("cam_A", t0 + Duration::seconds(1), 2, 0.2))
            .await;

        let buckets = service
            .history("cam_A", t0, t0 + Duration::seconds(10), 10)
            .await
            .unwrap();
        assert_eq!(buckets.len(), 1);
        // Both the buffered row and the new row landed
        assert!((buckets[0].density - 0.15).abs() < 1e-5);
    }
}
