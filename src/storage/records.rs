//! Row repository for the per-frame pipeline artifacts: frame metadata,
//! detections and track rows (with their re-id embeddings).

use super::{decode_embedding, encode_embedding};
use crate::error::Result;
use crate::models::{BBox, Detection, TrackSnapshot};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// A detection row loaded back for heatmaps and stream fallbacks.
#[derive(Debug, Clone)]
pub struct DetectionRow {
    pub bbox: BBox,
    pub confidence: f32,
    pub track_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PipelineStore {
    pool: SqlitePool,
}

impl PipelineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one frame's metadata row, returning its rowid.
    pub async fn insert_frame(
        &self,
        camera_id: &str,
        frame_id: u64,
        timestamp: DateTime<Utc>,
        width: u32,
        height: u32,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO frames (camera_id, frame_id, timestamp, width, height)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(camera_id)
        .bind(frame_id as i64)
        .bind(timestamp)
        .bind(width)
        .bind(height)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Insert the frame's detections with their matched track ids.
    pub async fn insert_detections(
        &self,
        frame_ref: i64,
        camera_id: &str,
        detections: &[Detection],
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        for det in detections {
            sqlx::query(
                r#"
                INSERT INTO detections (frame_ref, camera_id, track_id,
                                        bbox_x, bbox_y, bbox_width, bbox_height,
                                        confidence, timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(frame_ref)
            .bind(camera_id)
            .bind(det.track_id.map(|t| t as i64))
            .bind(det.bbox.x)
            .bind(det.bbox.y)
            .bind(det.bbox.width)
            .bind(det.bbox.height)
            .bind(det.confidence)
            .bind(timestamp)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Create or update a track row. The embedding replaces any stored one.
    pub async fn upsert_track(
        &self,
        camera_id: &str,
        track: &TrackSnapshot,
        avg_confidence: f32,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
        embedding: Option<&[f32]>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracks (track_id, camera_id, first_seen, last_seen,
                                total_frames, avg_confidence, state, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(camera_id, track_id) DO UPDATE SET
                last_seen = excluded.last_seen,
                total_frames = excluded.total_frames,
                avg_confidence = excluded.avg_confidence,
                state = excluded.state,
                embedding = COALESCE(excluded.embedding, tracks.embedding)
            "#,
        )
        .bind(track.track_id as i64)
        .bind(camera_id)
        .bind(first_seen)
        .bind(last_seen)
        .bind(track.total_frames)
        .bind(avg_confidence)
        .bind("confirmed")
        .bind(embedding.map(encode_embedding))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stored embedding for a track, if any.
    pub async fn track_embedding(&self, camera_id: &str, track_id: u64) -> Result<Option<Vec<f32>>> {
        let row = sqlx::query(
            "SELECT embedding FROM tracks WHERE camera_id = ? AND track_id = ?",
        )
        .bind(camera_id)
        .bind(track_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .and_then(|r| r.try_get::<Option<Vec<u8>>, _>("embedding").ok().flatten())
            .map(|blob| decode_embedding(&blob)))
    }

    /// Detections for a camera in a time window, oldest first.
    pub async fn detections_between(
        &self,
        camera_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DetectionRow>> {
        let rows = sqlx::query(
            r#"
            SELECT bbox_x, bbox_y, bbox_width, bbox_height, confidence, track_id, timestamp
            FROM detections
            WHERE camera_id = ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(camera_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut detections = Vec::with_capacity(rows.len());
        for row in rows {
            detections.push(DetectionRow {
                bbox: BBox::new(
                    row.try_get("bbox_x")?,
                    row.try_get("bbox_y")?,
                    row.try_get("bbox_width")?,
                    row.try_get("bbox_height")?,
                ),
                confidence: row.try_get("confidence")?,
                track_id: row.try_get::<Option<i64>, _>("track_id")?.map(|t| t as u64),
                timestamp: row.try_get("timestamp")?,
            });
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_ms, TrackState};
    use crate::storage::test_pool;

    fn snapshot(id: u64) -> TrackSnapshot {
        TrackSnapshot {
            track_id: id,
            bbox: BBox::new(10.0, 10.0, 40.0, 80.0),
            confidence: 0.9,
            state: TrackState::Confirmed,
            total_frames: 3,
        }
    }

    #[tokio::test]
    async fn frame_and_detection_round_trip() {
        let store = PipelineStore::new(test_pool().await);
        let ts = now_ms();

        let frame_ref = store
            .insert_frame("cam_A", 1, ts, 640, 480)
            .await
            .unwrap();
        let dets = vec![Detection {
            bbox: BBox::new(5.0, 6.0, 30.0, 60.0),
            confidence: 0.8,
            track_id: Some(1),
        }];
        store
            .insert_detections(frame_ref, "cam_A", &dets, ts)
            .await
            .unwrap();

        let loaded = store
            .detections_between("cam_A", ts - chrono::Duration::seconds(1), ts)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].track_id, Some(1));
        assert_eq!(loaded[0].bbox.width, 30.0);
    }

    #[tokio::test]
    async fn duplicate_frame_id_is_rejected_by_schema() {
        let store = PipelineStore::new(test_pool().await);
        let ts = now_ms();
        store.insert_frame("cam_A", 7, ts, 640, 480).await.unwrap();
        assert!(store.insert_frame("cam_A", 7, ts, 640, 480).await.is_err());
    }

    #[tokio::test]
    async fn track_upsert_keeps_embedding_when_absent() {
        let store = PipelineStore::new(test_pool().await);
        let ts = now_ms();
        let embedding = vec![0.6f32; 4];

        store
            .upsert_track("cam_A", &snapshot(1), 0.9, ts, ts, Some(&embedding))
            .await
            .unwrap();
        store
            .upsert_track("cam_A", &snapshot(1), 0.85, ts, ts, None)
            .await
            .unwrap();

        let stored = store.track_embedding("cam_A", 1).await.unwrap().unwrap();
        assert_eq!(stored, embedding);
    }
}
