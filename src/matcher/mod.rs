//! Matcher - Cross-Camera Movement Linking
//!
//! ## Responsibilities
//!
//! - Consume persisted entry/exit events asynchronously (never on the
//!   ingest path)
//! - Find the best re-id counterpart on another camera inside the time
//!   window and record a movement
//! - Serve movement queries and statistics
//!
//! A matched movement is stored chronologically: `entry_*` is the earlier
//! observation of the pair, `exit_*` the later one, so `exit_ts >= entry_ts`
//! and `duration_seconds = exit_ts - entry_ts` always hold.

use crate::error::Result;
use crate::models::{now_ms, EntryExitEvent, EventKind};
use crate::reid::cosine_similarity;
use crate::storage::PipelineStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, Mutex};

/// Cross-camera movement record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossCameraMovement {
    pub id: i64,
    pub entry_camera_id: String,
    pub entry_zone_id: Option<i64>,
    pub entry_track_id: u64,
    pub entry_timestamp: DateTime<Utc>,
    pub exit_camera_id: String,
    pub exit_zone_id: Option<i64>,
    pub exit_track_id: u64,
    pub exit_timestamp: DateTime<Utc>,
    pub similarity: f32,
    pub confidence: String,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
}

/// Movement list filters.
#[derive(Debug, Clone, Default)]
pub struct MovementFilter {
    pub entry_camera_id: Option<String>,
    pub exit_camera_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: i64,
}

/// Aggregate statistics over stored movements.
#[derive(Debug, Clone, Serialize)]
pub struct MovementStatistics {
    pub total_movements: i64,
    pub unique_camera_pairs: i64,
    pub avg_duration_seconds: f64,
    pub avg_similarity: f64,
    pub high_confidence_count: i64,
    pub medium_confidence_count: i64,
    pub low_confidence_count: i64,
}

/// Map a similarity score to a confidence label.
pub fn confidence_label(similarity: f32) -> &'static str {
    if similarity >= 0.85 {
        "high"
    } else if similarity >= 0.75 {
        "medium"
    } else {
        "low"
    }
}

/// CrossCameraMatcher instance
pub struct CrossCameraMatcher {
    pool: SqlitePool,
    store: PipelineStore,
    similarity_threshold: f32,
    time_window: Duration,
    tx: mpsc::UnboundedSender<EntryExitEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<EntryExitEvent>>>,
}

impl CrossCameraMatcher {
    pub fn new(pool: SqlitePool, similarity_threshold: f32, time_window: std::time::Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store: PipelineStore::new(pool.clone()),
            pool,
            similarity_threshold,
            time_window: Duration::from_std(time_window).unwrap_or_else(|_| Duration::minutes(10)),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Hand an event to the matcher worker. Non-blocking; called from the
    /// camera workers.
    pub fn submit(&self, event: EntryExitEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Matcher worker is gone, dropping event");
        }
    }

    /// Spawn the matcher worker. Call once at startup.
    pub fn start(self: &std::sync::Arc<Self>) {
        let matcher = self.clone();
        tokio::spawn(async move {
            let mut rx = match matcher.rx.lock().await.take() {
                Some(rx) => rx,
                None => {
                    tracing::warn!("Matcher already started");
                    return;
                }
            };
            tracing::info!("Cross-camera matcher started");
            while let Some(event) = rx.recv().await {
                if let Err(e) = matcher.handle_event(&event).await {
                    tracing::warn!(
                        event_id = event.id,
                        camera_id = %event.camera_id,
                        error = %e,
                        "Cross-camera matching failed"
                    );
                }
            }
            tracing::info!("Cross-camera matcher stopped");
        });
    }

    /// Match one event against counterpart events on other cameras.
    pub async fn handle_event(&self, event: &EntryExitEvent) -> Result<()> {
        let Some(embedding) = self
            .store
            .track_embedding(&event.camera_id, event.track_id)
            .await?
        else {
            tracing::debug!(
                camera_id = %event.camera_id,
                track_id = event.track_id,
                "No embedding for event track, skipping match"
            );
            return Ok(());
        };

        // An entry looks back for the exit that preceded it; an exit looks
        // ahead for an entry that followed (covers late-arriving events).
        let (counterpart_kind, window_start, window_end) = match event.event_type {
            EventKind::Entry => (
                EventKind::Exit,
                event.timestamp - self.time_window,
                event.timestamp,
            ),
            EventKind::Exit => (
                EventKind::Entry,
                event.timestamp,
                event.timestamp + self.time_window,
            ),
        };

        let candidates = self
            .candidate_events(&event.camera_id, counterpart_kind, window_start, window_end)
            .await?;

        let mut best: Option<(f32, i64, EntryExitEvent)> = None;
        for candidate in candidates {
            let Some(candidate_embedding) = self
                .store
                .track_embedding(&candidate.camera_id, candidate.track_id)
                .await?
            else {
                continue;
            };

            let similarity = cosine_similarity(&embedding, &candidate_embedding);
            if similarity < self.similarity_threshold {
                continue;
            }

            let dt = (candidate.timestamp - event.timestamp).num_milliseconds().abs();
            let better = match &best {
                None => true,
                Some((best_sim, best_dt, _)) => {
                    similarity > *best_sim || (similarity == *best_sim && dt < *best_dt)
                }
            };
            if better {
                best = Some((similarity, dt, candidate));
            }
        }

        let Some((similarity, _, matched)) = best else {
            return Ok(());
        };

        // Store chronologically: the earlier observation is the entry side.
        let (first, second) = if matched.timestamp <= event.timestamp {
            (&matched, event)
        } else {
            (event, &matched)
        };
        self.upsert_movement(first, second, similarity).await?;
        Ok(())
    }

    async fn candidate_events(
        &self,
        exclude_camera: &str,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EntryExitEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, camera_id, zone_id, track_id, event_type, timestamp
            FROM entry_exit_events
            WHERE event_type = ? AND camera_id != ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(kind.as_str())
        .bind(exclude_camera)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(EntryExitEvent {
                id: row.try_get("id")?,
                camera_id: row.try_get("camera_id")?,
                zone_id: row.try_get::<Option<i64>, _>("zone_id")?.unwrap_or_default(),
                track_id: row.try_get::<i64, _>("track_id")? as u64,
                event_type: if kind == EventKind::Exit {
                    EventKind::Exit
                } else {
                    EventKind::Entry
                },
                timestamp: row.try_get("timestamp")?,
            });
        }
        Ok(events)
    }

    /// Insert the movement, or on the same four-way key keep the stored row
    /// unless the new similarity is strictly higher.
    async fn upsert_movement(
        &self,
        first: &EntryExitEvent,
        second: &EntryExitEvent,
        similarity: f32,
    ) -> Result<()> {
        let duration = (second.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
        let confidence = confidence_label(similarity);

        let result = sqlx::query(
            r#"
            INSERT INTO cross_camera_movements (
                entry_camera_id, entry_zone_id, entry_track_id, entry_timestamp,
                exit_camera_id, exit_zone_id, exit_track_id, exit_timestamp,
                similarity, confidence, duration_seconds, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entry_camera_id, entry_track_id, exit_camera_id, exit_track_id)
            DO UPDATE SET
                similarity = excluded.similarity,
                confidence = excluded.confidence,
                entry_timestamp = excluded.entry_timestamp,
                exit_timestamp = excluded.exit_timestamp,
                duration_seconds = excluded.duration_seconds
            WHERE excluded.similarity > cross_camera_movements.similarity
            "#,
        )
        .bind(&first.camera_id)
        .bind(first.zone_id)
        .bind(first.track_id as i64)
        .bind(first.timestamp)
        .bind(&second.camera_id)
        .bind(second.zone_id)
        .bind(second.track_id as i64)
        .bind(second.timestamp)
        .bind(similarity)
        .bind(confidence)
        .bind(duration)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(
                entry_camera = %first.camera_id,
                entry_track = first.track_id,
                exit_camera = %second.camera_id,
                exit_track = second.track_id,
                similarity,
                duration_seconds = duration,
                "Cross-camera movement recorded"
            );
        }
        Ok(())
    }

    /// Query movements, newest entry first.
    pub async fn movements(&self, filter: &MovementFilter) -> Result<Vec<CrossCameraMovement>> {
        let limit = if filter.limit > 0 { filter.limit } else { 100 };

        let mut sql = String::from(
            "SELECT id, entry_camera_id, entry_zone_id, entry_track_id, entry_timestamp, \
                    exit_camera_id, exit_zone_id, exit_track_id, exit_timestamp, \
                    similarity, confidence, duration_seconds, created_at \
             FROM cross_camera_movements WHERE 1 = 1",
        );
        if filter.entry_camera_id.is_some() {
            sql.push_str(" AND entry_camera_id = ?");
        }
        if filter.exit_camera_id.is_some() {
            sql.push_str(" AND exit_camera_id = ?");
        }
        if filter.start_time.is_some() {
            sql.push_str(" AND entry_timestamp >= ?");
        }
        if filter.end_time.is_some() {
            sql.push_str(" AND exit_timestamp <= ?");
        }
        sql.push_str(" ORDER BY entry_timestamp DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(v) = &filter.entry_camera_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.exit_camera_id {
            query = query.bind(v);
        }
        if let Some(v) = filter.start_time {
            query = query.bind(v);
        }
        if let Some(v) = filter.end_time {
            query = query.bind(v);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_movement).collect()
    }

    /// Movements touching a camera on either side.
    pub async fn movements_for_camera(
        &self,
        camera_id: &str,
        limit: i64,
    ) -> Result<Vec<CrossCameraMovement>> {
        let rows = sqlx::query(
            "SELECT id, entry_camera_id, entry_zone_id, entry_track_id, entry_timestamp, \
                    exit_camera_id, exit_zone_id, exit_track_id, exit_timestamp, \
                    similarity, confidence, duration_seconds, created_at \
             FROM cross_camera_movements \
             WHERE entry_camera_id = ? OR exit_camera_id = ? \
             ORDER BY entry_timestamp DESC LIMIT ?",
        )
        .bind(camera_id)
        .bind(camera_id)
        .bind(if limit > 0 { limit } else { 100 })
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_movement).collect()
    }

    /// Aggregate statistics over the stored movements.
    pub async fn statistics(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<MovementStatistics> {
        let movements = self
            .movements(&MovementFilter {
                start_time,
                end_time,
                limit: i64::MAX,
                ..Default::default()
            })
            .await?;

        if movements.is_empty() {
            return Ok(MovementStatistics {
                total_movements: 0,
                unique_camera_pairs: 0,
                avg_duration_seconds: 0.0,
                avg_similarity: 0.0,
                high_confidence_count: 0,
                medium_confidence_count: 0,
                low_confidence_count: 0,
            });
        }

        let mut pairs = std::collections::HashSet::new();
        let (mut high, mut medium, mut low) = (0i64, 0i64, 0i64);
        for movement in &movements {
            pairs.insert((movement.entry_camera_id.clone(), movement.exit_camera_id.clone()));
            match movement.confidence.as_str() {
                "high" => high += 1,
                "medium" => medium += 1,
                _ => low += 1,
            }
        }

        let n = movements.len() as f64;
        Ok(MovementStatistics {
            total_movements: movements.len() as i64,
            unique_camera_pairs: pairs.len() as i64,
            avg_duration_seconds: movements.iter().map(|m| m.duration_seconds).sum::<f64>() / n,
            avg_similarity: movements.iter().map(|m| m.similarity as f64).sum::<f64>() / n,
            high_confidence_count: high,
            medium_confidence_count: medium,
            low_confidence_count: low,
        })
    }

    fn row_to_movement(row: &sqlx::sqlite::SqliteRow) -> Result<CrossCameraMovement> {
        Ok(CrossCameraMovement {
            id: row.try_get("id")?,
            entry_camera_id: row.try_get("entry_camera_id")?,
            entry_zone_id: row.try_get("entry_zone_id")?,
            entry_track_id: row.try_get::<i64, _>("entry_track_id")? as u64,
            entry_timestamp: row.try_get("entry_timestamp")?,
            exit_camera_id: row.try_get("exit_camera_id")?,
            exit_zone_id: row.try_get("exit_zone_id")?,
            exit_track_id: row.try_get::<i64, _>("exit_track_id")? as u64,
            exit_timestamp: row.try_get("exit_timestamp")?,
            similarity: row.try_get("similarity")?,
            confidence: row.try_get("confidence")?,
            duration_seconds: row.try_get("duration_seconds")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BBox, TrackSnapshot, TrackState};
    use crate::storage::test_pool;

    fn snapshot(id: u64) -> TrackSnapshot {
        TrackSnapshot {
            track_id: id,
            bbox: BBox::new(10.0, 10.0, 40.0, 80.0),
            confidence: 0.9,
            state: TrackState::Confirmed,
            total_frames: 5,
        }
    }

    /// Unit embedding pair with an exact cosine similarity.
    fn embedding_pair(similarity: f32) -> (Vec<f32>, Vec<f32>) {
        let a = vec![1.0, 0.0];
        let b = vec![similarity, (1.0 - similarity * similarity).sqrt()];
        (a, b)
    }

    async fn seed(
        store: &PipelineStore,
        pool: &SqlitePool,
        camera: &str,
        track: u64,
        kind: EventKind,
        ts: DateTime<Utc>,
        embedding: &[f32],
    ) -> EntryExitEvent {
        store
            .upsert_track(camera, &snapshot(track), 0.9, ts, ts, Some(embedding))
            .await
            .unwrap();
        let result = sqlx::query(
            "INSERT INTO entry_exit_events (camera_id, zone_id, track_id, event_type, timestamp) \
             VALUES (?, 1, ?, ?, ?)",
        )
        .bind(camera)
        .bind(track as i64)
        .bind(kind.as_str())
        .bind(ts)
        .execute(pool)
        .await
        .unwrap();

        EntryExitEvent {
            id: result.last_insert_rowid(),
            camera_id: camera.to_string(),
            zone_id: 1,
            track_id: track,
            event_type: kind,
            timestamp: ts,
        }
    }

    fn matcher(pool: SqlitePool) -> CrossCameraMatcher {
        CrossCameraMatcher::new(pool, 0.7, std::time::Duration::from_secs(600))
    }

    #[tokio::test]
    async fn exit_then_entry_produces_ordered_movement() {
        let pool = test_pool().await;
        let m = matcher(pool.clone());
        let store = PipelineStore::new(pool.clone());
        let t0 = now_ms();
        let (e_a, e_b) = embedding_pair(0.82);

        seed(&store, &pool, "cam_A", 1, EventKind::Exit, t0, &e_a).await;
        let entry = seed(
            &store,
            &pool,
            "cam_B",
            7,
            EventKind::Entry,
            t0 + Duration::seconds(120),
            &e_b,
        )
        .await;

        m.handle_event(&entry).await.unwrap();

        let movements = m.movements(&MovementFilter::default()).await.unwrap();
        assert_eq!(movements.len(), 1);
        let movement = &movements[0];
        assert_eq!(movement.entry_camera_id, "cam_A");
        assert_eq!(movement.exit_camera_id, "cam_B");
        assert!(movement.exit_timestamp >= movement.entry_timestamp);
        assert!((movement.duration_seconds - 120.0).abs() < 1.0);
        assert_eq!(movement.confidence, "medium");
        assert!(movement.similarity >= 0.70);
    }

    #[tokio::test]
    async fn below_threshold_similarity_does_not_match() {
        let pool = test_pool().await;
        let m = matcher(pool.clone());
        let store = PipelineStore::new(pool.clone());
        let t0 = now_ms();
        let (e_a, e_b) = embedding_pair(0.5);

        seed(&store, &pool, "cam_A", 1, EventKind::Exit, t0, &e_a).await;
        let entry = seed(
            &store,
            &pool,
            "cam_B",
            2,
            EventKind::Entry,
            t0 + Duration::seconds(60),
            &e_b,
        )
        .await;

        m.handle_event(&entry).await.unwrap();
        assert!(m.movements(&MovementFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outside_window_does_not_match() {
        let pool = test_pool().await;
        let m = matcher(pool.clone());
        let store = PipelineStore::new(pool.clone());
        let t0 = now_ms();
        let (e_a, e_b) = embedding_pair(0.9);

        seed(&store, &pool, "cam_A", 1, EventKind::Exit, t0, &e_a).await;
        let entry = seed(
            &store,
            &pool,
            "cam_B",
            2,
            EventKind::Entry,
            t0 + Duration::minutes(11),
            &e_b,
        )
        .await;

        m.handle_event(&entry).await.unwrap();
        assert!(m.movements(&MovementFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_camera_is_never_matched() {
        let pool = test_pool().await;
        let m = matcher(pool.clone());
        let store = PipelineStore::new(pool.clone());
        let t0 = now_ms();
        let (e_a, e_b) = embedding_pair(0.95);

        seed(&store, &pool, "cam_A", 1, EventKind::Exit, t0, &e_a).await;
        let entry = seed(
            &store,
            &pool,
            "cam_A",
            2,
            EventKind::Entry,
            t0 + Duration::seconds(30),
            &e_b,
        )
        .await;

        m.handle_event(&entry).await.unwrap();
        assert!(m.movements(&MovementFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rematch_keeps_higher_similarity_only() {
        let pool = test_pool().await;
        let m = matcher(pool.clone());
        let store = PipelineStore::new(pool.clone());
        let t0 = now_ms();

        let (e_a, e_b) = embedding_pair(0.76);
        seed(&store, &pool, "cam_A", 1, EventKind::Exit, t0, &e_a).await;
        let entry = seed(
            &store,
            &pool,
            "cam_B",
            2,
            EventKind::Entry,
            t0 + Duration::seconds(60),
            &e_b,
        )
        .await;
        m.handle_event(&entry).await.unwrap();
        let first = m.movements(&MovementFilter::default()).await.unwrap()[0].clone();

        // Embedding drifted closer; re-matching replaces the similarity
        let (e_a2, e_b2) = embedding_pair(0.9);
        store
            .upsert_track("cam_A", &snapshot(1), 0.9, t0, t0, Some(&e_a2))
            .await
            .unwrap();
        store
            .upsert_track("cam_B", &snapshot(2), 0.9, t0, t0, Some(&e_b2))
            .await
            .unwrap();
        m.handle_event(&entry).await.unwrap();

        let movements = m.movements(&MovementFilter::default()).await.unwrap();
        assert_eq!(movements.len(), 1);
        assert!(movements[0].similarity > first.similarity);
        assert_eq!(movements[0].confidence, "high");

        // Lower similarity never overwrites
        let (e_a3, e_b3) = embedding_pair(0.71);
        store
            .upsert_track("cam_A", &snapshot(1), 0.9, t0, t0, Some(&e_a3))
            .await
            .unwrap();
        store
            .upsert_track("cam_B", &snapshot(2), 0.9, t0, t0, Some(&e_b3))
            .await
            .unwrap();
        m.handle_event(&entry).await.unwrap();
        let movements = m.movements(&MovementFilter::default()).await.unwrap();
        assert!(movements[0].similarity > 0.85);
    }

    #[tokio::test]
    async fn best_candidate_wins() {
        let pool = test_pool().await;
        let m = matcher(pool.clone());
        let store = PipelineStore::new(pool.clone());
        let t0 = now_ms();

        let probe = vec![1.0, 0.0];
        let close = vec![0.99, (1.0f32 - 0.99 * 0.99).sqrt()];
        let far = vec![0.72, (1.0f32 - 0.72 * 0.72).sqrt()];

        seed(&store, &pool, "cam_B", 1, EventKind::Exit, t0, &far).await;
        seed(
            &store,
            &pool,
            "cam_C",
            2,
            EventKind::Exit,
            t0 + Duration::seconds(10),
            &close,
        )
        .await;
        let entry = seed(
            &store,
            &pool,
            "cam_A",
            3,
            EventKind::Entry,
            t0 + Duration::seconds(60),
            &probe,
        )
        .await;

        m.handle_event(&entry).await.unwrap();
        let movements = m.movements(&MovementFilter::default()).await.unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].entry_camera_id, "cam_C");
    }

    #[tokio::test]
    async fn statistics_aggregate() {
        let pool = test_pool().await;
        let m = matcher(pool.clone());
        let store = PipelineStore::new(pool.clone());
        let t0 = now_ms();
        let (e_a, e_b) = embedding_pair(0.88);

        seed(&store, &pool, "cam_A", 1, EventKind::Exit, t0, &e_a).await;
        let entry = seed(
            &store,
            &pool,
            "cam_B",
            2,
            EventKind::Entry,
            t0 + Duration::seconds(30),
            &e_b,
        )
        .await;
        m.handle_event(&entry).await.unwrap();

        let stats = m.statistics(None, None).await.unwrap();
        assert_eq!(stats.total_movements, 1);
        assert_eq!(stats.unique_camera_pairs, 1);
        assert_eq!(stats.high_confidence_count, 1);
        assert!(stats.avg_similarity > 0.85);
    }
}
