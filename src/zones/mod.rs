//! Zones - Regions of Interest and Entry/Exit Evaluation
//!
//! ## Responsibilities
//!
//! - Zone CRUD (soft delete) with polygon validation
//! - Cached zone lookups for the per-frame hot path
//! - Per-camera entry/exit edge detection and occupancy accounting
//!
//! The evaluator state (which track is inside which zone) is owned by the
//! camera worker; the service owns the records and live occupancy counts.

mod evaluator;

pub use evaluator::{ZoneCrossing, ZoneEvaluator, ZoneFrameResult};

use crate::error::{Error, Result};
use crate::models::{EntryExitEvent, EventKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Zone record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: i64,
    pub camera_id: String,
    pub zone_name: String,
    pub zone_type: Option<String>,
    pub polygon_coords: Vec<[i64; 2]>,
    pub max_capacity: Option<i64>,
    pub current_occupancy: i64,
    pub status: String,
}

/// Zone create/update request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRequest {
    pub camera_id: String,
    pub zone_name: String,
    pub zone_type: Option<String>,
    pub polygon_coords: Vec<[i64; 2]>,
    pub max_capacity: Option<i64>,
}

/// Ray-casting point-in-polygon test.
pub fn point_in_polygon(x: f32, y: f32, polygon: &[[i64; 2]]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let (mut p1x, mut p1y) = (polygon[0][0] as f32, polygon[0][1] as f32);
    for i in 1..=n {
        let (p2x, p2y) = (polygon[i % n][0] as f32, polygon[i % n][1] as f32);
        if y > p1y.min(p2y) && y <= p1y.max(p2y) && x <= p1x.max(p2x) {
            let xinters = if (p1y - p2y).abs() > f32::EPSILON {
                (y - p1y) * (p2x - p1x) / (p2y - p1y) + p1x
            } else {
                f32::INFINITY
            };
            if (p1x - p2x).abs() < f32::EPSILON || x <= xinters {
                inside = !inside;
            }
        }
        (p1x, p1y) = (p2x, p2y);
    }
    inside
}

/// Validate a polygon: at least 3 points, no self-intersection.
pub fn validate_polygon(polygon: &[[i64; 2]]) -> Result<()> {
    if polygon.len() < 3 {
        return Err(Error::Validation(
            "Zone polygon needs at least 3 points".into(),
        ));
    }

    let n = polygon.len();
    for i in 0..n {
        let a1 = polygon[i];
        let a2 = polygon[(i + 1) % n];
        for j in (i + 1)..n {
            // Skip edges sharing a vertex
            if j == i || (j + 1) % n == i || (i + 1) % n == j {
                continue;
            }
            let b1 = polygon[j];
            let b2 = polygon[(j + 1) % n];
            if segments_intersect(a1, a2, b1, b2) {
                return Err(Error::Validation("Zone polygon is self-intersecting".into()));
            }
        }
    }
    Ok(())
}

fn segments_intersect(a1: [i64; 2], a2: [i64; 2], b1: [i64; 2], b2: [i64; 2]) -> bool {
    fn orient(p: [i64; 2], q: [i64; 2], r: [i64; 2]) -> i64 {
        ((q[0] - p[0]) * (r[1] - p[1]) - (q[1] - p[1]) * (r[0] - p[0])).signum()
    }
    let d1 = orient(b1, b2, a1);
    let d2 = orient(b1, b2, a2);
    let d3 = orient(a1, a2, b1);
    let d4 = orient(a1, a2, b2);
    d1 != d2 && d3 != d4
}

/// ZoneService instance
pub struct ZoneService {
    pool: SqlitePool,
    /// camera_id -> active zones
    cache: RwLock<HashMap<String, Vec<Zone>>>,
    /// zone_id -> live inside-count from the most recent evaluated frame
    live_counts: RwLock<HashMap<i64, i64>>,
}

impl ZoneService {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let service = Self {
            pool,
            cache: RwLock::new(HashMap::new()),
            live_counts: RwLock::new(HashMap::new()),
        };
        service.refresh_cache().await?;
        Ok(service)
    }

    pub async fn refresh_cache(&self) -> Result<()> {
        let zones = self.fetch_active().await?;
        let mut cache = self.cache.write().await;
        cache.clear();
        for zone in zones {
            cache.entry(zone.camera_id.clone()).or_default().push(zone);
        }
        Ok(())
    }

    /// Create a zone after validating the polygon.
    pub async fn create(&self, req: ZoneRequest) -> Result<Zone> {
        validate_polygon(&req.polygon_coords)?;

        let coords = serde_json::to_string(&req.polygon_coords)?;
        let result = sqlx::query(
            r#"
            INSERT INTO zones (camera_id, zone_name, zone_type, polygon_coords,
                               max_capacity, current_occupancy, status)
            VALUES (?, ?, ?, ?, ?, 0, 'active')
            "#,
        )
        .bind(&req.camera_id)
        .bind(&req.zone_name)
        .bind(&req.zone_type)
        .bind(&coords)
        .bind(req.max_capacity)
        .execute(&self.pool)
        .await?;

        self.refresh_cache().await?;
        let id = result.last_insert_rowid();
        tracing::info!(zone_id = id, camera_id = %req.camera_id, "Zone created");
        self.get(id).await
    }

    /// Get an active zone by id.
    pub async fn get(&self, zone_id: i64) -> Result<Zone> {
        let row = sqlx::query(
            r#"
            SELECT id, camera_id, zone_name, zone_type, polygon_coords,
                   max_capacity, current_occupancy, status
            FROM zones WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_zone(&row),
            None => Err(Error::NotFound("Zone not found".into())),
        }
    }

    /// Active zones of a camera (from cache), occupancy patched with the
    /// latest evaluated inside-counts.
    pub async fn zones_for_camera(&self, camera_id: &str) -> Vec<Zone> {
        let cache = self.cache.read().await;
        let live = self.live_counts.read().await;
        cache
            .get(camera_id)
            .map(|zones| {
                zones
                    .iter()
                    .map(|z| {
                        let mut zone = z.clone();
                        if let Some(count) = live.get(&zone.id) {
                            zone.current_occupancy = *count;
                        }
                        zone
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Update a zone in place.
    pub async fn update(&self, zone_id: i64, req: ZoneRequest) -> Result<Zone> {
        validate_polygon(&req.polygon_coords)?;
        self.get(zone_id).await?;

        let coords = serde_json::to_string(&req.polygon_coords)?;
        sqlx::query(
            r#"
            UPDATE zones
            SET zone_name = ?, zone_type = ?, polygon_coords = ?, max_capacity = ?
            WHERE id = ?
            "#,
        )
        .bind(&req.zone_name)
        .bind(&req.zone_type)
        .bind(&coords)
        .bind(req.max_capacity)
        .bind(zone_id)
        .execute(&self.pool)
        .await?;

        self.refresh_cache().await?;
        self.get(zone_id).await
    }

    /// Soft-delete a zone. Deleted zones drop out of evaluation and reads.
    pub async fn delete(&self, zone_id: i64) -> Result<()> {
        self.get(zone_id).await?;
        sqlx::query("UPDATE zones SET status = 'inactive' WHERE id = ?")
            .bind(zone_id)
            .execute(&self.pool)
            .await?;
        self.refresh_cache().await?;
        self.live_counts.write().await.remove(&zone_id);
        tracing::info!(zone_id, "Zone deleted");
        Ok(())
    }

    /// Persist one entry/exit event and return the stored record.
    pub async fn record_event(
        &self,
        camera_id: &str,
        zone_id: i64,
        track_id: u64,
        kind: EventKind,
        timestamp: DateTime<Utc>,
    ) -> Result<EntryExitEvent> {
        let result = sqlx::query(
            r#"
            INSERT INTO entry_exit_events (camera_id, zone_id, track_id, event_type, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(camera_id)
        .bind(zone_id)
        .bind(track_id as i64)
        .bind(kind.as_str())
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        Ok(EntryExitEvent {
            id: result.last_insert_rowid(),
            camera_id: camera_id.to_string(),
            zone_id,
            track_id,
            event_type: kind,
            timestamp,
        })
    }

    /// Apply an occupancy delta for a zone. Clamped at zero; the new stored
    /// value is returned.
    pub async fn adjust_occupancy(&self, zone_id: i64, delta: i64) -> Result<i64> {
        sqlx::query(
            "UPDATE zones SET current_occupancy = MAX(0, current_occupancy + ?) WHERE id = ?",
        )
        .bind(delta)
        .bind(zone_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT current_occupancy FROM zones WHERE id = ?")
            .bind(zone_id)
            .fetch_one(&self.pool)
            .await?;
        let occupancy: i64 = row.try_get("current_occupancy")?;

        // Patch the cache without a full refresh
        let mut cache = self.cache.write().await;
        for zones in cache.values_mut() {
            if let Some(zone) = zones.iter_mut().find(|z| z.id == zone_id) {
                zone.current_occupancy = occupancy;
            }
        }
        Ok(occupancy)
    }

    /// Record the latest inside-counts from a frame evaluation.
    pub async fn set_live_counts(&self, counts: &HashMap<i64, i64>) {
        let mut live = self.live_counts.write().await;
        for (zone_id, count) in counts {
            live.insert(*zone_id, *count);
        }
    }

    /// Recent entry/exit events for a camera, newest first, plus totals.
    pub async fn recent_events(
        &self,
        camera_id: &str,
        limit: i64,
    ) -> Result<(i64, i64, Vec<EntryExitEvent>)> {
        let rows = sqlx::query(
            r#"
            SELECT id, camera_id, zone_id, track_id, event_type, timestamp
            FROM entry_exit_events
            WHERE camera_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(camera_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("event_type")?;
            events.push(EntryExitEvent {
                id: row.try_get("id")?,
                camera_id: row.try_get("camera_id")?,
                zone_id: row.try_get::<Option<i64>, _>("zone_id")?.unwrap_or_default(),
                track_id: row.try_get::<i64, _>("track_id")? as u64,
                event_type: if kind == "exit" {
                    EventKind::Exit
                } else {
                    EventKind::Entry
                },
                timestamp: row.try_get("timestamp")?,
            });
        }

        let totals = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN event_type = 'entry' THEN 1 ELSE 0 END) AS entries,
                SUM(CASE WHEN event_type = 'exit' THEN 1 ELSE 0 END) AS exits
            FROM entry_exit_events WHERE camera_id = ?
            "#,
        )
        .bind(camera_id)
        .fetch_one(&self.pool)
        .await?;
        let entry_count: i64 = totals.try_get::<Option<i64>, _>("entries")?.unwrap_or(0);
        let exit_count: i64 = totals.try_get::<Option<i64>, _>("exits")?.unwrap_or(0);

        Ok((entry_count, exit_count, events))
    }

    async fn fetch_active(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query(
            r#"
            SELECT id, camera_id, zone_name, zone_type, polygon_coords,
                   max_capacity, current_occupancy, status
            FROM zones WHERE status = 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_zone).collect()
    }

    fn row_to_zone(row: &sqlx::sqlite::SqliteRow) -> Result<Zone> {
        let coords: String = row.try_get("polygon_coords")?;
        Ok(Zone {
            id: row.try_get("id")?,
            camera_id: row.try_get("camera_id")?,
            zone_name: row.try_get("zone_name")?,
            zone_type: row.try_get("zone_type")?,
            polygon_coords: serde_json::from_str(&coords)?,
            max_capacity: row.try_get("max_capacity")?,
            current_occupancy: row.try_get("current_occupancy")?,
            status: row.try_get("status")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_ms;
    use crate::storage::test_pool;

    fn square() -> Vec<[i64; 2]> {
        vec![[0, 0], [320, 0], [320, 480], [0, 480]]
    }

    fn req(camera: &str) -> ZoneRequest {
        ZoneRequest {
            camera_id: camera.to_string(),
            zone_name: "west half".to_string(),
            zone_type: Some("entry".to_string()),
            polygon_coords: square(),
            max_capacity: Some(10),
        }
    }

    #[test]
    fn point_in_polygon_basic() {
        let poly = square();
        assert!(point_in_polygon(100.0, 100.0, &poly));
        assert!(!point_in_polygon(400.0, 100.0, &poly));
    }

    #[test]
    fn polygon_validation() {
        assert!(validate_polygon(&[[0, 0], [1, 1]]).is_err());
        assert!(validate_polygon(&square()).is_ok());
        // Bowtie self-intersects
        let bowtie = vec![[0, 0], [100, 100], [100, 0], [0, 100]];
        assert!(validate_polygon(&bowtie).is_err());
    }

    #[tokio::test]
    async fn zone_lifecycle_is_closed() {
        let service = ZoneService::new(test_pool().await).await.unwrap();

        let zone = service.create(req("cam_A")).await.unwrap();
        assert_eq!(zone.current_occupancy, 0);
        assert_eq!(zone.status, "active");

        let fetched = service.get(zone.id).await.unwrap();
        assert_eq!(fetched.zone_name, "west half");

        let mut update = req("cam_A");
        update.zone_name = "east half".to_string();
        let updated = service.update(zone.id, update).await.unwrap();
        assert_eq!(updated.zone_name, "east half");

        service.delete(zone.id).await.unwrap();
        assert!(matches!(
            service.get(zone.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(service.zones_for_camera("cam_A").await.is_empty());
    }

    #[tokio::test]
    async fn invalid_polygon_is_rejected() {
        let service = ZoneService::new(test_pool().await).await.unwrap();
        let mut bad = req("cam_A");
        bad.polygon_coords = vec![[0, 0], [1, 1]];
        assert!(matches!(
            service.create(bad).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn occupancy_clamps_at_zero() {
        let service = ZoneService::new(test_pool().await).await.unwrap();
        let zone = service.create(req("cam_A")).await.unwrap();

        assert_eq!(service.adjust_occupancy(zone.id, 2).await.unwrap(), 2);
        assert_eq!(service.adjust_occupancy(zone.id, -5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_events_counts() {
        let service = ZoneService::new(test_pool().await).await.unwrap();
        let zone = service.create(req("cam_A")).await.unwrap();
        let ts = now_ms();

        service
            .record_event("cam_A", zone.id, 1, EventKind::Entry, ts)
            .await
            .unwrap();
        service
            .record_event("cam_A", zone.id, 1, EventKind::Exit, ts)
            .await
            .unwrap();
        service
            .record_event("cam_A", zone.id, 2, EventKind::Entry, ts)
            .await
            .unwrap();

        let (entries, exits, events) = service.recent_events("cam_A", 100).await.unwrap();
        assert_eq!(entries, 2);
        assert_eq!(exits, 1);
        assert_eq!(events.len(), 3);
    }
}
