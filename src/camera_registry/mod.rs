//! CameraRegistry - Camera Records
//!
//! ## Responsibilities
//!
//! - Register cameras (idempotent on camera_id)
//! - Serve camera lookups from an in-memory cache
//! - Track per-camera status and last_frame_time
//!
//! All cross-camera access to camera records goes through this registry;
//! writes go to the database first, then refresh the cache.

use crate::error::{Error, Result};
use crate::models::now_ms;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Camera record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub camera_id: String,
    pub edge_node_id: Option<String>,
    pub location: Option<String>,
    pub resolution: Option<String>,
    pub fps: Option<f64>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Camera {
    /// Parse the stored `WxH` resolution string, if any.
    pub fn resolution_wh(&self) -> Option<(u32, u32)> {
        let res = self.resolution.as_deref()?;
        let (w, h) = res.split_once('x')?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    }
}

/// Camera registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterCameraRequest {
    pub camera_id: String,
    pub edge_node_id: Option<String>,
    pub location: Option<String>,
    pub resolution: Option<String>,
    pub fps: Option<f64>,
}

/// CameraRegistry instance
pub struct CameraRegistry {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, Camera>>,
}

impl CameraRegistry {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let registry = Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        };
        registry.refresh_cache().await?;
        Ok(registry)
    }

    /// Reload the cache from the database.
    pub async fn refresh_cache(&self) -> Result<()> {
        let cameras = self.fetch_all().await?;
        let mut cache = self.cache.write().await;
        cache.clear();
        for cam in cameras {
            cache.insert(cam.camera_id.clone(), cam);
        }
        Ok(())
    }

    /// Register a camera. Re-registering with identical parameters returns
    /// the existing record; conflicting parameters are rejected.
    pub async fn register(&self, req: RegisterCameraRequest) -> Result<Camera> {
        if req.camera_id.trim().is_empty() {
            return Err(Error::Validation("camera_id must not be empty".into()));
        }

        if let Some(existing) = self.get(&req.camera_id).await {
            let same = existing.edge_node_id == req.edge_node_id
                && existing.location == req.location
                && existing.resolution == req.resolution
                && existing.fps == req.fps;
            if same {
                return Ok(existing);
            }
            return Err(Error::Conflict(format!(
                "Camera {} already registered with different parameters",
                req.camera_id
            )));
        }

        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO cameras (camera_id, edge_node_id, location, resolution, fps,
                                 status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'active', ?, ?)
            "#,
        )
        .bind(&req.camera_id)
        .bind(&req.edge_node_id)
        .bind(&req.location)
        .bind(&req.resolution)
        .bind(req.fps)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.refresh_cache().await?;
        tracing::info!(camera_id = %req.camera_id, "Camera registered");

        self.get(&req.camera_id)
            .await
            .ok_or_else(|| Error::Internal("camera vanished after insert".into()))
    }

    /// Get a camera from the cache.
    pub async fn get(&self, camera_id: &str) -> Option<Camera> {
        self.cache.read().await.get(camera_id).cloned()
    }

    /// Get a camera, or a NotFound error for request handlers.
    pub async fn require(&self, camera_id: &str) -> Result<Camera> {
        self.get(camera_id)
            .await
            .ok_or_else(|| Error::NotFound("Camera not found".into()))
    }

    /// List cameras, optionally filtered by status.
    pub async fn list(&self, status: Option<&str>) -> Vec<Camera> {
        let cache = self.cache.read().await;
        let mut cameras: Vec<Camera> = cache
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        cameras.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        cameras
    }

    /// Record a processed frame's wall-clock arrival. Monotonic per camera:
    /// an older timestamp never overwrites a newer one.
    pub async fn touch_last_frame(&self, camera_id: &str, ts: DateTime<Utc>) {
        {
            let mut cache = self.cache.write().await;
            if let Some(cam) = cache.get_mut(camera_id) {
                if cam.last_frame_time.map_or(false, |prev| prev > ts) {
                    return;
                }
                cam.last_frame_time = Some(ts);
                cam.updated_at = now_ms();
            } else {
                return;
            }
        }

        if let Err(e) = sqlx::query(
            "UPDATE cameras SET last_frame_time = ?, updated_at = ? WHERE camera_id = ?",
        )
        .bind(ts)
        .bind(now_ms())
        .bind(camera_id)
        .execute(&self.pool)
        .await
        {
            tracing::warn!(camera_id = %camera_id, error = %e, "Failed to persist last_frame_time");
        }
    }

    /// Set camera status (`active` / `inactive`).
    pub async fn set_status(&self, camera_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE cameras SET status = ?, updated_at = ? WHERE camera_id = ?")
            .bind(status)
            .bind(now_ms())
            .bind(camera_id)
            .execute(&self.pool)
            .await?;
        self.refresh_cache().await?;
        Ok(())
    }

    async fn fetch_all(&self) -> Result<Vec<Camera>> {
        let rows = sqlx::query(
            r#"
            SELECT camera_id, edge_node_id, location, resolution, fps, status,
                   last_frame_time, created_at, updated_at
            FROM cameras
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut cameras = Vec::with_capacity(rows.len());
        for row in rows {
            cameras.push(Camera {
                camera_id: row.try_get("camera_id")?,
                edge_node_id: row.try_get("edge_node_id")?,
                location: row.try_get("location")?,
                resolution: row.try_get("resolution")?,
                fps: row.try_get("fps")?,
                status: row.try_get("status")?,
                last_frame_time: row.try_get("last_frame_time")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(cameras)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    fn req(id: &str) -> RegisterCameraRequest {
        RegisterCameraRequest {
            camera_id: id.to_string(),
            edge_node_id: Some("edge-1".to_string()),
            location: Some("hall".to_string()),
            resolution: Some("640x480".to_string()),
            fps: Some(30.0),
        }
    }

    #[tokio::test]
    async fn register_then_list_round_trips() {
        let registry = CameraRegistry::new(test_pool().await).await.unwrap();
        let created = registry.register(req("cam_A")).await.unwrap();
        assert_eq!(created.status, "active");

        let listed = registry.list(None).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].camera_id, "cam_A");
        assert_eq!(listed[0].resolution_wh(), Some((640, 480)));
    }

    #[tokio::test]
    async fn register_is_idempotent_on_same_params() {
        let registry = CameraRegistry::new(test_pool().await).await.unwrap();
        let first = registry.register(req("cam_A")).await.unwrap();
        let second = registry.register(req("cam_A")).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn register_conflicting_params_is_rejected() {
        let registry = CameraRegistry::new(test_pool().await).await.unwrap();
        registry.register(req("cam_A")).await.unwrap();
        let mut other = req("cam_A");
        other.location = Some("lobby".to_string());
        assert!(matches!(
            registry.register(other).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn last_frame_time_is_monotonic() {
        let registry = CameraRegistry::new(test_pool().await).await.unwrap();
        registry.register(req("cam_A")).await.unwrap();

        let newer = now_ms();
        let older = newer - chrono::Duration::seconds(10);
        registry.touch_last_frame("cam_A", newer).await;
        registry.touch_last_frame("cam_A", older).await;

        let cam = registry.get("cam_A").await.unwrap();
        assert_eq!(cam.last_frame_time, Some(newer));
    }

    #[tokio::test]
    async fn status_filter() {
        let registry = CameraRegistry::new(test_pool().await).await.unwrap();
        registry.register(req("cam_A")).await.unwrap();
        registry.register(req("cam_B")).await.unwrap();
        registry.set_status("cam_B", "inactive").await.unwrap();

        assert_eq!(registry.list(Some("active")).await.len(), 1);
        assert_eq!(registry.list(Some("inactive")).await.len(), 1);
        assert_eq!(registry.list(None).await.len(), 2);
    }
}
