//! Storage - SQLite pool and schema bootstrap
//!
//! ## Responsibilities
//!
//! - Create the connection pool
//! - Apply the schema at startup (idempotent)
//!
//! Row-level queries live next to the services that own them.

mod records;

pub use records::{DetectionRow, PipelineStore};

use crate::error::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::time::Duration;

/// Create the database pool.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the schema. Every statement is `IF NOT EXISTS` so this is safe to
/// run on every startup.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS cameras (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            camera_id TEXT NOT NULL UNIQUE,
            edge_node_id TEXT,
            location TEXT,
            resolution TEXT,
            fps REAL,
            status TEXT NOT NULL DEFAULT 'active',
            last_frame_time TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS frames (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            camera_id TEXT NOT NULL,
            frame_id INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            UNIQUE(camera_id, frame_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS detections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            frame_ref INTEGER NOT NULL,
            camera_id TEXT NOT NULL,
            track_id INTEGER,
            bbox_x REAL NOT NULL,
            bbox_y REAL NOT NULL,
            bbox_width REAL NOT NULL,
            bbox_height REAL NOT NULL,
            confidence REAL NOT NULL,
            timestamp TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_detections_camera_ts ON detections(camera_id, timestamp)",
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            track_id INTEGER NOT NULL,
            camera_id TEXT NOT NULL,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            total_frames INTEGER NOT NULL DEFAULT 1,
            avg_confidence REAL,
            state TEXT NOT NULL DEFAULT 'confirmed',
            embedding BLOB,
            UNIQUE(camera_id, track_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS analytics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            camera_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            people_count INTEGER NOT NULL,
            density REAL NOT NULL,
            avg_speed REAL,
            flow_x REAL NOT NULL DEFAULT 0,
            flow_y REAL NOT NULL DEFAULT 0,
            congestion_level TEXT,
            risk_score REAL NOT NULL DEFAULT 0,
            risk_level TEXT NOT NULL DEFAULT 'NORMAL'
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_analytics_camera_ts ON analytics(camera_id, timestamp)",
        r#"
        CREATE TABLE IF NOT EXISTS zones (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            camera_id TEXT NOT NULL,
            zone_name TEXT NOT NULL,
            zone_type TEXT,
            polygon_coords TEXT NOT NULL,
            max_capacity INTEGER,
            current_occupancy INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active'
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            camera_id TEXT NOT NULL,
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            risk_score REAL NOT NULL,
            message TEXT,
            timestamp TEXT NOT NULL,
            acknowledged INTEGER NOT NULL DEFAULT 0
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_alerts_camera_ts ON alerts(camera_id, timestamp)",
        r#"
        CREATE TABLE IF NOT EXISTS entry_exit_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            camera_id TEXT NOT NULL,
            zone_id INTEGER,
            track_id INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_events_camera_ts ON entry_exit_events(camera_id, timestamp)",
        r#"
        CREATE TABLE IF NOT EXISTS cross_camera_movements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_camera_id TEXT NOT NULL,
            entry_zone_id INTEGER,
            entry_track_id INTEGER NOT NULL,
            entry_timestamp TEXT NOT NULL,
            exit_camera_id TEXT NOT NULL,
            exit_zone_id INTEGER,
            exit_track_id INTEGER NOT NULL,
            exit_timestamp TEXT NOT NULL,
            similarity REAL NOT NULL,
            confidence TEXT NOT NULL,
            duration_seconds REAL NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(entry_camera_id, entry_track_id, exit_camera_id, exit_track_id)
        )
        "#,
    ];

    for stmt in statements {
        sqlx::query(stmt).execute(pool).await?;
    }

    tracing::info!("Database schema ready");
    Ok(())
}

/// Encode an embedding as little-endian f32 bytes for BLOB storage.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode an embedding BLOB back to f32s. Truncates trailing partial values.
pub fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    init_schema(&pool).await.expect("schema");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_blob_round_trip() {
        let e = vec![0.5f32, -1.25, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&e)), e);
    }

    #[tokio::test]
    async fn schema_applies_twice() {
        let pool = test_pool().await;
        init_schema(&pool).await.unwrap();
    }
}
