//! Alerts - Persistence and Queries
//!
//! ## Responsibilities
//!
//! - Persist graded alerts from the risk stage and zone evaluator
//! - Serve active-alert queries (unacknowledged, last 24 hours)
//! - Idempotent acknowledgement

use crate::error::{Error, Result};
use crate::models::{now_ms, RiskLevel};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Alert record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub camera_id: String,
    pub alert_type: String,
    pub severity: RiskLevel,
    pub risk_score: f32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Filters for the active-alert query.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub camera_id: Option<String>,
    pub severity: Option<RiskLevel>,
    pub limit: i64,
}

/// AlertService instance
pub struct AlertService {
    pool: SqlitePool,
}

impl AlertService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new alert and return the stored record.
    pub async fn create(
        &self,
        camera_id: &str,
        alert_type: &str,
        severity: RiskLevel,
        risk_score: f32,
        message: &str,
    ) -> Result<Alert> {
        let timestamp = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO alerts (camera_id, alert_type, severity, risk_score, message,
                                timestamp, acknowledged)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(camera_id)
        .bind(alert_type)
        .bind(severity.as_str())
        .bind(risk_score)
        .bind(message)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            camera_id = %camera_id,
            alert_type = %alert_type,
            severity = %severity.as_str(),
            risk_score,
            "Alert generated"
        );

        Ok(Alert {
            id: result.last_insert_rowid(),
            camera_id: camera_id.to_string(),
            alert_type: alert_type.to_string(),
            severity,
            risk_score,
            message: message.to_string(),
            timestamp,
            acknowledged: false,
        })
    }

    /// Unacknowledged alerts from the last 24 hours, newest first.
    pub async fn active(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let cutoff = now_ms() - Duration::hours(24);
        let limit = if filter.limit > 0 { filter.limit } else { 100 };

        let mut sql = String::from(
            "SELECT id, camera_id, alert_type, severity, risk_score, message, timestamp, acknowledged \
             FROM alerts WHERE acknowledged = 0 AND timestamp >= ?",
        );
        if filter.camera_id.is_some() {
            sql.push_str(" AND camera_id = ?");
        }
        if filter.severity.is_some() {
            sql.push_str(" AND severity = ?");
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(cutoff);
        if let Some(camera_id) = &filter.camera_id {
            query = query.bind(camera_id);
        }
        if let Some(severity) = &filter.severity {
            query = query.bind(severity.as_str());
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_alert).collect()
    }

    /// Acknowledge an alert. Safe to call repeatedly; the stored state is
    /// the same after every call.
    pub async fn acknowledge(&self, alert_id: i64) -> Result<Alert> {
        let updated = sqlx::query("UPDATE alerts SET acknowledged = 1 WHERE id = ?")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::NotFound("Alert not found".into()));
        }
        self.get(alert_id).await
    }

    pub async fn get(&self, alert_id: i64) -> Result<Alert> {
        let row = sqlx::query(
            "SELECT id, camera_id, alert_type, severity, risk_score, message, timestamp, acknowledged \
             FROM alerts WHERE id = ?",
        )
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_alert(&row),
            None => Err(Error::NotFound("Alert not found".into())),
        }
    }

    fn row_to_alert(row: &sqlx::sqlite::SqliteRow) -> Result<Alert> {
        Ok(Alert {
            id: row.try_get("id")?,
            camera_id: row.try_get("camera_id")?,
            alert_type: row.try_get("alert_type")?,
            severity: RiskLevel::from_str(&row.try_get::<String, _>("severity")?),
            risk_score: row.try_get("risk_score")?,
            message: row.try_get::<Option<String>, _>("message")?.unwrap_or_default(),
            timestamp: row.try_get("timestamp")?,
            acknowledged: row.try_get::<i64, _>("acknowledged")? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    #[tokio::test]
    async fn create_and_query_active() {
        let service = AlertService::new(test_pool().await);
        service
            .create("cam_A", "high_density", RiskLevel::Warning, 0.5, "dense")
            .await
            .unwrap();
        service
            .create("cam_B", "stampede_risk", RiskLevel::Critical, 0.8, "run")
            .await
            .unwrap();

        let all = service.active(&AlertFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_a = service
            .active(&AlertFilter {
                camera_id: Some("cam_A".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].alert_type, "high_density");

        let critical = service
            .active(&AlertFilter {
                severity: Some(RiskLevel::Critical),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].camera_id, "cam_B");
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let service = AlertService::new(test_pool().await);
        let alert = service
            .create("cam_A", "warning", RiskLevel::Warning, 0.5, "w")
            .await
            .unwrap();

        let first = service.acknowledge(alert.id).await.unwrap();
        let second = service.acknowledge(alert.id).await.unwrap();
        assert!(first.acknowledged);
        assert_eq!(first.acknowledged, second.acknowledged);
        assert_eq!(first.timestamp, second.timestamp);

        // Acknowledged alerts drop out of the active set
        assert!(service.active(&AlertFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_unknown_alert_is_not_found() {
        let service = AlertService::new(test_pool().await);
        assert!(matches!(
            service.acknowledge(999).await,
            Err(Error::NotFound(_))
        ));
    }
}
