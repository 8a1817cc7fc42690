//! Risk - Stampede Risk Scoring and Alert Policy
//!
//! ## Responsibilities
//!
//! - Score each frame's crowd state on five weighted factors
//! - Classify the score into NORMAL / WARNING / CRITICAL
//! - Decide when an alert should be emitted (level change, sustained level,
//!   zone overcapacity)

use crate::models::{CongestionLevel, FlowVector, RiskLevel};
use chrono::{DateTime, Duration, Utc};

const W_DENSITY: f32 = 0.30;
const W_SPEED_VARIANCE: f32 = 0.25;
const W_CONGESTION: f32 = 0.20;
const W_DIRECTIONAL_CONFLICT: f32 = 0.15;
const W_SUDDEN_MOVEMENT: f32 = 0.10;

/// Per-track motion sample feeding the risk factors.
#[derive(Debug, Clone, Copy)]
pub struct TrackMotion {
    /// Speed in px/s (0 when the track has no previous position)
    pub speed: f32,
    /// Unit velocity direction, None when the track did not move
    pub direction: Option<FlowVector>,
    /// Speed on the previous frame, None for new tracks
    pub prev_speed: Option<f32>,
}

/// The individual normalised factors behind a risk score.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskFactors {
    pub density: f32,
    pub speed_variance: f32,
    pub congestion: f32,
    pub directional_conflict: f32,
    pub sudden_movement: f32,
}

/// Risk scoring engine. Pure: the score is a function of its inputs and the
/// fixed thresholds only.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    pub reference_speed: f32,
    pub speed_jump_threshold: f32,
    pub warning_threshold: f32,
    pub critical_threshold: f32,
}

impl RiskEngine {
    pub fn new(
        reference_speed: f32,
        speed_jump_threshold: f32,
        warning_threshold: f32,
        critical_threshold: f32,
    ) -> Self {
        Self {
            reference_speed,
            speed_jump_threshold,
            warning_threshold,
            critical_threshold,
        }
    }

    /// Compute the weighted risk score in [0, 1] and its factors.
    pub fn score(
        &self,
        density: f32,
        congestion: CongestionLevel,
        motions: &[TrackMotion],
    ) -> (f32, RiskFactors) {
        let mut factors = RiskFactors {
            density: density.clamp(0.0, 1.0),
            ..RiskFactors::default()
        };

        factors.congestion = match congestion {
            CongestionLevel::Low => 0.0,
            CongestionLevel::Medium => 0.5,
            CongestionLevel::High => 1.0,
        };

        if motions.len() >= 2 {
            let mean = motions.iter().map(|m| m.speed).sum::<f32>() / motions.len() as f32;
            let var = motions
                .iter()
                .map(|m| (m.speed - mean).powi(2))
                .sum::<f32>()
                / motions.len() as f32;
            factors.speed_variance = (var.sqrt() / self.reference_speed).clamp(0.0, 1.0);
        }

        let directions: Vec<FlowVector> =
            motions.iter().filter_map(|m| m.direction).collect();
        if !directions.is_empty() {
            let mx = directions.iter().map(|d| d.x).sum::<f32>() / directions.len() as f32;
            let my = directions.iter().map(|d| d.y).sum::<f32>() / directions.len() as f32;
            let coherence = (mx * mx + my * my).sqrt();
            factors.directional_conflict = (1.0 - coherence).clamp(0.0, 1.0);
        }

        let with_history = motions.iter().filter(|m| m.prev_speed.is_some()).count();
        if with_history > 0 {
            let jumps = motions
                .iter()
                .filter(|m| {
                    m.prev_speed
                        .map_or(false, |p| (m.speed - p).abs() > self.speed_jump_threshold)
                })
                .count();
            factors.sudden_movement = jumps as f32 / with_history as f32;
        }

        let score = (W_DENSITY * factors.density
            + W_SPEED_VARIANCE * factors.speed_variance
            + W_CONGESTION * factors.congestion
            + W_DIRECTIONAL_CONFLICT * factors.directional_conflict
            + W_SUDDEN_MOVEMENT * factors.sudden_movement)
            .clamp(0.0, 1.0);

        (score, factors)
    }

    /// Classify a score against the fixed thresholds.
    pub fn level(&self, score: f32) -> RiskLevel {
        if score >= self.critical_threshold {
            RiskLevel::Critical
        } else if score >= self.warning_threshold {
            RiskLevel::Warning
        } else {
            RiskLevel::Normal
        }
    }
}

/// What kind of alert a frame's state warrants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    StampedeRisk,
    HighDensity,
    Congestion,
    Warning,
    ZoneOvercapacity,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::StampedeRisk => "stampede_risk",
            AlertKind::HighDensity => "high_density",
            AlertKind::Congestion => "congestion",
            AlertKind::Warning => "warning",
            AlertKind::ZoneOvercapacity => "zone_overcapacity",
        }
    }
}

/// Pick an alert kind and message for a non-NORMAL frame.
pub fn classify_alert(
    level: RiskLevel,
    risk_score: f32,
    density: f32,
    congestion: CongestionLevel,
) -> (AlertKind, String) {
    if level == RiskLevel::Critical {
        (
            AlertKind::StampedeRisk,
            format!("CRITICAL: Stampede risk detected (score: {risk_score:.2})"),
        )
    } else if density > 0.7 {
        (
            AlertKind::HighDensity,
            format!("High crowd density detected: {:.1}%", density * 100.0),
        )
    } else if congestion == CongestionLevel::High {
        (
            AlertKind::Congestion,
            "High congestion detected - flow may be blocked".to_string(),
        )
    } else {
        (
            AlertKind::Warning,
            format!("Warning: Elevated risk detected (score: {risk_score:.2})"),
        )
    }
}

/// Per-camera alert emission policy: alert on level change, and re-alert
/// while a WARNING/CRITICAL level is sustained past the resample interval.
#[derive(Debug)]
pub struct AlertPolicy {
    resample_interval: Duration,
    last_level: RiskLevel,
    last_alert_at: Option<DateTime<Utc>>,
}

impl AlertPolicy {
    pub fn new(resample_interval: std::time::Duration) -> Self {
        Self {
            resample_interval: Duration::from_std(resample_interval)
                .unwrap_or_else(|_| Duration::seconds(30)),
            last_level: RiskLevel::Normal,
            last_alert_at: None,
        }
    }

    /// Decide whether this frame's level warrants an alert.
    pub fn should_alert(&mut self, level: RiskLevel, now: DateTime<Utc>) -> bool {
        let changed = level != self.last_level;
        self.last_level = level;

        if changed {
            self.last_alert_at = Some(now);
            // A return to NORMAL is not itself alert-worthy
            return level != RiskLevel::Normal;
        }

        if level == RiskLevel::Normal {
            return false;
        }

        match self.last_alert_at {
            Some(prev) if now - prev >= self.resample_interval => {
                self.last_alert_at = Some(now);
                true
            }
            None => {
                self.last_alert_at = Some(now);
                true
            }
            _ => false,
        }
    }
}
