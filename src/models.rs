//! Shared models and types
//!
//! This module contains types shared across multiple pipeline stages
//! to avoid circular dependencies.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Current UTC time truncated to millisecond precision.
///
/// All timestamps the server generates go through this so that serialized
/// values are ISO-8601 with exactly millisecond precision.
pub fn now_ms() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Axis-aligned bounding box in pixel coordinates, `(x, y)` top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Geometric center of the box.
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Bottom-center point, used for zone membership (a person "stands"
    /// at the bottom of their box).
    pub fn bottom_center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let xi1 = self.x.max(other.x);
        let yi1 = self.y.max(other.y);
        let xi2 = (self.x + self.width).min(other.x + other.width);
        let yi2 = (self.y + self.height).min(other.y + other.height);

        let inter = (xi2 - xi1).max(0.0) * (yi2 - yi1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Clamp the box to frame bounds, preserving at least a 1px extent.
    pub fn clamped(&self, frame_width: u32, frame_height: u32) -> BBox {
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let x = self.x.clamp(0.0, fw - 1.0);
        let y = self.y.clamp(0.0, fh - 1.0);
        let width = self.width.clamp(1.0, fw - x);
        let height = self.height.clamp(1.0, fh - y);
        BBox { x, y, width, height }
    }
}

/// A single person detection emitted by the detector stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
}

/// Lifecycle state of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
    Terminated,
}

/// Point-in-time view of a track, handed to downstream stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub track_id: u64,
    pub bbox: BBox,
    pub confidence: f32,
    pub state: TrackState,
    pub total_frames: u32,
}

/// Congestion classification derived from density.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
}

impl CongestionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionLevel::Low => "low",
            CongestionLevel::Medium => "medium",
            CongestionLevel::High => "high",
        }
    }

    pub fn from_str(s: &str) -> CongestionLevel {
        match s {
            "high" => CongestionLevel::High,
            "medium" => CongestionLevel::Medium,
            _ => CongestionLevel::Low,
        }
    }
}

/// Risk classification of an analytics sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Normal => "NORMAL",
            RiskLevel::Warning => "WARNING",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    pub fn from_str(s: &str) -> RiskLevel {
        match s {
            "CRITICAL" => RiskLevel::Critical,
            "WARNING" => RiskLevel::Warning,
            _ => RiskLevel::Normal,
        }
    }
}

/// Mean crowd movement direction, L2-normalised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowVector {
    pub x: f32,
    pub y: f32,
}

impl FlowVector {
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

/// One analytics sample, produced per processed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSample {
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub people_count: u32,
    pub density: f32,
    pub avg_speed: f32,
    pub flow_direction: FlowVector,
    pub congestion_level: CongestionLevel,
    pub risk_score: f32,
    pub risk_level: RiskLevel,
}

impl AnalyticsSample {
    /// The all-zero sample reported before any frame has been processed.
    pub fn empty(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            timestamp: now_ms(),
            people_count: 0,
            density: 0.0,
            avg_speed: 0.0,
            flow_direction: FlowVector::default(),
            congestion_level: CongestionLevel::Low,
            risk_score: 0.0,
            risk_level: RiskLevel::Normal,
        }
    }
}

/// Direction of a zone crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Entry,
    Exit,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entry => "entry",
            EventKind::Exit => "exit",
        }
    }
}

/// A persisted zone crossing, consumed by the cross-camera matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryExitEvent {
    pub id: i64,
    pub camera_id: String,
    pub zone_id: i64,
    pub track_id: u64,
    pub event_type: EventKind,
    pub timestamp: DateTime<Utc>,
}
