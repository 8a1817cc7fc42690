//! Detector - Person Detection Stage
//!
//! ## Responsibilities
//!
//! - Capability interface for person detection (`PersonDetector`)
//! - HTTP adapter to the detection sidecar holding the model weights
//! - Confidence filtering and non-maximum suppression
//!
//! Model weights never load in this process: inference runs in a sidecar and
//! this stage posts the JPEG and parses boxes back. Detector failures
//! degrade to an empty detection list with a warning; they never propagate.

use crate::models::{BBox, Detection};
use crate::state::PipelineConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capability interface for the detection stage. Implementations may hold a
/// model handle; the contract is stateless per call.
#[async_trait]
pub trait PersonDetector: Send + Sync {
    /// Detect people in an encoded JPEG of known dimensions. Returns person
    /// boxes above the confidence threshold, NMS applied. Never errors: a
    /// failed inference is an empty list.
    async fn detect(&self, jpeg: &[u8], width: u32, height: u32) -> Vec<Detection>;
}

/// Raw box returned by the sidecar, `[x1, y1, x2, y2]` corner format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub label: String,
    pub conf: f32,
}

#[derive(Debug, Clone, Deserialize)]
struct SidecarResponse {
    #[serde(default)]
    boxes: Vec<SidecarBox>,
}

/// HTTP adapter to the detection sidecar.
pub struct RemoteDetector {
    client: reqwest::Client,
    base_url: String,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl RemoteDetector {
    pub fn new(base_url: &str, config: &PipelineConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
        }
    }

    /// Check the sidecar is reachable.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl PersonDetector for RemoteDetector {
    async fn detect(&self, jpeg: &[u8], width: u32, height: u32) -> Vec<Detection> {
        let url = format!("{}/detect", self.base_url);
        let part = reqwest::multipart::Part::bytes(jpeg.to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .expect("static mime type");
        let form = reqwest::multipart::Form::new().part("frame", part);

        let response = match self.client.post(&url).multipart(form).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "Detector request failed");
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "Detector returned error status");
            return Vec::new();
        }

        let parsed: SidecarResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Detector response parse failed");
                return Vec::new();
            }
        };

        filter_detections(
            &parsed.boxes,
            width,
            height,
            self.confidence_threshold,
            self.nms_threshold,
        )
    }
}

/// Keep person boxes above the confidence threshold, clamp them into the
/// frame, and suppress overlapping duplicates (greedy NMS, highest
/// confidence first).
pub fn filter_detections(
    boxes: &[SidecarBox],
    width: u32,
    height: u32,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Vec<Detection> {
    let mut candidates: Vec<Detection> = boxes
        .iter()
        .filter(|b| b.label == "person" && b.conf >= confidence_threshold)
        .filter(|b| b.conf.is_finite() && b.x2 > b.x1 && b.y2 > b.y1)
        .map(|b| Detection {
            bbox: BBox::new(b.x1, b.y1, b.x2 - b.x1, b.y2 - b.y1).clamped(width, height),
            confidence: b.conf.min(1.0),
            track_id: None,
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for det in candidates {
        if kept.iter().all(|k| k.bbox.iou(&det.bbox) <= nms_threshold) {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(x1: f32, y1: f32, x2: f32, y2: f32, label: &str, conf: f32) -> SidecarBox {
        SidecarBox {
            x1,
            y1,
            x2,
            y2,
            label: label.to_string(),
            conf,
        }
    }

    #[test]
    fn only_confident_people_pass() {
        let boxes = vec![
            raw(10.0, 10.0, 50.0, 90.0, "person", 0.9),
            raw(100.0, 10.0, 140.0, 90.0, "person", 0.3),
            raw(200.0, 10.0, 240.0, 90.0, "bicycle", 0.95),
        ];
        let detections = filter_detections(&boxes, 640, 480, 0.5, 0.4);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 0.9);
    }

    #[test]
    fn nms_suppresses_duplicates() {
        let boxes = vec![
            raw(10.0, 10.0, 50.0, 90.0, "person", 0.9),
            raw(12.0, 10.0, 52.0, 90.0, "person", 0.7),
            raw(300.0, 10.0, 340.0, 90.0, "person", 0.8),
        ];
        let detections = filter_detections(&boxes, 640, 480, 0.5, 0.4);
        assert_eq!(detections.len(), 2);
        // The higher-confidence duplicate survives
        assert!(detections.iter().any(|d| d.confidence == 0.9));
        assert!(detections.iter().all(|d| d.confidence != 0.7));
    }

    #[test]
    fn boxes_are_clamped_into_frame() {
        let boxes = vec![raw(-20.0, -20.0, 700.0, 500.0, "person", 0.9)];
        let detections = filter_detections(&boxes, 640, 480, 0.5, 0.4);
        let b = detections[0].bbox;
        assert!(b.x >= 0.0 && b.y >= 0.0);
        assert!(b.x + b.width <= 640.0);
        assert!(b.y + b.height <= 480.0);
    }

    #[test]
    fn degenerate_and_nan_boxes_are_dropped() {
        let boxes = vec![
            raw(50.0, 50.0, 50.0, 90.0, "person", 0.9),
            raw(10.0, 10.0, 40.0, 80.0, "person", f32::NAN),
        ];
        assert!(filter_detections(&boxes, 640, 480, 0.5, 0.4).is_empty());
    }
}
