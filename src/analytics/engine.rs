//! Crowd analytics math: density estimation, motion statistics, heatmaps.

use crate::models::{CongestionLevel, FlowVector, TrackSnapshot};
use crate::risk::TrackMotion;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Density grid cell size in pixels. Kernels are placed on this coarse grid
/// so per-frame density stays cheap at any resolution.
const DENSITY_CELL: u32 = 8;
/// Largest kernel footprint in pixels, matching person-sized boxes.
const MAX_KERNEL_PX: u32 = 100;

/// Gaussian kernel density over track centers, averaged over the frame and
/// mapped to [0, 1] by `density_norm`.
pub fn estimate_density(
    tracks: &[TrackSnapshot],
    frame_width: u32,
    frame_height: u32,
    density_norm: f32,
) -> f32 {
    if tracks.is_empty() || frame_width == 0 || frame_height == 0 || density_norm <= 0.0 {
        return 0.0;
    }

    let gw = (frame_width.div_ceil(DENSITY_CELL)) as i32;
    let gh = (frame_height.div_ceil(DENSITY_CELL)) as i32;
    let mut grid = vec![0.0f32; (gw * gh) as usize];

    for track in tracks {
        let (cx, cy) = track.bbox.center();
        let gx = (cx / DENSITY_CELL as f32) as i32;
        let gy = (cy / DENSITY_CELL as f32) as i32;

        let kernel_px = (track.bbox.width.max(track.bbox.height) as u32)
            .clamp(DENSITY_CELL, MAX_KERNEL_PX);
        let radius = (kernel_px / DENSITY_CELL) as i32;
        let sigma = (radius as f32 / 1.5).max(0.5);

        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let (x, y) = (gx + dx, gy + dy);
                if x < 0 || y < 0 || x >= gw || y >= gh {
                    continue;
                }
                let d2 = (dx * dx + dy * dy) as f32;
                grid[(y * gw + x) as usize] += (-d2 / (2.0 * sigma * sigma)).exp();
            }
        }
    }

    let mean = grid.iter().sum::<f32>() / grid.len() as f32;
    (mean / density_norm).clamp(0.0, 1.0)
}

/// Congestion classification from density.
pub fn congestion_from_density(density: f32) -> CongestionLevel {
    if density < 0.33 {
        CongestionLevel::Low
    } else if density < 0.66 {
        CongestionLevel::Medium
    } else {
        CongestionLevel::High
    }
}

#[derive(Debug, Clone, Copy)]
struct PrevPosition {
    cx: f32,
    cy: f32,
    ts: DateTime<Utc>,
    speed: f32,
}

/// Motion statistics for one frame.
#[derive(Debug, Default)]
pub struct FrameMotion {
    pub motions: Vec<TrackMotion>,
    pub avg_speed: f32,
    pub flow: FlowVector,
}

/// Per-camera motion history. Owned by the camera worker.
#[derive(Debug, Default)]
pub struct MotionTracker {
    prev: HashMap<u64, PrevPosition>,
}

impl MotionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare this frame's tracks against the previous frame. Tracks with
    /// no previous position contribute zero speed and no direction.
    pub fn update(&mut self, tracks: &[TrackSnapshot], ts: DateTime<Utc>) -> FrameMotion {
        let mut motions = Vec::with_capacity(tracks.len());
        let mut velocity_sum = (0.0f32, 0.0f32);
        let mut moved = 0usize;
        let mut next = HashMap::with_capacity(tracks.len());

        for track in tracks {
            let (cx, cy) = track.bbox.center();
            let motion = match self.prev.get(&track.track_id) {
                Some(prev) => {
                    let dt = (ts - prev.ts).num_milliseconds() as f32 / 1000.0;
                    if dt > 0.0 {
                        let dx = cx - prev.cx;
                        let dy = cy - prev.cy;
                        let dist = (dx * dx + dy * dy).sqrt();
                        let speed = dist / dt;
                        let direction = (dist > 0.0).then(|| FlowVector {
                            x: dx / dist,
                            y: dy / dist,
                        });
                        velocity_sum.0 += dx / dt;
                        velocity_sum.1 += dy / dt;
                        moved += 1;
                        TrackMotion {
                            speed,
                            direction,
                            prev_speed: Some(prev.speed),
                        }
                    } else {
                        TrackMotion {
                            speed: prev.speed,
                            direction: None,
                            prev_speed: Some(prev.speed),
                        }
                    }
                }
                None => TrackMotion {
                    speed: 0.0,
                    direction: None,
                    prev_speed: None,
                },
            };

            next.insert(
                track.track_id,
                PrevPosition {
                    cx,
                    cy,
                    ts,
                    speed: motion.speed,
                },
            );
            motions.push(motion);
        }

        self.prev = next;

        let avg_speed = if motions.is_empty() {
            0.0
        } else {
            motions.iter().map(|m| m.speed).sum::<f32>() / motions.len() as f32
        };

        let flow = if moved > 0 {
            let mx = velocity_sum.0 / moved as f32;
            let my = velocity_sum.1 / moved as f32;
            let mag = (mx * mx + my * my).sqrt();
            if mag > 0.0 {
                FlowVector {
                    x: mx / mag,
                    y: my / mag,
                }
            } else {
                FlowVector::default()
            }
        } else {
            FlowVector::default()
        };

        FrameMotion {
            motions,
            avg_speed,
            flow,
        }
    }
}

/// Accumulate Gaussian kernels at box centers into a full-resolution
/// intensity grid in [0, 1]. Used by the heatmap endpoint and the
/// annotator's heatmap overlay.
pub fn accumulate_heatmap(
    centers: &[(f32, f32, f32)], // (cx, cy, kernel size in px)
    width: u32,
    height: u32,
) -> Vec<f32> {
    let (w, h) = (width as i32, height as i32);
    let mut grid = vec![0.0f32; (width * height) as usize];

    for &(cx, cy, size) in centers {
        let cx = (cx as i32).clamp(0, w - 1);
        let cy = (cy as i32).clamp(0, h - 1);
        let radius = (size.clamp(8.0, MAX_KERNEL_PX as f32) / 2.0) as i32;
        let sigma = (radius as f32 / 1.5).max(1.0);

        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let (x, y) = (cx + dx, cy + dy);
                if x < 0 || y < 0 || x >= w || y >= h {
                    continue;
                }
                let d2 = (dx * dx + dy * dy) as f32;
                grid[(y * w + x) as usize] += (-d2 / (2.0 * sigma * sigma)).exp();
            }
        }
    }

    let max = grid.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        for v in grid.iter_mut() {
            *v /= max;
        }
    }
    grid
}

/// Map a [0, 1] intensity to a jet-style RGB gradient (blue -> red).
pub fn colormap_jet(t: f32) -> [u8; 3] {
    let t = t.clamp(0.0, 1.0);
    let r = ((1.5 - (4.0 * t - 3.0).abs()).clamp(0.0, 1.0) * 255.0) as u8;
    let g = ((1.5 - (4.0 * t - 2.0).abs()).clamp(0.0, 1.0) * 255.0) as u8;
    let b = ((1.5 - (4.0 * t - 1.0).abs()).clamp(0.0, 1.0) * 255.0) as u8;
    [r, g, b]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_ms, BBox, TrackState};
    use chrono::Duration;

    fn track(id: u64, x: f32, y: f32) -> TrackSnapshot {
        TrackSnapshot {
            track_id: id,
            bbox: BBox::new(x, y, 40.0, 80.0),
            confidence: 0.9,
            state: TrackState::Confirmed,
            total_frames: 5,
        }
    }

    #[test]
    fn empty_scene_has_zero_density() {
        assert_eq!(estimate_density(&[], 640, 480, 0.25), 0.0);
    }

    #[test]
    fn density_grows_with_crowd() {
        let one = vec![track(1, 300.0, 200.0)];
        let many: Vec<_> = (0..8)
            .map(|i| track(i, 100.0 + 50.0 * i as f32, 200.0))
            .collect();
        let d1 = estimate_density(&one, 640, 480, 0.25);
        let d8 = estimate_density(&many, 640, 480, 0.25);
        assert!(d1 > 0.0);
        assert!(d8 > d1);
    }

    #[test]
    fn density_is_clamped() {
        let crowd: Vec<_> = (0..200).map(|i| track(i, 320.0, 240.0)).collect();
        assert!(estimate_density(&crowd, 640, 480, 0.01) <= 1.0);
    }

    #[test]
    fn congestion_bands() {
        assert_eq!(congestion_from_density(0.1), CongestionLevel::Low);
        assert_eq!(congestion_from_density(0.5), CongestionLevel::Medium);
        assert_eq!(congestion_from_density(0.9), CongestionLevel::High);
    }

    #[test]
    fn rightward_walk_yields_positive_flow_x() {
        let mut motion = MotionTracker::new();
        let t0 = now_ms();

        motion.update(&[track(1, 100.0, 200.0)], t0);
        let frame = motion.update(&[track(1, 130.0, 200.0)], t0 + Duration::milliseconds(100));

        assert!(frame.flow.x > 0.8, "flow.x = {}", frame.flow.x);
        assert!(frame.flow.y.abs() < 0.2);
        // 30px in 100ms = 300 px/s
        assert!((frame.avg_speed - 300.0).abs() < 1.0);
    }

    #[test]
    fn new_track_has_zero_speed() {
        let mut motion = MotionTracker::new();
        let frame = motion.update(&[track(1, 100.0, 200.0)], now_ms());
        assert_eq!(frame.avg_speed, 0.0);
        assert_eq!(frame.flow, FlowVector::default());
        assert!(frame.motions[0].prev_speed.is_none());
    }

    #[test]
    fn prev_speed_is_carried_forward() {
        let mut motion = MotionTracker::new();
        let t0 = now_ms();
        motion.update(&[track(1, 100.0, 200.0)], t0);
        motion.update(&[track(1, 110.0, 200.0)], t0 + Duration::milliseconds(100));
        let frame = motion.update(&[track(1, 110.0, 200.0)], t0 + Duration::milliseconds(200));
        assert!((frame.motions[0].prev_speed.unwrap() - 100.0).abs() < 1.0);
        assert_eq!(frame.motions[0].speed, 0.0);
    }

    #[test]
    fn heatmap_peaks_at_center() {
        let grid = accumulate_heatmap(&[(50.0, 50.0, 40.0)], 100, 100);
        let at_center = grid[50 * 100 + 50];
        let far_away = grid[10 * 100 + 10];
        assert!((at_center - 1.0).abs() < 1e-6);
        assert!(far_away < at_center);
    }

    #[test]
    fn colormap_endpoints() {
        let cold = colormap_jet(0.1);
        let hot = colormap_jet(0.9);
        assert!(cold[2] > cold[0]); // blue end
        assert!(hot[0] > hot[2]); // red end
    }
}
