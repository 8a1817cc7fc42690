//! Annotator - Frame Overlay Rendering
//!
//! ## Responsibilities
//!
//! - Render detections, track ids, zones, flow arrows, density heatmap,
//!   metrics HUD and the risk bar onto a decoded frame
//! - Encode frames to JPEG for streaming and snapshots
//!
//! Pure functions over pixel buffers: no state, no locks. Colour coding
//! follows the dashboard convention (confirmed tracks green, tentative
//! grey, zones magenta, risk bar green/orange/red).

mod font;

use crate::analytics::{accumulate_heatmap, colormap_jet};
use crate::models::{AnalyticsSample, Detection, RiskLevel, TrackSnapshot, TrackState};
use crate::zones::Zone;
use font::draw_text;
use image::{Rgb, RgbImage};

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const GREY: Rgb<u8> = Rgb([128, 128, 128]);
const MAGENTA: Rgb<u8> = Rgb([255, 0, 255]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Overlay toggles, mirroring the stream endpoint's query flags.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub show_boxes: bool,
    pub show_track_ids: bool,
    pub show_zones: bool,
    pub show_flow: bool,
    pub show_heatmap: bool,
    pub show_metrics: bool,
    pub show_risk_bar: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            show_boxes: true,
            show_track_ids: true,
            show_zones: true,
            show_flow: true,
            show_heatmap: false,
            show_metrics: true,
            show_risk_bar: true,
        }
    }
}

fn risk_color(level: RiskLevel) -> Rgb<u8> {
    match level {
        RiskLevel::Normal => GREEN,
        RiskLevel::Warning => ORANGE,
        RiskLevel::Critical => RED,
    }
}

/// Render all enabled overlays onto a copy of the frame.
pub fn annotate(
    frame: &RgbImage,
    detections: &[Detection],
    tracks: &[TrackSnapshot],
    zones: &[Zone],
    analytics: &AnalyticsSample,
    options: &RenderOptions,
) -> RgbImage {
    let mut out = frame.clone();

    if options.show_zones {
        draw_zones(&mut out, zones);
    }
    if options.show_heatmap {
        draw_heatmap(&mut out, detections);
    }
    if options.show_boxes {
        if tracks.is_empty() {
            draw_detections(&mut out, detections);
        } else {
            draw_tracks(&mut out, tracks, options.show_track_ids);
        }
    }
    if options.show_flow {
        draw_flow_arrows(&mut out, tracks, analytics);
    }
    if options.show_metrics {
        draw_metrics_hud(&mut out, analytics);
    }
    if options.show_risk_bar {
        draw_risk_bar(&mut out, analytics);
    }
    out
}

/// Encode a frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(std::io::Cursor::new(&mut buf), quality);
    if let Err(e) = encoder.encode_image(frame) {
        tracing::error!(error = %e, "JPEG encode failed");
    }
    buf
}

/// Dark placeholder shown while a camera has no cached frames.
pub fn placeholder_frame(camera_id: &str, width: u32, height: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(width.max(160), height.max(120), Rgb([16, 16, 16]));
    let label = format!("CAMERA {camera_id} - WAITING FOR FRAMES");
    draw_text(&mut img, &label, 10, (height / 2).saturating_sub(4) as i32, 1, WHITE);
    img
}

fn draw_detections(img: &mut RgbImage, detections: &[Detection]) {
    for det in detections {
        let b = det.bbox;
        draw_rect(img, b.x as i32, b.y as i32, b.width as i32, b.height as i32, GREEN);
        let label = format!("{:.2}", det.confidence);
        draw_text(img, &label, b.x as i32, b.y as i32 - 9, 1, WHITE);
    }
}

fn draw_tracks(img: &mut RgbImage, tracks: &[TrackSnapshot], show_ids: bool) {
    for track in tracks {
        let color = if track.state == TrackState::Tentative {
            GREY
        } else {
            GREEN
        };
        let b = track.bbox;
        draw_rect(img, b.x as i32, b.y as i32, b.width as i32, b.height as i32, color);
        if show_ids {
            let label = format!("ID:{}", track.track_id);
            draw_text(img, &label, b.x as i32, b.y as i32 - 9, 1, WHITE);
        }
    }
}

fn draw_zones(img: &mut RgbImage, zones: &[Zone]) {
    for zone in zones {
        let points = &zone.polygon_coords;
        if points.len() < 3 {
            continue;
        }
        for i in 0..points.len() {
            let a = points[i];
            let b = points[(i + 1) % points.len()];
            draw_line(img, a[0] as i32, a[1] as i32, b[0] as i32, b[1] as i32, MAGENTA);
        }

        let cx = points.iter().map(|p| p[0]).sum::<i64>() / points.len() as i64;
        let cy = points.iter().map(|p| p[1]).sum::<i64>() / points.len() as i64;
        let label = match zone.max_capacity {
            Some(cap) => format!(
                "{} ({}/{})",
                zone.zone_name.to_uppercase(),
                zone.current_occupancy,
                cap
            ),
            None => zone.zone_name.to_uppercase(),
        };
        draw_text(img, &label, cx as i32, cy as i32, 1, MAGENTA);
    }
}

fn draw_heatmap(img: &mut RgbImage, detections: &[Detection]) {
    if detections.is_empty() {
        return;
    }
    let centers: Vec<(f32, f32, f32)> = detections
        .iter()
        .map(|d| {
            let (cx, cy) = d.bbox.center();
            (cx, cy, d.bbox.width.max(d.bbox.height))
        })
        .collect();
    let grid = accumulate_heatmap(&centers, img.width(), img.height());

    for (i, pixel) in img.pixels_mut().enumerate() {
        let t = grid[i];
        if t <= 0.01 {
            continue;
        }
        let heat = colormap_jet(t);
        // 60/40 blend with the underlying pixel
        for c in 0..3 {
            pixel.0[c] = (pixel.0[c] as f32 * 0.6 + heat[c] as f32 * 0.4) as u8;
        }
    }
}

fn draw_flow_arrows(img: &mut RgbImage, tracks: &[TrackSnapshot], analytics: &AnalyticsSample) {
    let flow = analytics.flow_direction;
    if flow.magnitude() < 0.05 {
        return;
    }
    let dx = (flow.x * 50.0) as i32;
    let dy = (flow.y * 50.0) as i32;

    for track in tracks.iter().take(10) {
        let (cx, cy) = track.bbox.center();
        draw_arrow(img, cx as i32, cy as i32, cx as i32 + dx, cy as i32 + dy, YELLOW);
    }
}

fn draw_metrics_hud(img: &mut RgbImage, analytics: &AnalyticsSample) {
    let lines = [
        format!("PEOPLE: {}", analytics.people_count),
        format!("DENSITY: {:.1}%", analytics.density * 100.0),
        format!("SPEED: {:.1} PX/S", analytics.avg_speed),
        format!("CONGESTION: {}", analytics.congestion_level.as_str().to_uppercase()),
        format!(
            "RISK: {} ({:.2})",
            analytics.risk_level.as_str(),
            analytics.risk_score
        ),
    ];

    let panel_h = 12 * lines.len() as u32 + 8;
    darken_rect(img, 0, 0, img.width(), panel_h.min(img.height()));

    for (i, line) in lines.iter().enumerate() {
        let color = if line.starts_with("RISK") {
            risk_color(analytics.risk_level)
        } else {
            WHITE
        };
        draw_text(img, line, 8, 8 + 12 * i as i32, 1, color);
    }
}

fn draw_risk_bar(img: &mut RgbImage, analytics: &AnalyticsSample) {
    let width = (img.width() as f32 * analytics.risk_score.clamp(0.0, 1.0)) as u32;
    let color = risk_color(analytics.risk_level);
    for y in 0..5.min(img.height()) {
        for x in 0..width.min(img.width()) {
            img.put_pixel(x, y, color);
        }
    }
}

fn draw_rect(img: &mut RgbImage, x: i32, y: i32, w: i32, h: i32, color: Rgb<u8>) {
    draw_line(img, x, y, x + w, y, color);
    draw_line(img, x, y + h, x + w, y + h, color);
    draw_line(img, x, y, x, y + h, color);
    draw_line(img, x + w, y, x + w, y + h, color);
}

fn darken_rect(img: &mut RgbImage, x0: u32, y0: u32, w: u32, h: u32) {
    for y in y0..(y0 + h).min(img.height()) {
        for x in x0..(x0 + w).min(img.width()) {
            let p = img.get_pixel_mut(x, y);
            for c in 0..3 {
                p.0[c] = (p.0[c] as f32 * 0.45) as u8;
            }
        }
    }
}

/// Bresenham line, clipped to the image bounds.
fn draw_line(img: &mut RgbImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgb<u8>) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let (mut x, mut y) = (x0, y0);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if x >= 0 && y >= 0 && x < w && y < h {
            img.put_pixel(x as u32, y as u32, color);
        }
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn draw_arrow(img: &mut RgbImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgb<u8>) {
    draw_line(img, x0, y0, x1, y1, color);

    let dx = (x1 - x0) as f32;
    let dy = (y1 - y0) as f32;
    let len = (dx * dx + dy * dy).sqrt();
    if len < 1.0 {
        return;
    }
    let (ux, uy) = (dx / len, dy / len);
    let head = (len * 0.3).clamp(4.0, 12.0);
    // Two head strokes at +-30 degrees off the shaft
    for sign in [-1.0f32, 1.0] {
        let angle = sign * 0.5236f32;
        let (sin, cos) = angle.sin_cos();
        let hx = x1 - ((ux * cos - uy * sin) * head) as i32;
        let hy = y1 - ((ux * sin + uy * cos) * head) as i32;
        draw_line(img, x1, y1, hx, hy, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_ms, BBox, CongestionLevel, FlowVector};

    fn sample(risk: f32, level: RiskLevel) -> AnalyticsSample {
        AnalyticsSample {
            camera_id: "cam_A".to_string(),
            timestamp: now_ms(),
            people_count: 2,
            density: 0.4,
            avg_speed: 12.0,
            flow_direction: FlowVector { x: 1.0, y: 0.0 },
            congestion_level: CongestionLevel::Medium,
            risk_score: risk,
            risk_level: level,
        }
    }

    fn track(x: f32, state: TrackState) -> TrackSnapshot {
        TrackSnapshot {
            track_id: 1,
            bbox: BBox::new(x, 100.0, 40.0, 80.0),
            confidence: 0.9,
            state,
            total_frames: 5,
        }
    }

    #[test]
    fn annotate_does_not_mutate_input() {
        let frame = RgbImage::from_pixel(320, 240, Rgb([30, 30, 30]));
        let original = frame.clone();
        let _ = annotate(
            &frame,
            &[],
            &[track(50.0, TrackState::Confirmed)],
            &[],
            &sample(0.5, RiskLevel::Warning),
            &RenderOptions::default(),
        );
        assert_eq!(frame.as_raw(), original.as_raw());
    }

    #[test]
    fn confirmed_track_outline_is_green() {
        let frame = RgbImage::from_pixel(320, 240, Rgb([0, 0, 0]));
        let out = annotate(
            &frame,
            &[],
            &[track(50.0, TrackState::Confirmed)],
            &[],
            &sample(0.0, RiskLevel::Normal),
            &RenderOptions {
                show_metrics: false,
                show_risk_bar: false,
                show_flow: false,
                ..RenderOptions::default()
            },
        );
        // Top edge of the box at (50..90, 100)
        assert_eq!(*out.get_pixel(60, 100), GREEN);
    }

    #[test]
    fn risk_bar_width_scales_with_score() {
        let frame = RgbImage::from_pixel(200, 100, Rgb([0, 0, 0]));
        let out = annotate(
            &frame,
            &[],
            &[],
            &[],
            &sample(0.5, RiskLevel::Warning),
            &RenderOptions {
                show_metrics: false,
                ..RenderOptions::default()
            },
        );
        assert_eq!(*out.get_pixel(50, 0), ORANGE);
        assert_eq!(*out.get_pixel(150, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn boxes_at_frame_edge_do_not_panic() {
        let frame = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        let edge_track = TrackSnapshot {
            track_id: 9,
            bbox: BBox::new(90.0, 90.0, 40.0, 40.0),
            confidence: 0.9,
            state: TrackState::Confirmed,
            total_frames: 3,
        };
        let _ = annotate(
            &frame,
            &[],
            &[edge_track],
            &[],
            &sample(1.0, RiskLevel::Critical),
            &RenderOptions::default(),
        );
    }

    #[test]
    fn encode_jpeg_produces_jfif() {
        let frame = RgbImage::from_pixel(64, 48, Rgb([10, 20, 30]));
        let jpeg = encode_jpeg(&frame, 85);
        assert!(jpeg.len() > 2);
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn placeholder_carries_minimum_size() {
        let img = placeholder_frame("cam_A", 0, 0);
        assert!(img.width() >= 160 && img.height() >= 120);
    }
}
