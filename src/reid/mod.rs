//! Re-ID - Appearance Embeddings
//!
//! ## Responsibilities
//!
//! - Extract a fixed-length appearance embedding for a person crop
//! - Maintain per-track embeddings with an exponential moving average
//! - Compare embeddings by cosine similarity
//!
//! The embedding fuses a coarse luminance patch grid (256 dims) with a
//! hue-weighted HSV histogram (256 dims) into a single L2-normalised
//! 512-vector, so similarity captures both silhouette and clothing colour.

use crate::models::BBox;
use image::RgbImage;

/// Embedding dimensionality.
pub const EMBEDDING_DIM: usize = 512;

const PATCH_GRID: usize = 16; // 16x16 luminance cells
const HIST_BINS: usize = 256;

/// Capability interface for appearance extraction. The concrete encoder is
/// injected at startup; tests substitute fakes.
pub trait AppearanceEncoder: Send + Sync {
    /// Extract an L2-normalised embedding for the given box of the frame.
    /// Degenerate crops produce the zero vector, which never matches.
    fn extract(&self, frame: &RgbImage, bbox: &BBox) -> Vec<f32>;
}

/// Built-in fusion encoder: luminance patch grid + HSV colour histogram.
#[derive(Debug, Default)]
pub struct HsvHistogramEncoder;

impl HsvHistogramEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl AppearanceEncoder for HsvHistogramEncoder {
    fn extract(&self, frame: &RgbImage, bbox: &BBox) -> Vec<f32> {
        let clamped = bbox.clamped(frame.width(), frame.height());
        let x0 = clamped.x as u32;
        let y0 = clamped.y as u32;
        let w = (clamped.width as u32).max(1);
        let h = (clamped.height as u32).max(1);

        if w < 2 || h < 2 {
            return vec![0.0; EMBEDDING_DIM];
        }

        // Appearance half: mean luminance over a PATCH_GRID x PATCH_GRID grid
        let mut patches = vec![0.0f32; PATCH_GRID * PATCH_GRID];
        let mut patch_counts = vec![0u32; PATCH_GRID * PATCH_GRID];

        // Colour half: hue histogram weighted by saturation
        let mut hist = vec![0.0f32; HIST_BINS];

        for dy in 0..h {
            for dx in 0..w {
                let px = frame.get_pixel(x0 + dx, y0 + dy).0;
                let (r, g, b) = (px[0] as f32, px[1] as f32, px[2] as f32);

                let luma = (0.299 * r + 0.587 * g + 0.114 * b) / 255.0;
                let gx = (dx as usize * PATCH_GRID / w as usize).min(PATCH_GRID - 1);
                let gy = (dy as usize * PATCH_GRID / h as usize).min(PATCH_GRID - 1);
                patches[gy * PATCH_GRID + gx] += luma;
                patch_counts[gy * PATCH_GRID + gx] += 1;

                let (hue, sat) = rgb_to_hue_sat(r, g, b);
                let bin = ((hue / 360.0) * HIST_BINS as f32) as usize % HIST_BINS;
                hist[bin] += sat;
            }
        }

        for (p, c) in patches.iter_mut().zip(&patch_counts) {
            if *c > 0 {
                *p /= *c as f32;
            }
        }

        let hist_sum: f32 = hist.iter().sum();
        if hist_sum > 0.0 {
            for v in hist.iter_mut() {
                *v /= hist_sum;
            }
        }

        let mut embedding = Vec::with_capacity(EMBEDDING_DIM);
        embedding.extend_from_slice(&patches);
        embedding.extend_from_slice(&hist);
        l2_normalize(&mut embedding);
        embedding
    }
}

fn rgb_to_hue_sat(r: f32, g: f32, b: f32) -> (f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    if delta <= f32::EPSILON || max <= f32::EPSILON {
        return (0.0, 0.0);
    }

    let hue = if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let hue = if hue < 0.0 { hue + 360.0 } else { hue };
    (hue, delta / max)
}

/// Normalise a vector to unit L2 norm in place. The zero vector stays zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Fold a fresh embedding into the stored one: `e <- (1-a) e + a e_new`,
/// renormalised so the stored vector stays unit length.
pub fn ema_update(stored: &mut Vec<f32>, fresh: &[f32], alpha: f32) {
    if stored.len() != fresh.len() {
        *stored = fresh.to_vec();
        return;
    }
    for (s, f) in stored.iter_mut().zip(fresh) {
        *s = (1.0 - alpha) * *s + alpha * f;
    }
    l2_normalize(stored);
}

/// Cosine similarity clipped to [0, 1]. NaN inputs and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    let sim = dot / (na * nb);
    if sim.is_nan() {
        return 0.0;
    }
    sim.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid_image(w: u32, h: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb(color))
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn embedding_has_unit_norm_and_full_dim() {
        let img = solid_image(640, 480, [200, 40, 40]);
        let enc = HsvHistogramEncoder::new();
        let e = enc.extract(&img, &BBox::new(100.0, 100.0, 60.0, 120.0));
        assert_eq!(e.len(), EMBEDDING_DIM);
        assert!((norm(&e) - 1.0).abs() < 0.05);
    }

    #[test]
    fn same_crop_is_self_similar() {
        let img = solid_image(640, 480, [10, 80, 230]);
        let enc = HsvHistogramEncoder::new();
        let a = enc.extract(&img, &BBox::new(50.0, 50.0, 60.0, 120.0));
        let b = enc.extract(&img, &BBox::new(50.0, 50.0, 60.0, 120.0));
        assert!(cosine_similarity(&a, &b) > 0.99);
    }

    #[test]
    fn different_colors_are_less_similar_than_same() {
        let red = solid_image(200, 200, [220, 30, 30]);
        let blue = solid_image(200, 200, [30, 30, 220]);
        let enc = HsvHistogramEncoder::new();
        let bbox = BBox::new(20.0, 20.0, 100.0, 150.0);

        let r1 = enc.extract(&red, &bbox);
        let r2 = enc.extract(&red, &bbox);
        let b1 = enc.extract(&blue, &bbox);

        assert!(cosine_similarity(&r1, &r2) > cosine_similarity(&r1, &b1));
    }

    #[test]
    fn ema_keeps_unit_norm() {
        let img = solid_image(640, 480, [120, 200, 60]);
        let enc = HsvHistogramEncoder::new();
        let mut stored = enc.extract(&img, &BBox::new(0.0, 0.0, 100.0, 200.0));
        let fresh = enc.extract(&img, &BBox::new(200.0, 100.0, 100.0, 200.0));

        for _ in 0..10 {
            ema_update(&mut stored, &fresh, 0.3);
            let n = norm(&stored);
            assert!((0.95..=1.05).contains(&n), "norm drifted to {n}");
        }
    }

    #[test]
    fn cosine_is_clipped_to_unit_interval() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
        assert_eq!(cosine_similarity(&a, &a), 1.0);
    }

    #[test]
    fn zero_vector_never_matches() {
        let zero = vec![0.0; 4];
        let unit = vec![1.0, 0.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&zero, &unit), 0.0);
    }

    #[test]
    fn degenerate_crop_is_zero() {
        let img = solid_image(100, 100, [50, 50, 50]);
        let enc = HsvHistogramEncoder::new();
        let e = enc.extract(&img, &BBox::new(99.5, 99.5, 0.1, 0.1));
        assert!(e.iter().all(|&x| x == 0.0));
    }
}
