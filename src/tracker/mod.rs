//! Tracker - IoU Multi-Object Tracking
//!
//! ## Responsibilities
//!
//! - Associate detections to persistent per-camera track ids
//! - Manage the track lifecycle (tentative -> confirmed -> terminated)
//! - Hold each track's re-id embedding between frames
//!
//! Two-stage greedy IoU association in the style of simple online tracking:
//! confirmed tracks get first pick of the detections, tentative tracks
//! compete for the remainder. Tracker state is private to one camera worker
//! (single writer).

use crate::models::{BBox, Detection, TrackState, TrackSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Tracker tunables.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection/track association
    pub iou_threshold: f32,
    /// Hits before a tentative track is confirmed
    pub min_hits: u32,
    /// Consecutive misses before a track is terminated
    pub max_age: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            min_hits: 3,
            max_age: 30,
        }
    }
}

/// One active track.
#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: u64,
    pub bbox: BBox,
    pub confidence: f32,
    pub hits: u32,
    pub misses: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_frames: u32,
    pub avg_confidence: f32,
    pub state: TrackState,
    /// Latest fused re-id embedding, set by the re-id stage.
    pub embedding: Option<Vec<f32>>,
}

impl Track {
    fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            track_id: self.track_id,
            bbox: self.bbox,
            confidence: self.confidence,
            state: self.state,
            total_frames: self.total_frames,
        }
    }
}

/// Per-camera tracker state.
pub struct IouTracker {
    config: TrackerConfig,
    tracks: HashMap<u64, Track>,
    next_track_id: u64,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            next_track_id: 1,
        }
    }

    /// Feed one frame of detections. Returns snapshots of the confirmed
    /// tracks visible in this frame, sorted by track id.
    pub fn update(&mut self, detections: &[Detection], frame_ts: DateTime<Utc>) -> Vec<TrackSnapshot> {
        let (confirmed_ids, tentative_ids): (Vec<u64>, Vec<u64>) = {
            let mut confirmed = Vec::new();
            let mut tentative = Vec::new();
            for (id, track) in &self.tracks {
                // Lost tracks keep confirmed-stage priority so a returning
                // person re-acquires their id ahead of tentative tracks.
                if matches!(track.state, TrackState::Confirmed | TrackState::Lost) {
                    confirmed.push(*id);
                } else {
                    tentative.push(*id);
                }
            }
            (confirmed, tentative)
        };

        // Stage 1: detections vs confirmed tracks
        let (matches1, unmatched_dets) =
            self.associate(detections, &(0..detections.len()).collect::<Vec<_>>(), &confirmed_ids);

        // Stage 2: leftover detections vs tentative tracks
        let (matches2, unmatched_dets) = self.associate(detections, &unmatched_dets, &tentative_ids);

        let mut updated_ids: Vec<u64> = Vec::new();
        for (det_idx, track_id) in matches1.into_iter().chain(matches2) {
            let det = &detections[det_idx];
            updated_ids.push(track_id);
            let min_hits = self.config.min_hits;
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.bbox = det.bbox;
                track.confidence = det.confidence;
                track.hits += 1;
                track.misses = 0;
                track.last_seen = frame_ts;
                track.total_frames += 1;
                track.avg_confidence = track.avg_confidence
                    + (det.confidence - track.avg_confidence) / track.total_frames as f32;
                match track.state {
                    TrackState::Tentative if track.total_frames >= min_hits => {
                        track.state = TrackState::Confirmed;
                        tracing::debug!(track_id, "Track confirmed");
                    }
                    TrackState::Lost => track.state = TrackState::Confirmed,
                    _ => {}
                }
            }
        }

        // New tentative tracks for unmatched detections
        for det_idx in unmatched_dets {
            let det = &detections[det_idx];
            let track_id = self.next_track_id;
            self.next_track_id += 1;
            updated_ids.push(track_id);
            let state = if self.config.min_hits <= 1 {
                TrackState::Confirmed
            } else {
                TrackState::Tentative
            };
            self.tracks.insert(
                track_id,
                Track {
                    track_id,
                    bbox: det.bbox,
                    confidence: det.confidence,
                    hits: 1,
                    misses: 0,
                    first_seen: frame_ts,
                    last_seen: frame_ts,
                    total_frames: 1,
                    avg_confidence: det.confidence,
                    state,
                    embedding: None,
                },
            );
        }

        // Age out unmatched tracks. Terminated ids never come back.
        let max_age = self.config.max_age;
        let mut terminated = Vec::new();
        for (id, track) in self.tracks.iter_mut() {
            if updated_ids.contains(id) {
                continue;
            }
            track.misses += 1;
            if track.misses >= max_age {
                track.state = TrackState::Terminated;
                terminated.push(*id);
            } else if track.state == TrackState::Confirmed {
                track.state = TrackState::Lost;
            }
        }
        for id in &terminated {
            self.tracks.remove(id);
            tracing::debug!(track_id = *id, "Track terminated");
        }

        let mut visible: Vec<TrackSnapshot> = self
            .tracks
            .values()
            .filter(|t| t.state == TrackState::Confirmed && updated_ids.contains(&t.track_id))
            .map(Track::snapshot)
            .collect();
        visible.sort_by_key(|t| t.track_id);
        visible
    }

    /// Greedy maximum-IoU assignment between a subset of detections and a
    /// subset of tracks. Ties break on higher detection confidence, then
    /// lower track id. Returns (matches, still-unmatched detection indices).
    fn associate(
        &self,
        detections: &[Detection],
        det_indices: &[usize],
        track_ids: &[u64],
    ) -> (Vec<(usize, u64)>, Vec<usize>) {
        if det_indices.is_empty() || track_ids.is_empty() {
            return (Vec::new(), det_indices.to_vec());
        }

        let mut pairs: Vec<(f32, f32, u64, usize)> = Vec::new();
        for &di in det_indices {
            let det = &detections[di];
            for &tid in track_ids {
                let track = &self.tracks[&tid];
                let iou = det.bbox.iou(&track.bbox);
                if iou >= self.config.iou_threshold {
                    pairs.push((iou, det.confidence, tid, di));
                }
            }
        }

        pairs.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.2.cmp(&b.2))
        });

        let mut matches = Vec::new();
        let mut used_dets = vec![false; detections.len()];
        let mut used_tracks: Vec<u64> = Vec::new();

        for (_, _, tid, di) in pairs {
            if used_dets[di] || used_tracks.contains(&tid) {
                continue;
            }
            used_dets[di] = true;
            used_tracks.push(tid);
            matches.push((di, tid));
        }

        let unmatched = det_indices
            .iter()
            .copied()
            .filter(|&di| !used_dets[di])
            .collect();
        (matches, unmatched)
    }

    /// Replace a track's stored embedding. Used by the re-id stage after the
    /// EMA update.
    pub fn set_embedding(&mut self, track_id: u64, embedding: Vec<f32>) {
        if let Some(track) = self.tracks.get_mut(&track_id) {
            track.embedding = Some(embedding);
        }
    }

    pub fn embedding(&self, track_id: u64) -> Option<&Vec<f32>> {
        self.tracks.get(&track_id).and_then(|t| t.embedding.as_ref())
    }

    pub fn get(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    /// Ids of all tracks still in the active set.
    pub fn active_track_ids(&self) -> Vec<u64> {
        self.tracks.keys().copied().collect()
    }

    pub fn confirmed_count(&self) -> usize {
        self.tracks
            .values()
            .filter(|t| t.state == TrackState::Confirmed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_ms;

    fn det(x: f32, y: f32, conf: f32) -> Detection {
        Detection {
            bbox: BBox::new(x, y, 40.0, 80.0),
            confidence: conf,
            track_id: None,
        }
    }

    fn tracker() -> IouTracker {
        IouTracker::new(TrackerConfig::default())
    }

    #[test]
    fn track_confirms_after_min_hits() {
        let mut t = tracker();
        let ts = now_ms();

        assert!(t.update(&[det(100.0, 100.0, 0.9)], ts).is_empty());
        assert!(t.update(&[det(102.0, 100.0, 0.9)], ts).is_empty());
        let confirmed = t.update(&[det(104.0, 100.0, 0.9)], ts);
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].track_id, 1);
        assert_eq!(confirmed[0].state, TrackState::Confirmed);
        assert_eq!(confirmed[0].total_frames, 3);
    }

    #[test]
    fn track_ids_strictly_increase() {
        let mut t = tracker();
        let ts = now_ms();
        t.update(&[det(0.0, 0.0, 0.9), det(300.0, 0.0, 0.9)], ts);
        t.update(&[det(600.0, 300.0, 0.9)], ts);
        let mut ids = t.active_track_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn unmatched_track_terminates_after_max_age() {
        let mut t = IouTracker::new(TrackerConfig {
            max_age: 3,
            ..TrackerConfig::default()
        });
        let ts = now_ms();
        for _ in 0..3 {
            t.update(&[det(100.0, 100.0, 0.9)], ts);
        }
        assert_eq!(t.confirmed_count(), 1);

        for _ in 0..3 {
            t.update(&[], ts);
        }
        assert!(t.active_track_ids().is_empty());

        // A reappearing person gets a new id, never the old one
        for _ in 0..3 {
            t.update(&[det(100.0, 100.0, 0.9)], ts);
        }
        assert_eq!(t.active_track_ids(), vec![2]);
    }

    #[test]
    fn detection_follows_moving_person() {
        let mut t = tracker();
        let ts = now_ms();
        for i in 0..5 {
            t.update(&[det(100.0 + i as f32 * 5.0, 100.0, 0.9)], ts);
        }
        assert_eq!(t.active_track_ids(), vec![1]);
    }

    #[test]
    fn higher_iou_wins_assignment() {
        let mut t = tracker();
        let ts = now_ms();
        t.update(&[det(100.0, 100.0, 0.9)], ts);
        // Two candidates: one shifted slightly, one shifted more
        let close = det(102.0, 100.0, 0.5);
        let far = det(115.0, 100.0, 0.99);
        t.update(&[far.clone(), close.clone()], ts);

        let track = t.get(1).unwrap();
        assert_eq!(track.bbox.x, close.bbox.x);
    }

    #[test]
    fn miss_counter_resets_on_rematch() {
        let mut t = IouTracker::new(TrackerConfig {
            max_age: 3,
            ..TrackerConfig::default()
        });
        let ts = now_ms();
        for _ in 0..3 {
            t.update(&[det(100.0, 100.0, 0.9)], ts);
        }
        t.update(&[], ts);
        t.update(&[], ts);
        t.update(&[det(100.0, 100.0, 0.9)], ts);
        t.update(&[], ts);
        t.update(&[], ts);
        // 2 misses, rematch, 2 misses: never reaches max_age
        assert_eq!(t.active_track_ids(), vec![1]);
    }

    #[test]
    fn avg_confidence_tracks_mean() {
        let mut t = tracker();
        let ts = now_ms();
        t.update(&[det(100.0, 100.0, 0.8)], ts);
        t.update(&[det(100.0, 100.0, 0.6)], ts);
        let track = t.get(1).unwrap();
        assert!((track.avg_confidence - 0.7).abs() < 1e-6);
    }
}
