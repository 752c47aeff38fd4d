//! Short-horizon multi-object tracker used for seat calibration.
//!
//! Tracks are matched to per-frame detections by minimum-cost assignment
//! over `1 - IoU`, accepting only matches above an IoU threshold. The
//! tracker runs for a short calibration window; the surviving tracks'
//! average centers become the seat map for the rest of the exam.

pub mod hungarian;

use invigil_types::{DetectionBox, SeatMap};

pub const DEFAULT_MAX_AGE: u32 = 10;
pub const DEFAULT_IOU_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct Track {
    id: u32,
    /// Full box history, appended on every match.
    boxes: Vec<DetectionBox>,
    frames_since_update: u32,
}

impl Track {
    fn new(id: u32, first: DetectionBox) -> Self {
        Self {
            id,
            boxes: vec![first],
            frames_since_update: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn latest(&self) -> &DetectionBox {
        // History is never empty: a track is born with its first box.
        &self.boxes[self.boxes.len() - 1]
    }

    /// Average center over the whole history, rounded to integer pixels.
    pub fn avg_center(&self) -> (i32, i32) {
        let n = self.boxes.len() as f64;
        let (sx, sy) = self.boxes.iter().fold((0.0, 0.0), |(sx, sy), b| {
            let (cx, cy) = b.center();
            (sx + cx, sy + cy)
        });
        ((sx / n).round() as i32, (sy / n).round() as i32)
    }
}

#[derive(Debug, Clone)]
pub struct SeatTracker {
    tracks: Vec<Track>,
    next_id: u32,
    max_age: u32,
    iou_threshold: f64,
}

impl Default for SeatTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE, DEFAULT_IOU_THRESHOLD)
    }
}

impl SeatTracker {
    pub fn new(max_age: u32, iou_threshold: f64) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 0,
            max_age,
            iou_threshold,
        }
    }

    /// Forget all tracks and restart id numbering.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 0;
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Feed one frame's detections into the tracker.
    pub fn update(&mut self, detections: &[DetectionBox]) {
        if self.tracks.is_empty() {
            for det in detections {
                self.spawn(*det);
            }
            return;
        }

        // Cost matrix over current tracks x detections.
        let cost: Vec<Vec<f64>> = self
            .tracks
            .iter()
            .map(|t| {
                detections
                    .iter()
                    .map(|d| 1.0 - t.latest().iou(d))
                    .collect()
            })
            .collect();
        let assignment = hungarian::solve(&cost);

        let accept_below = 1.0 - self.iou_threshold;
        let mut det_matched = vec![false; detections.len()];
        for (ti, col) in assignment.iter().enumerate() {
            match col {
                // A pairing only counts when the IoU clears the threshold.
                Some(di) if cost[ti][*di] < accept_below => {
                    self.tracks[ti].boxes.push(detections[*di]);
                    self.tracks[ti].frames_since_update = 0;
                    det_matched[*di] = true;
                }
                _ => {
                    self.tracks[ti].frames_since_update += 1;
                }
            }
        }

        // Unmatched detections spawn fresh tracks, in detection order so id
        // assignment stays deterministic.
        for (di, matched) in det_matched.iter().enumerate() {
            if !matched {
                self.spawn(detections[di]);
            }
        }

        let max_age = self.max_age;
        self.tracks.retain(|t| t.frames_since_update <= max_age);
    }

    fn spawn(&mut self, det: DetectionBox) {
        self.tracks.push(Track::new(self.next_id, det));
        self.next_id += 1;
    }

    /// Average center of each surviving track, keyed by track id.
    pub fn final_centers(&self) -> SeatMap {
        self.tracks
            .iter()
            .map(|t| (t.id, t.avg_center()))
            .collect()
    }
}
