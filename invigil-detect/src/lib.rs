//! Detection-model post-processing and the opaque model-runtime interface.
//!
//! The node treats its neural networks as "run tensor, get tensor back"
//! capabilities behind [`ModelRuntime`]; everything that interprets the raw
//! detector output lives here: decode, confidence filtering, NMS and
//! rescaling back to original-frame coordinates.

use std::path::Path;

use ndarray::ArrayD;

use invigil_types::DetectionBox;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("inference error: {0}")]
    Infer(String),
    #[error("unexpected tensor shape {got:?}, expected {expected}")]
    Shape { expected: String, got: Vec<usize> },
}

/// A loaded model. Owned exclusively by the inference stage; never shared
/// across threads.
pub trait Model: Send {
    fn infer(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, ModelError>;
}

/// Factory for loading models onto a device. The concrete runtime is wired
/// in at composition time.
pub trait ModelRuntime: Send + Sync {
    fn load(&self, path: &Path, device_id: i32) -> Result<Box<dyn Model>, ModelError>;
}

/// A runtime that cannot load anything. Used when the node is built without
/// an inference backend; the load failure surfaces through `last_error`.
pub struct UnavailableRuntime;

impl ModelRuntime for UnavailableRuntime {
    fn load(&self, _path: &Path, _device_id: i32) -> Result<Box<dyn Model>, ModelError> {
        Err(ModelError::Load(
            "no model runtime compiled into this build".to_string(),
        ))
    }
}

/// Candidate box in detector-input coordinates, top-left form.
#[derive(Clone, Copy)]
struct Candidate {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    score: f32,
    /// Anchor index, used as the deterministic tie-breaker.
    index: usize,
}

impl Candidate {
    fn iou(&self, other: &Candidate) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.w * self.h + other.w * other.h - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Decode a raw detection tensor into boxes in original-frame coordinates.
///
/// The tensor is shaped `(1, 4+K, N)`: per anchor a center-form box in
/// detector-input resolution followed by `K` class scores. Rows below
/// `conf_thres` are dropped, class-agnostic NMS runs at `iou_thres`, and the
/// survivors are rescaled by per-axis ratios to `orig_size = (w, h)`,
/// cast to integers and clipped to the image bounds. The returned order is
/// the NMS keep order.
pub fn decode_detections(
    pred: &ArrayD<f32>,
    orig_size: (usize, usize),
    conf_thres: f32,
    iou_thres: f32,
    det_size: (usize, usize),
) -> Result<Vec<DetectionBox>, ModelError> {
    let shape = pred.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
        return Err(ModelError::Shape {
            expected: "(1, 4+K, N) with K >= 1".to_string(),
            got: shape.to_vec(),
        });
    }
    let num_classes = shape[1] - 4;
    let num_anchors = shape[2];

    let mut candidates = Vec::new();
    for a in 0..num_anchors {
        let mut score = 0.0f32;
        for c in 0..num_classes {
            let s = pred[[0, 4 + c, a]];
            if s > score {
                score = s;
            }
        }
        if score <= conf_thres {
            continue;
        }
        let cx = pred[[0, 0, a]];
        let cy = pred[[0, 1, a]];
        let w = pred[[0, 2, a]];
        let h = pred[[0, 3, a]];
        candidates.push(Candidate {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
            score,
            index: a,
        });
    }
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let keep = nms(&mut candidates, iou_thres);

    let (ow, oh) = orig_size;
    let (dw, dh) = det_size;
    let ws = ow as f32 / dw as f32;
    let hs = oh as f32 / dh as f32;
    let boxes = keep
        .into_iter()
        .filter_map(|c| {
            let b = DetectionBox {
                x1: ((c.x * ws) as i32).clamp(0, ow as i32 - 1),
                y1: ((c.y * hs) as i32).clamp(0, oh as i32 - 1),
                x2: (((c.x + c.w) * ws) as i32).clamp(0, ow as i32 - 1),
                y2: (((c.y + c.h) * hs) as i32).clamp(0, oh as i32 - 1),
                score: c.score,
            };
            // A box entirely beyond an edge collapses under clamping; such
            // boxes carry no image area and are dropped.
            if b.x1 < b.x2 && b.y1 < b.y2 {
                Some(b)
            } else {
                None
            }
        })
        .collect();
    Ok(boxes)
}

/// Class-agnostic greedy NMS. Candidates are taken highest score first
/// (anchor index breaks ties); each kept box suppresses later boxes whose
/// IoU with it exceeds the threshold.
fn nms(candidates: &mut Vec<Candidate>, iou_thres: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    let mut keep = Vec::with_capacity(candidates.len());
    while !candidates.is_empty() {
        let best = candidates.remove(0);
        candidates.retain(|c| c.iou(&best) <= iou_thres);
        keep.push(best);
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    const DET: (usize, usize) = (640, 640);

    /// Build a `(1, 4+K, N)` tensor from per-anchor rows
    /// `[cx, cy, w, h, s0, s1, ...]`.
    fn tensor(rows: &[Vec<f32>]) -> ArrayD<f32> {
        let n = rows.len();
        let c = rows[0].len();
        let mut t = ArrayD::zeros(IxDyn(&[1, c, n]));
        for (a, row) in rows.iter().enumerate() {
            for (f, v) in row.iter().enumerate() {
                t[[0, f, a]] = *v;
            }
        }
        t
    }

    #[test]
    fn empty_when_below_confidence() {
        let t = tensor(&[vec![320.0, 320.0, 100.0, 100.0, 0.1, 0.2]]);
        let boxes = decode_detections(&t, (640, 640), 0.5, 0.45, DET).unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn single_box_decodes_to_corner_form() {
        let t = tensor(&[vec![320.0, 320.0, 100.0, 200.0, 0.9]]);
        let boxes = decode_detections(&t, (640, 640), 0.25, 0.45, DET).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (270, 220, 370, 420));
        assert!((b.score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn rescales_with_per_axis_ratios() {
        // Original frame 1280x480 against 640x640 input: x doubles, y shrinks.
        let t = tensor(&[vec![320.0, 320.0, 100.0, 100.0, 0.9]]);
        let boxes = decode_detections(&t, (1280, 480), 0.25, 0.45, DET).unwrap();
        let b = boxes[0];
        assert_eq!((b.x1, b.x2), (540, 740));
        assert_eq!((b.y1, b.y2), (202, 277));
    }

    #[test]
    fn clips_to_image_bounds() {
        let t = tensor(&[vec![0.0, 0.0, 100.0, 100.0, 0.9]]);
        let boxes = decode_detections(&t, (640, 640), 0.25, 0.45, DET).unwrap();
        let b = boxes[0];
        assert_eq!((b.x1, b.y1), (0, 0));
        assert_eq!((b.x2, b.y2), (50, 50));
    }

    #[test]
    fn drops_boxes_entirely_outside_the_frame() {
        // One anchor far past the right edge, one far above the top; both
        // would collapse to zero-area boxes under clamping. A valid anchor
        // rides along to show decoding still works.
        let t = tensor(&[
            vec![800.0, 320.0, 40.0, 40.0, 0.9],
            vec![320.0, -100.0, 40.0, 40.0, 0.9],
            vec![320.0, 320.0, 40.0, 40.0, 0.9],
        ]);
        let boxes = decode_detections(&t, (640, 640), 0.25, 0.45, DET).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        assert!(b.x1 < b.x2 && b.y1 < b.y2);
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (300, 300, 340, 340));
    }

    #[test]
    fn nms_suppresses_overlap_keeps_best_first() {
        let t = tensor(&[
            vec![320.0, 320.0, 100.0, 100.0, 0.7],
            vec![322.0, 320.0, 100.0, 100.0, 0.9],
            vec![100.0, 100.0, 50.0, 50.0, 0.8],
        ]);
        let boxes = decode_detections(&t, (640, 640), 0.25, 0.45, DET).unwrap();
        assert_eq!(boxes.len(), 2);
        // Keep order is by descending score: the 0.9 box, then the 0.8 one.
        assert!((boxes[0].score - 0.9).abs() < 1e-6);
        assert!((boxes[1].score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn max_class_score_selects_row() {
        // Second class carries the high score; the row must survive.
        let t = tensor(&[vec![320.0, 320.0, 100.0, 100.0, 0.05, 0.95, 0.1]]);
        let boxes = decode_detections(&t, (640, 640), 0.5, 0.45, DET).unwrap();
        assert_eq!(boxes.len(), 1);
    }

    #[test]
    fn rejects_wrong_shape() {
        let t = ArrayD::<f32>::zeros(IxDyn(&[1, 3]));
        assert!(matches!(
            decode_detections(&t, (640, 640), 0.25, 0.45, DET),
            Err(ModelError::Shape { .. })
        ));
    }

    #[test]
    fn unavailable_runtime_fails_to_load() {
        let rt = UnavailableRuntime;
        assert!(matches!(
            rt.load(Path::new("models/det.onnx"), 0),
            Err(ModelError::Load(_))
        ));
    }
}
