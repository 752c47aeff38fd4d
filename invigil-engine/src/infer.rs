//! Inference worker: owns the two models between a rising and falling edge
//! of the inference gate, runs detection + classification per frame, and
//! drives the calibration tracker while the tracking gate is up.

use std::sync::Arc;

use ndarray::ArrayD;
use tracing::{info, warn};

use invigil_detect::{decode_detections, Model, ModelError, ModelRuntime};
use invigil_exam::ExamManager;
use invigil_types::{ClassId, DetectionBox, Frame};
use lossy_queue::{LossyQueue, PollError};
use seat_tracker::SeatTracker;

use crate::{EngineShared, InferOut, InferParams, IDLE_SLEEP, POLL_INTERVAL};

pub(crate) fn run_inference(
    shared: Arc<EngineShared>,
    runtime: Arc<dyn ModelRuntime>,
    params: InferParams,
    raw_q: LossyQueue<Frame>,
    result_q: LossyQueue<InferOut>,
    exam: Arc<ExamManager>,
) {
    let gates = &shared.gates;
    let status = &shared.status;

    while !gates.exiting() {
        if !gates.inference_on() {
            status.set_inferring(false);
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        info!("loading models (device {})", params.device_id);
        let loaded = runtime
            .load(&params.det_model_path, params.device_id)
            .and_then(|det| {
                runtime
                    .load(&params.cls_model_path, params.device_id)
                    .map(|cls| (det, cls))
            });
        let (mut det_model, mut cls_model) = match loaded {
            Ok(models) => models,
            Err(e) => {
                warn!("model load failed: {e}");
                status.set_error(format!("model load failed: {e}"));
                gates.set_inference(false);
                continue;
            }
        };
        status.set_inferring(true);
        status.clear_error();

        // Reusable input buffers, allocated once per model session.
        let (dw, dh) = params.det_size;
        let (cw, ch) = params.cls_size;
        let mut det_buffer = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, dh, dw, 3]));
        let mut cls_buffer =
            ArrayD::<f32>::zeros(ndarray::IxDyn(&[params.cls_batch, ch, cw, 3]));

        let mut tracker = SeatTracker::default();
        let mut tracking_active = false;
        let mut track_frames = 0u32;

        while gates.inference_on() && !gates.exiting() {
            let frame = match raw_q.poll(POLL_INTERVAL) {
                Ok(frame) => frame,
                Err(PollError::TimedOut) => continue,
                Err(PollError::Shutdown) => break,
            };

            let boxes = match detect(
                &frame,
                det_model.as_mut(),
                &mut det_buffer,
                &params,
            ) {
                Ok(boxes) => boxes,
                Err(e) => {
                    warn!("detection failed, skipping frame: {e}");
                    continue;
                }
            };

            // Calibration window: feed the tracker until it has seen enough
            // frames, then hand the averaged centers to the exam manager.
            if gates.tracking_on() {
                if !tracking_active {
                    tracker.reset();
                    track_frames = 0;
                    tracking_active = true;
                }
                tracker.update(&boxes);
                track_frames += 1;
                if track_frames >= params.track_max_frames {
                    let centers = tracker.final_centers();
                    info!("calibration window complete: {} seats", centers.len());
                    gates.set_tracking(false);
                    tracking_active = false;
                    track_frames = 0;
                    exam.complete_calibration(centers);
                }
            } else {
                tracking_active = false;
            }

            let classes = match classify(
                &frame,
                &boxes,
                cls_model.as_mut(),
                &mut cls_buffer,
                &params,
            ) {
                Ok(classes) => classes,
                Err(e) => {
                    warn!("classification failed, skipping frame: {e}");
                    continue;
                }
            };

            // Timed offer; the result is dropped if the post-processor is
            // falling behind.
            let _ = result_q.push_within(
                InferOut {
                    frame,
                    boxes,
                    classes,
                },
                POLL_INTERVAL,
            );
        }

        info!("releasing model handles");
        drop(det_model);
        drop(cls_model);
        status.set_inferring(false);
    }

    status.set_inferring(false);
}

fn fill_nhwc(buffer: &mut ArrayD<f32>, row: usize, frame: &Frame) {
    let plane = frame.data.len();
    let mut slot = buffer
        .index_axis_mut(ndarray::Axis(0), row);
    for (dst, src) in slot.iter_mut().zip(frame.data.iter()) {
        *dst = *src as f32;
    }
    debug_assert_eq!(slot.len(), plane);
}

fn detect(
    frame: &Frame,
    det_model: &mut dyn Model,
    det_buffer: &mut ArrayD<f32>,
    params: &InferParams,
) -> Result<Vec<DetectionBox>, ModelError> {
    let (dw, dh) = params.det_size;
    let det_in = invigil_imops::resize_exact(frame, dw, dh)
        .map_err(|e| ModelError::Infer(format!("resize to detector input failed: {e}")))?;
    fill_nhwc(det_buffer, 0, &det_in);
    let raw = det_model.infer(det_buffer)?;
    decode_detections(
        &raw,
        (frame.width, frame.height),
        params.conf_thres,
        params.iou_thres,
        params.det_size,
    )
}

fn classify(
    frame: &Frame,
    boxes: &[DetectionBox],
    cls_model: &mut dyn Model,
    cls_buffer: &mut ArrayD<f32>,
    params: &InferParams,
) -> Result<Vec<ClassId>, ModelError> {
    let mut classes = vec![0 as ClassId; boxes.len()];
    if boxes.is_empty() {
        return Ok(classes);
    }
    let (cw, ch) = params.cls_size;

    // Decoded boxes always have positive area; any degenerate box from
    // another source keeps class 0 and is skipped for cropping.
    let croppable: Vec<usize> = (0..boxes.len()).filter(|i| boxes[*i].area() > 0).collect();

    for chunk in croppable.chunks(params.cls_batch) {
        for (row, &i) in chunk.iter().enumerate() {
            let crop = invigil_imops::crop(frame, &boxes[i]);
            let resized = invigil_imops::resize_exact(&crop, cw, ch)
                .map_err(|e| ModelError::Infer(format!("crop resize failed: {e}")))?;
            fill_nhwc(cls_buffer, row, &resized);
        }
        let out = cls_model.infer(cls_buffer)?;
        let shape = out.shape().to_vec();
        if shape.len() != 2 || shape[0] < chunk.len() {
            return Err(ModelError::Shape {
                expected: format!("(>= {}, K)", chunk.len()),
                got: shape,
            });
        }
        let num_classes = shape[1];
        // Only the rows belonging to this chunk are meaningful; the rest of
        // the reused buffer may hold stale crops.
        for (row, &i) in chunk.iter().enumerate() {
            let mut best = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for c in 0..num_classes {
                let s = out[[row, c]];
                if s > best_score {
                    best_score = s;
                    best = c;
                }
            }
            classes[i] = best;
        }
    }
    Ok(classes)
}
