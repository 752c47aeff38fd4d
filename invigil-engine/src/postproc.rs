//! Post-processing worker: attributes detections to seats, maintains the
//! anomaly ledger through the exam manager, captures evidence snapshots,
//! annotates and encodes the live frame, and publishes it to the frame bus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use frame_bus::FrameBus;
use invigil_exam::{ExamManager, FrameCtx};
use invigil_types::{AlertUpload, ClassId, DetectionBox, Frame, SeatId};
use lossy_queue::{LossyQueue, PollError};

use crate::fps::FpsWindow;
use crate::{EngineShared, InferOut, PostParams, POLL_INTERVAL};

const RED: [u8; 3] = [0, 0, 255];
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: i32 = 2;

pub(crate) fn run_postproc(
    shared: Arc<EngineShared>,
    params: PostParams,
    result_q: LossyQueue<InferOut>,
    bus: FrameBus,
    exam: Arc<ExamManager>,
    alert_tx: tokio::sync::mpsc::UnboundedSender<AlertUpload>,
) {
    let gates = &shared.gates;
    let status = &shared.status;
    let mut fps_window = FpsWindow::new(params.fps_window);

    while !gates.exiting() {
        let item = match result_q.poll(POLL_INTERVAL) {
            Ok(item) => item,
            Err(PollError::Shutdown) => break,
            Err(PollError::TimedOut) => {
                if !gates.inference_on() {
                    // Pipeline idle: drop the stale public frame and stats.
                    bus.clear();
                    fps_window.reset();
                    status.set_fps(0.0);
                }
                continue;
            }
        };

        let InferOut {
            mut frame,
            boxes,
            classes,
        } = item;

        let ctx = exam.begin_frame();
        // Snapshots are rendered from a pristine copy, before boxes are
        // drawn over the live frame.
        let pristine = match &ctx {
            Some(_) if !boxes.is_empty() => Some(frame.clone()),
            _ => None,
        };

        let mut counted: Vec<SeatId> = Vec::new();
        let mut candidates: BTreeMap<(SeatId, ClassId), DetectionBox> = BTreeMap::new();
        for (i, b) in boxes.iter().enumerate() {
            let class = classes.get(i).copied().unwrap_or(0);
            if let Some(ctx) = &ctx {
                if let Some(seat) = nearest_seat(ctx, b, params.match_threshold) {
                    if params.anomaly_classes.contains(&class) {
                        counted.push(seat);
                    }
                    if params.snapshot_classes.contains(&class) {
                        // Last occurrence within the frame wins.
                        candidates.insert((seat, class), *b);
                    }
                }
            }
            invigil_imops::draw_rect(&mut frame, b, params.palette.color(class), BOX_THICKNESS);
        }

        if let Some(ctx) = &ctx {
            let keys: Vec<(SeatId, ClassId)> = candidates.keys().copied().collect();
            let fired = exam.apply_observations(ctx.frame_no, &counted, &keys);
            for (seat, class) in fired {
                let Some(b) = candidates.get(&(seat, class)) else {
                    continue;
                };
                let Some(base) = pristine.as_ref() else {
                    continue;
                };
                if gates.exiting() {
                    break;
                }
                write_snapshot(base, b, seat, class, ctx, &params, &alert_tx);
            }
        }

        fps_window.tick(Instant::now());
        status.set_fps(fps_window.fps());

        let out = if params.jpeg_width > 0 {
            match invigil_imops::resize_to_width(&frame, params.jpeg_width) {
                Ok(resized) => resized,
                Err(e) => {
                    warn!("output resize failed: {e}");
                    frame
                }
            }
        } else {
            frame
        };
        match invigil_imops::encode_jpeg(&out, params.jpeg_quality) {
            Ok(jpeg) => {
                let id = bus.publish(Bytes::from(jpeg));
                debug!("published frame {id}");
            }
            Err(e) => warn!("JPEG encode failed: {e}"),
        }
    }
}

/// Nearest seat within the attribution radius, if any. Ties resolve to the
/// lowest seat id (seat map iteration order).
fn nearest_seat(ctx: &FrameCtx, b: &DetectionBox, threshold: f64) -> Option<SeatId> {
    let (cx, cy) = b.center();
    let mut best: Option<(SeatId, f64)> = None;
    for (seat, (sx, sy)) in &ctx.seat_map {
        let dist = ((cx - *sx as f64).powi(2) + (cy - *sy as f64).powi(2)).sqrt();
        if best.map_or(true, |(_, d)| dist < d) {
            best = Some((*seat, dist));
        }
    }
    match best {
        Some((seat, dist)) if dist <= threshold => Some(seat),
        _ => None,
    }
}

/// Render and persist one evidence snapshot, then queue its alert upload.
fn write_snapshot(
    base: &Frame,
    b: &DetectionBox,
    seat: SeatId,
    class: ClassId,
    ctx: &FrameCtx,
    params: &PostParams,
    alert_tx: &tokio::sync::mpsc::UnboundedSender<AlertUpload>,
) {
    let mut snap = base.clone();
    invigil_imops::draw_rect(&mut snap, b, RED, BOX_THICKNESS);
    let (cx, cy) = b.center();
    let (sx, sy) = (cx as i32, cy as i32);
    let label = format!("Seat {}: {}", seat, params.palette.name(class));
    invigil_imops::draw_label(&mut snap, &label, sx, sy, RED, LABEL_SCALE);

    let jpeg = match invigil_imops::encode_jpeg(&snap, params.jpeg_quality) {
        Ok(jpeg) => Bytes::from(jpeg),
        Err(e) => {
            warn!("snapshot encode failed: {e}");
            return;
        }
    };

    let epoch = chrono::Utc::now().timestamp();
    let filename = format!(
        "snapshot_seat{}_x{}_y{}_cls{}_{}.jpg",
        seat, sx, sy, class, epoch
    );
    let path = ctx.snapshot_dir.join(filename);
    if let Err(e) = std::fs::write(&path, &jpeg) {
        warn!("failed to write snapshot {}: {e}", path.display());
    } else {
        debug!("snapshot written: {}", path.display());
    }

    let _ = alert_tx.send(AlertUpload {
        room_id: ctx.classroom_id,
        exam_id: ctx.exam_id,
        class_id: class,
        seat_id: seat,
        x: sx,
        y: sy,
        jpeg,
    });
}
