//! The invigil inference engine: three cooperating worker threads (video
//! reader, inference stage, post-processor) joined by bounded drop-oldest
//! queues, plus the shared gate/status records every thread observes.
//!
//! Gates are level-triggered booleans: flipping one never forces synchronous
//! quiescence, workers notice at their next loop iteration (within one poll
//! interval). The exam record is reached through [`invigil_exam::ExamManager`];
//! the exam side reaches back through the [`EngineControl`] capability
//! implemented by [`EngineHandle`].

pub mod fps;
mod infer;
mod postproc;
mod reader;
pub mod source;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use frame_bus::FrameBus;
use invigil_config::NodeConfig;
use invigil_detect::ModelRuntime;
use invigil_exam::{EngineControl, ExamManager};
use invigil_types::{AlertUpload, ClassId, ClassPalette, DetectionBox, Frame};
use lossy_queue::LossyQueue;

pub use source::{SourceError, VideoBackend, VideoStream};

/// How long workers block in one poll before re-reading their gates.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Sleep used while a worker's gate is down.
pub(crate) const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Level-triggered control signals, readable by all threads without a lock.
#[derive(Default)]
pub struct Gates {
    video: AtomicBool,
    inference: AtomicBool,
    tracking: AtomicBool,
    exit: AtomicBool,
}

impl Gates {
    pub fn video_on(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }
    pub fn set_video(&self, on: bool) {
        self.video.store(on, Ordering::SeqCst);
    }
    pub fn inference_on(&self) -> bool {
        self.inference.load(Ordering::SeqCst)
    }
    pub fn set_inference(&self, on: bool) {
        self.inference.store(on, Ordering::SeqCst);
    }
    pub fn tracking_on(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }
    pub fn set_tracking(&self, on: bool) {
        self.tracking.store(on, Ordering::SeqCst);
    }
    pub fn exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }
    /// One-way: once set, all workers drain and return.
    pub fn set_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }
}

/// Mutable engine status shared with the HTTP surface and the heartbeat.
#[derive(Default)]
pub struct EngineStatus {
    last_error: Mutex<Option<String>>,
    fps_bits: AtomicU64,
    is_inferring: AtomicBool,
    source: Mutex<Option<String>>,
}

impl EngineStatus {
    pub fn set_error(&self, msg: impl Into<String>) {
        *self.last_error.lock() = Some(msg.into());
    }
    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
    pub fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }
    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }
    pub fn set_inferring(&self, on: bool) {
        self.is_inferring.store(on, Ordering::SeqCst);
    }
    pub fn is_inferring(&self) -> bool {
        self.is_inferring.load(Ordering::SeqCst)
    }
    pub fn set_source(&self, uri: impl Into<String>) {
        *self.source.lock() = Some(uri.into());
    }
    pub fn source(&self) -> Option<String> {
        self.source.lock().clone()
    }
}

/// Everything the workers, the HTTP surface and the heartbeat share.
#[derive(Default)]
pub struct EngineShared {
    pub gates: Gates,
    pub status: EngineStatus,
}

impl EngineShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// The engine-side endpoint of the exam manager's [`EngineControl`]
/// capability.
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    pub fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }
}

impl EngineControl for EngineHandle {
    fn set_source(&self, uri: &str) {
        self.shared.status.set_source(uri);
        self.shared.status.clear_error();
        if self.shared.gates.video_on() {
            // Cycle the gate so the reader reopens with the new source.
            self.shared.gates.set_video(false);
            let shared = self.shared.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                if !shared.gates.exiting() {
                    shared.gates.set_video(true);
                }
            });
        }
    }

    fn set_video(&self, on: bool) {
        self.shared.gates.set_video(on);
    }

    fn set_inference(&self, on: bool) {
        self.shared.gates.set_inference(on);
    }

    fn begin_calibration(&self) {
        self.shared.gates.set_tracking(true);
    }

    fn cancel_calibration(&self) {
        self.shared.gates.set_tracking(false);
    }
}

/// Inference-stage configuration, resolved once at engine construction so
/// the hot loop never consults the config again.
#[derive(Debug, Clone)]
pub struct InferParams {
    pub det_model_path: PathBuf,
    pub cls_model_path: PathBuf,
    pub device_id: i32,
    /// Detection input size `(w, h)`.
    pub det_size: (usize, usize),
    /// Classification input size `(w, h)`.
    pub cls_size: (usize, usize),
    pub cls_batch: usize,
    pub conf_thres: f32,
    pub iou_thres: f32,
    pub track_max_frames: u32,
}

impl InferParams {
    pub fn from_config(cfg: &NodeConfig) -> Self {
        Self {
            det_model_path: cfg.det_model_path.clone(),
            cls_model_path: cfg.cls_model_path.clone(),
            device_id: cfg.device_id,
            det_size: (cfg.det_size[0], cfg.det_size[1]),
            cls_size: (cfg.cls_size[0], cfg.cls_size[1]),
            cls_batch: cfg.cls_batch.max(1),
            conf_thres: cfg.conf_thres,
            iou_thres: cfg.iou_thres,
            track_max_frames: cfg.track_max_frames,
        }
    }
}

/// Post-processor configuration, likewise resolved once.
#[derive(Debug, Clone)]
pub struct PostParams {
    pub palette: ClassPalette,
    pub anomaly_classes: HashSet<ClassId>,
    pub snapshot_classes: HashSet<ClassId>,
    pub match_threshold: f64,
    pub fps_window: usize,
    pub jpeg_quality: u8,
    /// 0 disables output resizing.
    pub jpeg_width: u32,
}

impl PostParams {
    pub fn from_config(cfg: &NodeConfig) -> Self {
        Self {
            palette: cfg.palette(),
            anomaly_classes: cfg.anomaly_classes.iter().copied().collect(),
            snapshot_classes: cfg.snapshot_classes.iter().copied().collect(),
            match_threshold: cfg.anomaly_match_threshold,
            fps_window: cfg.fps_window_size,
            jpeg_quality: cfg.jpeg_quality,
            jpeg_width: cfg.jpeg_width,
        }
    }
}

/// One inference result traveling from the inference stage to the
/// post-processor. `classes` is index-aligned with `boxes`.
pub struct InferOut {
    pub frame: Frame,
    pub boxes: Vec<DetectionBox>,
    pub classes: Vec<ClassId>,
}

/// Join handles of the three pipeline workers.
pub struct WorkerHandles {
    pub reader: std::thread::JoinHandle<()>,
    pub inference: std::thread::JoinHandle<()>,
    pub postproc: std::thread::JoinHandle<()>,
}

impl WorkerHandles {
    pub fn join_all(self) {
        for (name, handle) in [
            ("video-reader", self.reader),
            ("inference", self.inference),
            ("post-processor", self.postproc),
        ] {
            if handle.join().is_err() {
                tracing::error!("{name} worker panicked");
            }
        }
    }
}

/// Spawn the three pipeline workers as named OS threads.
#[allow(clippy::too_many_arguments)]
pub fn spawn_workers(
    shared: Arc<EngineShared>,
    backend: Arc<dyn VideoBackend>,
    runtime: Arc<dyn ModelRuntime>,
    infer_params: InferParams,
    post_params: PostParams,
    raw_q: LossyQueue<Frame>,
    result_q: LossyQueue<InferOut>,
    bus: FrameBus,
    exam: Arc<ExamManager>,
    alert_tx: tokio::sync::mpsc::UnboundedSender<AlertUpload>,
) -> std::io::Result<WorkerHandles> {
    let reader = std::thread::Builder::new().name("video-reader".into()).spawn({
        let shared = shared.clone();
        let raw_q = raw_q.clone();
        let result_q = result_q.clone();
        move || reader::run_video_reader(shared, backend, raw_q, result_q)
    })?;
    let inference = std::thread::Builder::new().name("inference".into()).spawn({
        let shared = shared.clone();
        let exam = exam.clone();
        let raw_q = raw_q.clone();
        let result_q = result_q.clone();
        move || infer::run_inference(shared, runtime, infer_params, raw_q, result_q, exam)
    })?;
    let postproc = std::thread::Builder::new()
        .name("post-processor".into())
        .spawn(move || {
            postproc::run_postproc(shared, post_params, result_q, bus, exam, alert_tx)
        })?;
    Ok(WorkerHandles {
        reader,
        inference,
        postproc,
    })
}
