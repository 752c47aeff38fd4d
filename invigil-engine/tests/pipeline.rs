//! End-to-end pipeline tests driving the three workers with a synthetic
//! video source and scripted models: one stable person sitting at (80, 60)
//! of a 160x120 feed, classified as class 0 on every frame.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{ArrayD, IxDyn};

use frame_bus::{FrameBus, WaitOutcome};
use invigil_detect::{Model, ModelError, ModelRuntime, UnavailableRuntime};
use invigil_engine::{
    spawn_workers, EngineHandle, EngineShared, InferParams, PostParams, SourceError, VideoBackend,
    VideoStream,
};
use invigil_exam::{EngineControl, ExamConfig, ExamManager};
use invigil_types::{ClassPalette, Frame};
use lossy_queue::LossyQueue;

struct SyntheticStream;

impl VideoStream for SyntheticStream {
    fn fps(&self) -> Option<f64> {
        Some(200.0)
    }
    fn read(&mut self) -> Result<Frame, SourceError> {
        Ok(Frame::black(160, 120))
    }
}

struct SyntheticBackend;

impl VideoBackend for SyntheticBackend {
    fn open(&self, uri: &str) -> Result<Box<dyn VideoStream>, SourceError> {
        if uri.starts_with("demo://") {
            Ok(Box::new(SyntheticStream))
        } else {
            Err(SourceError::Open {
                uri: uri.to_string(),
                reason: "not found".to_string(),
            })
        }
    }
}

/// Emits one anchor whose box lands at (60, 45)-(100, 75) in the original
/// 160x120 frame, i.e. centered at (80, 60), with class-0 score 0.9.
struct ScriptedDetModel;

impl Model for ScriptedDetModel {
    fn infer(&mut self, _input: &ArrayD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let mut out = ArrayD::zeros(IxDyn(&[1, 9, 1]));
        out[[0, 0, 0]] = 16.0; // cx in 32x32 detector space
        out[[0, 1, 0]] = 16.0; // cy
        out[[0, 2, 0]] = 8.0; // w
        out[[0, 3, 0]] = 8.0; // h
        out[[0, 4, 0]] = 0.9; // class 0 score
        Ok(out)
    }
}

/// Always classifies every row as class 0.
struct ScriptedClsModel;

impl Model for ScriptedClsModel {
    fn infer(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let batch = input.shape()[0];
        let mut out = ArrayD::zeros(IxDyn(&[batch, 5]));
        for r in 0..batch {
            out[[r, 0]] = 1.0;
        }
        Ok(out)
    }
}

struct ScriptedRuntime;

impl ModelRuntime for ScriptedRuntime {
    fn load(&self, path: &Path, _device_id: i32) -> Result<Box<dyn Model>, ModelError> {
        if path.ends_with("det.onnx") {
            Ok(Box::new(ScriptedDetModel))
        } else {
            Ok(Box::new(ScriptedClsModel))
        }
    }
}

struct Rig {
    shared: Arc<EngineShared>,
    exam: Arc<ExamManager>,
    bus: FrameBus,
    alert_rx: tokio::sync::mpsc::UnboundedReceiver<invigil_types::AlertUpload>,
    handles: invigil_engine::WorkerHandles,
    root: PathBuf,
    _dir: tempfile::TempDir,
}

fn build_rig(runtime: Arc<dyn ModelRuntime>) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    std::fs::write(
        root.join("classrooms.json"),
        r#"{"classrooms": [{"id": 1, "url": "demo://cam"}]}"#,
    )
    .unwrap();

    let shared = EngineShared::new();
    let exam = Arc::new(ExamManager::new(
        Arc::new(EngineHandle::new(shared.clone())),
        ExamConfig {
            track_delay: Duration::from_millis(50),
            snapshot_threshold_frames: 3,
            snapshot_cooldown_frames: 5,
            snapshots_root: root.join("snapshots"),
            archives_root: root.join("archives"),
            classrooms_path: root.join("classrooms.json"),
        },
    ));

    let infer_params = InferParams {
        det_model_path: PathBuf::from("models/det.onnx"),
        cls_model_path: PathBuf::from("models/cls.onnx"),
        device_id: 0,
        det_size: (32, 32),
        cls_size: (16, 16),
        cls_batch: 4,
        conf_thres: 0.25,
        iou_thres: 0.45,
        track_max_frames: 3,
    };
    let post_params = PostParams {
        palette: ClassPalette {
            names: vec![
                "head_abnormal".into(),
                "limb_abnormal".into(),
                "sleeping".into(),
                "standing".into(),
                "normal".into(),
            ],
            colors: vec![[0, 0, 255]; 5],
        },
        anomaly_classes: [0].into_iter().collect(),
        snapshot_classes: [0].into_iter().collect(),
        match_threshold: 50.0,
        fps_window: 10,
        jpeg_quality: 75,
        jpeg_width: 0,
    };

    let raw_q = LossyQueue::bounded(4);
    let result_q = LossyQueue::bounded(4);
    let bus = FrameBus::new();
    let (alert_tx, alert_rx) = tokio::sync::mpsc::unbounded_channel();

    let handles = spawn_workers(
        shared.clone(),
        Arc::new(SyntheticBackend),
        runtime,
        infer_params,
        post_params,
        raw_q,
        result_q,
        bus.clone(),
        exam.clone(),
        alert_tx,
    )
    .unwrap();

    Rig {
        shared,
        exam,
        bus,
        alert_rx,
        handles,
        root,
        _dir: dir,
    }
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

async fn shut_down(rig: Rig) {
    rig.shared.gates.set_exit();
    rig.shared.gates.set_video(false);
    rig.shared.gates.set_inference(false);
    rig.bus.close();
    let joined = tokio::task::spawn_blocking(move || rig.handles.join_all());
    tokio::time::timeout(Duration::from_secs(5), joined)
        .await
        .expect("workers failed to stop in time")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_exam_with_one_seat() {
    let rig = build_rig(Arc::new(ScriptedRuntime));
    rig.exam.start_exam("math", "30", 1).unwrap();

    // Calibration: 50ms delay, then a 3-frame window.
    assert!(
        wait_until(Duration::from_secs(10), || rig.exam.student_count() == 1).await,
        "seat map never calibrated"
    );
    let anomalies = rig.exam.anomalies();
    assert_eq!(anomalies[0].id, 0);
    assert_eq!(anomalies[0].coord, "(80, 60)");

    // The same (seat, class) fires continuously: counts pass the snapshot
    // threshold and at least one evidence file lands on disk.
    assert!(
        wait_until(Duration::from_secs(10), || {
            rig.exam.anomalies().first().map(|a| a.count).unwrap_or(0) >= 3
        })
        .await,
        "anomaly counter never reached the threshold"
    );

    let snap_root = rig.root.join("snapshots");
    assert!(
        wait_until(Duration::from_secs(10), || {
            snapshot_files(&snap_root).iter().any(|name| {
                name.starts_with("snapshot_seat0_x80_y60_cls0_") && name.ends_with(".jpg")
            })
        })
        .await,
        "no snapshot file was written"
    );

    // The alert upload for the snapshot is queued.
    let mut rig = rig;
    let alert = tokio::time::timeout(Duration::from_secs(5), rig.alert_rx.recv())
        .await
        .expect("no alert queued")
        .expect("alert channel closed");
    assert_eq!(alert.room_id, 1);
    assert_eq!(alert.seat_id, 0);
    assert_eq!(alert.class_id, 0);
    assert_eq!((alert.x, alert.y), (80, 60));
    assert!(!alert.jpeg.is_empty());

    // Engine status reflects a busy pipeline and the stream delivers frames.
    assert!(rig.shared.status.is_inferring());
    assert!(rig.shared.status.last_error().is_none());
    let mut tap = rig.bus.subscribe();
    match tap.wait_newer(0, Duration::from_secs(5)).await {
        WaitOutcome::Frame { bytes, frame_id } => {
            assert!(frame_id > 0);
            assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        }
        other => panic!("expected a frame, got {:?}", other),
    }

    // Stop: snapshots are archived, gates drop, state resets.
    rig.exam.stop_exam().unwrap();
    assert!(!rig.exam.is_running());
    let archived: Vec<_> = std::fs::read_dir(rig.root.join("archives"))
        .unwrap()
        .collect();
    assert_eq!(archived.len(), 1);
    assert!(
        wait_until(Duration::from_secs(5), || !rig.shared.status.is_inferring()).await,
        "inference stage never released its models"
    );

    shut_down(rig).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recalibrate_resets_counts_and_reinstalls_seat_map() {
    let rig = build_rig(Arc::new(ScriptedRuntime));
    rig.exam.start_exam("math", "30", 1).unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            rig.exam.anomalies().first().map(|a| a.count).unwrap_or(0) >= 2
        })
        .await
    );

    rig.exam.recalibrate().unwrap();
    assert!(rig.exam.anomalies().is_empty());
    assert!(
        wait_until(Duration::from_secs(10), || rig.exam.student_count() == 1).await,
        "recalibration never completed"
    );

    shut_down(rig).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_source_surfaces_error_and_lowers_gate() {
    let rig = build_rig(Arc::new(ScriptedRuntime));
    let handle = EngineHandle::new(rig.shared.clone());
    handle.set_source("rtsp://nowhere/stream");
    rig.shared.gates.set_video(true);

    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.shared.status.last_error().is_some() && !rig.shared.gates.video_on()
        })
        .await,
        "open failure did not surface"
    );

    // A corrected source brings the reader back and clears the error.
    handle.set_source("demo://cam");
    rig.shared.gates.set_video(true);
    assert!(
        wait_until(Duration::from_secs(5), || rig
            .shared
            .status
            .last_error()
            .is_none())
        .await
    );

    shut_down(rig).await;
}

/// Opens once, then every read fails and every reopen is refused, driving
/// the reader through its full reconnect dance.
struct DyingBackend {
    opens: std::sync::atomic::AtomicUsize,
}

struct DeadStream;

impl VideoStream for DeadStream {
    fn fps(&self) -> Option<f64> {
        Some(200.0)
    }
    fn read(&mut self) -> Result<Frame, SourceError> {
        Err(SourceError::Read("connection reset".to_string()))
    }
}

impl VideoBackend for DyingBackend {
    fn open(&self, uri: &str) -> Result<Box<dyn VideoStream>, SourceError> {
        if self.opens.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
            Ok(Box::new(DeadStream))
        } else {
            Err(SourceError::Open {
                uri: uri.to_string(),
                reason: "gone".to_string(),
            })
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_exhaustion_lowers_gate_and_sets_error() {
    let dir = tempfile::tempdir().unwrap();
    let shared = EngineShared::new();
    let raw_q: LossyQueue<Frame> = LossyQueue::bounded(4);
    let result_q = LossyQueue::bounded(4);
    let exam = Arc::new(ExamManager::new(
        Arc::new(EngineHandle::new(shared.clone())),
        ExamConfig {
            track_delay: Duration::from_millis(50),
            snapshot_threshold_frames: 3,
            snapshot_cooldown_frames: 5,
            snapshots_root: dir.path().join("snapshots"),
            archives_root: dir.path().join("archives"),
            classrooms_path: dir.path().join("classrooms.json"),
        },
    ));
    let bus = FrameBus::new();
    let (alert_tx, _alert_rx) = tokio::sync::mpsc::unbounded_channel();
    let handles = spawn_workers(
        shared.clone(),
        Arc::new(DyingBackend {
            opens: std::sync::atomic::AtomicUsize::new(0),
        }),
        Arc::new(ScriptedRuntime),
        InferParams {
            det_model_path: PathBuf::from("models/det.onnx"),
            cls_model_path: PathBuf::from("models/cls.onnx"),
            device_id: 0,
            det_size: (32, 32),
            cls_size: (16, 16),
            cls_batch: 4,
            conf_thres: 0.25,
            iou_thres: 0.45,
            track_max_frames: 3,
        },
        PostParams {
            palette: ClassPalette {
                names: vec!["normal".into()],
                colors: vec![[0, 255, 0]],
            },
            anomaly_classes: [0].into_iter().collect(),
            snapshot_classes: [0].into_iter().collect(),
            match_threshold: 50.0,
            fps_window: 10,
            jpeg_quality: 75,
            jpeg_width: 0,
        },
        raw_q.clone(),
        result_q.clone(),
        bus.clone(),
        exam,
        alert_tx,
    )
    .unwrap();

    shared.status.set_source("demo://cam");
    shared.gates.set_video(true);

    // 10 consecutive read failures, then 3 reopen attempts at 1s spacing,
    // all refused: the reader must park itself in Idle with the error set.
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if !shared.gates.video_on() && shared.status.last_error().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!shared.gates.video_on(), "reader never lowered the gate");
    assert!(
        shared.status.last_error().is_some(),
        "reconnect exhaustion left no error"
    );

    shared.gates.set_exit();
    bus.close();
    let joined = tokio::task::spawn_blocking(move || handles.join_all());
    tokio::time::timeout(Duration::from_secs(5), joined)
        .await
        .expect("workers failed to stop in time")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn model_load_failure_clears_inference_gate() {
    let rig = build_rig(Arc::new(UnavailableRuntime));
    rig.shared.status.set_source("demo://cam");
    rig.shared.gates.set_video(true);
    rig.shared.gates.set_inference(true);

    assert!(
        wait_until(Duration::from_secs(5), || {
            !rig.shared.gates.inference_on() && rig.shared.status.last_error().is_some()
        })
        .await,
        "load failure did not lower the gate"
    );
    assert!(!rig.shared.status.is_inferring());

    shut_down(rig).await;
}

fn snapshot_files(root: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(dirs) = std::fs::read_dir(root) else {
        return names;
    };
    for exam_dir in dirs.flatten() {
        if let Ok(files) = std::fs::read_dir(exam_dir.path()) {
            for f in files.flatten() {
                names.push(f.file_name().to_string_lossy().to_string());
            }
        }
    }
    names
}
