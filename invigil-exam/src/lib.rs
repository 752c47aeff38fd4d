//! Exam lifecycle management.
//!
//! One [`ExamManager`] exists per node. It owns the exam record — session
//! fields, seat map, anomaly ledger and the global frame counter — behind a
//! single non-reentrant mutex, drives the engine gates through the
//! [`EngineControl`] capability, and arms the cancelable auto-stop and
//! calibration-delay timers. Callbacks fire after the lock is dropped.

pub mod ledger;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use invigil_config::ConfigError;
use invigil_types::{ClassId, SeatId, SeatMap};

use ledger::AnomalyLedger;

/// What the exam manager needs from the inference engine. Implemented by the
/// engine handle and wired in at composition time, keeping the crate
/// dependency one-directional.
pub trait EngineControl: Send + Sync {
    fn set_source(&self, uri: &str);
    fn set_video(&self, on: bool);
    fn set_inference(&self, on: bool);
    /// Raise the tracking gate; the inference stage resets its tracker on
    /// the rising edge.
    fn begin_calibration(&self);
    /// Lower the tracking gate, abandoning any calibration in progress.
    fn cancel_calibration(&self);
}

#[derive(thiserror::Error, Debug)]
pub enum ExamError {
    #[error("an exam is already running")]
    AlreadyRunning,
    #[error("no exam is currently running")]
    NotRunning,
    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Static configuration slice the manager needs.
#[derive(Debug, Clone)]
pub struct ExamConfig {
    pub track_delay: Duration,
    pub snapshot_threshold_frames: u64,
    pub snapshot_cooldown_frames: u64,
    pub snapshots_root: PathBuf,
    pub archives_root: PathBuf,
    pub classrooms_path: PathBuf,
}

/// Session summary handed to callbacks.
#[derive(Debug, Clone)]
pub struct ExamInfo {
    pub subject: String,
    pub classroom_id: i64,
    pub exam_id: Option<i64>,
    pub student_count: usize,
}

pub type ExamCallback = Box<dyn Fn(ExamInfo) + Send + Sync>;

/// Optional hooks set by the embedding process, invoked outside the exam
/// lock: after a successful start, after a stop, and after a recalibration
/// completes.
#[derive(Default)]
pub struct ExamCallbacks {
    pub on_start: Option<ExamCallback>,
    pub on_stop: Option<ExamCallback>,
    pub on_sync: Option<ExamCallback>,
}

/// Per-frame view handed to the post-processor: the frame number it was
/// assigned and an immutable snapshot of the seat map.
#[derive(Debug)]
pub struct FrameCtx {
    pub frame_no: u64,
    pub seat_map: SeatMap,
    pub snapshot_dir: PathBuf,
    pub exam_id: Option<i64>,
    pub classroom_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ExamStatus {
    pub exam_running: bool,
    pub subject: Option<String>,
    pub duration: Option<u64>,
    pub classroom_id: Option<i64>,
    pub start_time: Option<i64>,
    pub student_count: usize,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AnomalyEntry {
    pub id: SeatId,
    pub coord: String,
    pub count: u64,
}

struct ExamState {
    running: bool,
    /// Bumped on every start so stale timer tasks can tell they lost a race
    /// with stop/start.
    generation: u64,
    subject: Option<String>,
    classroom_id: Option<i64>,
    duration_secs: Option<u64>,
    started_epoch: Option<i64>,
    exam_id: Option<i64>,
    exam_key: Option<String>,
    snapshot_dir: Option<PathBuf>,
    seat_map: SeatMap,
    ledger: AnomalyLedger,
    frame_counter: u64,
    /// True while a recalibration is waiting for the tracker to finish;
    /// completing it fires `on_sync`.
    sync_armed: bool,
    auto_stop_cancel: Option<oneshot::Sender<()>>,
    calibration_cancel: Option<oneshot::Sender<()>>,
}

impl ExamState {
    fn info(&self) -> ExamInfo {
        ExamInfo {
            subject: self.subject.clone().unwrap_or_default(),
            classroom_id: self.classroom_id.unwrap_or(0),
            exam_id: self.exam_id,
            student_count: self.seat_map.len(),
        }
    }
}

pub struct ExamManager {
    engine: Arc<dyn EngineControl>,
    cfg: ExamConfig,
    state: Mutex<ExamState>,
    callbacks: Mutex<ExamCallbacks>,
}

impl ExamManager {
    pub fn new(engine: Arc<dyn EngineControl>, cfg: ExamConfig) -> Self {
        Self {
            engine,
            cfg,
            state: Mutex::new(ExamState {
                running: false,
                generation: 0,
                subject: None,
                classroom_id: None,
                duration_secs: None,
                started_epoch: None,
                exam_id: None,
                exam_key: None,
                snapshot_dir: None,
                seat_map: SeatMap::new(),
                ledger: AnomalyLedger::new(),
                frame_counter: 0,
                sync_armed: false,
                auto_stop_cancel: None,
                calibration_cancel: None,
            }),
            callbacks: Mutex::new(ExamCallbacks::default()),
        }
    }

    pub fn set_callbacks(&self, callbacks: ExamCallbacks) {
        *self.callbacks.lock() = callbacks;
    }

    /// Start an exam. `duration` is the exam length in minutes.
    ///
    /// Must be called from within a tokio runtime: the auto-stop and
    /// calibration timers are spawned as tasks.
    pub fn start_exam(
        self: &Arc<Self>,
        subject: &str,
        duration: &str,
        classroom_id: i64,
    ) -> Result<(), ExamError> {
        let minutes: u64 = duration
            .trim()
            .parse()
            .map_err(|_| ExamError::InvalidDuration(duration.to_string()))?;
        let duration_secs = minutes * 60;
        let url = invigil_config::classroom_url(&self.cfg.classrooms_path, classroom_id)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (cal_tx, cal_rx) = oneshot::channel();
        let generation;
        let info;
        {
            let mut st = self.state.lock();
            if st.running {
                return Err(ExamError::AlreadyRunning);
            }
            let epoch = chrono::Utc::now().timestamp();
            let key = format!("{}_{}_{}", subject, classroom_id, epoch);
            let dir = self.cfg.snapshots_root.join(&key);
            std::fs::create_dir_all(&dir)?;

            self.engine.set_source(&url);
            self.engine.set_inference(true);
            self.engine.set_video(true);

            st.running = true;
            st.generation += 1;
            generation = st.generation;
            st.subject = Some(subject.to_string());
            st.classroom_id = Some(classroom_id);
            st.duration_secs = Some(duration_secs);
            st.started_epoch = Some(epoch);
            st.exam_id = None;
            st.exam_key = Some(key);
            st.snapshot_dir = Some(dir);
            st.seat_map.clear();
            st.ledger.reset();
            st.frame_counter = 0;
            st.sync_armed = false;
            st.auto_stop_cancel = Some(stop_tx);
            st.calibration_cancel = Some(cal_tx);
            info = st.info();
        }

        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx => {}
                _ = tokio::time::sleep(Duration::from_secs(duration_secs)) => {
                    if mgr.generation_is(generation) {
                        info!("exam duration elapsed, auto-stopping");
                        if let Err(e) = mgr.stop_exam() {
                            warn!("auto-stop failed: {e}");
                        }
                    }
                }
            }
        });
        let mgr = Arc::clone(self);
        let delay = self.cfg.track_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = cal_rx => {}
                _ = tokio::time::sleep(delay) => {
                    if mgr.generation_is(generation) {
                        info!("starting seat calibration");
                        mgr.engine.begin_calibration();
                    }
                }
            }
        });

        info!(
            "exam started: subject={subject} classroom={classroom_id} duration={duration_secs}s"
        );
        self.fire(Hook::Start, info);
        Ok(())
    }

    pub fn stop_exam(&self) -> Result<(), ExamError> {
        let info;
        let archive;
        {
            let mut st = self.state.lock();
            if !st.running {
                return Err(ExamError::NotRunning);
            }
            self.engine.set_inference(false);
            self.engine.set_video(false);
            self.engine.cancel_calibration();
            if let Some(tx) = st.auto_stop_cancel.take() {
                let _ = tx.send(());
            }
            if let Some(tx) = st.calibration_cancel.take() {
                let _ = tx.send(());
            }
            info = st.info();
            archive = match (st.snapshot_dir.take(), st.exam_key.take()) {
                (Some(dir), Some(key)) => Some((dir, self.cfg.archives_root.join(key))),
                _ => None,
            };
            st.running = false;
            st.subject = None;
            st.classroom_id = None;
            st.duration_secs = None;
            st.started_epoch = None;
            st.exam_id = None;
            st.seat_map.clear();
            st.ledger.reset();
            st.frame_counter = 0;
            st.sync_armed = false;
        }

        if let Some((src, dst)) = archive {
            let result = std::fs::create_dir_all(&self.cfg.archives_root)
                .and_then(|()| std::fs::rename(&src, &dst));
            match result {
                Ok(()) => info!("archived snapshots to {}", dst.display()),
                Err(e) => warn!("failed to archive {}: {e}", src.display()),
            }
        }

        info!("exam stopped");
        self.fire(Hook::Stop, info);
        Ok(())
    }

    /// Throw away the current seat map and counters and run a fresh
    /// calibration window. When the new seat map is installed, `on_sync`
    /// fires.
    pub fn recalibrate(&self) -> Result<(), ExamError> {
        {
            let mut st = self.state.lock();
            if !st.running {
                return Err(ExamError::NotRunning);
            }
            if let Some(tx) = st.calibration_cancel.take() {
                let _ = tx.send(());
            }
            st.seat_map.clear();
            st.ledger.reset();
            st.frame_counter = 0;
            st.sync_armed = true;
        }
        info!("recalibration requested");
        self.engine.begin_calibration();
        Ok(())
    }

    /// Called by the inference stage when a calibration window completes.
    pub fn complete_calibration(&self, centers: SeatMap) {
        let fired;
        {
            let mut st = self.state.lock();
            if !st.running {
                return;
            }
            info!("seat map installed: {} seats", centers.len());
            st.seat_map = centers;
            fired = if st.sync_armed {
                st.sync_armed = false;
                Some(st.info())
            } else {
                None
            };
        }
        if let Some(info) = fired {
            self.fire(Hook::Sync, info);
        }
    }

    /// Assign the next frame number and snapshot the seat map. Returns
    /// `None` when no exam is running. This is the only place the frame
    /// counter is incremented.
    pub fn begin_frame(&self) -> Option<FrameCtx> {
        let mut st = self.state.lock();
        if !st.running {
            return None;
        }
        let snapshot_dir = st.snapshot_dir.clone()?;
        st.frame_counter += 1;
        Some(FrameCtx {
            frame_no: st.frame_counter,
            seat_map: st.seat_map.clone(),
            snapshot_dir,
            exam_id: st.exam_id,
            classroom_id: st.classroom_id.unwrap_or(0),
        })
    }

    /// Apply one frame's attributions: bump anomaly counters and feed
    /// snapshot candidates into the ledger. Returns the `(seat, class)`
    /// pairs whose snapshot rule fired.
    pub fn apply_observations(
        &self,
        frame_no: u64,
        counted: &[SeatId],
        candidates: &[(SeatId, ClassId)],
    ) -> Vec<(SeatId, ClassId)> {
        let mut st = self.state.lock();
        if !st.running {
            return Vec::new();
        }
        for &seat in counted {
            st.ledger.count_anomaly(seat);
        }
        let threshold = self.cfg.snapshot_threshold_frames;
        let cooldown = self.cfg.snapshot_cooldown_frames;
        candidates
            .iter()
            .filter(|(seat, class)| st.ledger.record_run(*seat, *class, frame_no, threshold, cooldown))
            .copied()
            .collect()
    }

    /// Per-seat anomaly counts for every known seat, ordered by seat id.
    pub fn anomalies(&self) -> Vec<AnomalyEntry> {
        let st = self.state.lock();
        st.seat_map
            .iter()
            .map(|(id, (x, y))| AnomalyEntry {
                id: *id,
                coord: format!("({}, {})", x, y),
                count: st.ledger.count_for(*id),
            })
            .collect()
    }

    pub fn status(&self) -> ExamStatus {
        let st = self.state.lock();
        ExamStatus {
            exam_running: st.running,
            subject: st.subject.clone(),
            duration: st.duration_secs,
            classroom_id: st.classroom_id,
            start_time: st.started_epoch,
            student_count: st.seat_map.len(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn student_count(&self) -> usize {
        self.state.lock().seat_map.len()
    }

    pub fn info(&self) -> ExamInfo {
        self.state.lock().info()
    }

    /// Record the exam id assigned by the control center.
    pub fn set_exam_id(&self, id: i64) {
        self.state.lock().exam_id = Some(id);
    }

    fn generation_is(&self, generation: u64) -> bool {
        let st = self.state.lock();
        st.running && st.generation == generation
    }

    fn fire(&self, hook: Hook, info: ExamInfo) {
        let callbacks = self.callbacks.lock();
        let cb = match hook {
            Hook::Start => &callbacks.on_start,
            Hook::Stop => &callbacks.on_stop,
            Hook::Sync => &callbacks.on_sync,
        };
        if let Some(cb) = cb {
            cb(info);
        }
    }
}

enum Hook {
    Start,
    Stop,
    Sync,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubEngine {
        video: AtomicBool,
        inference: AtomicBool,
        tracking: AtomicBool,
        source: Mutex<Option<String>>,
    }

    impl EngineControl for StubEngine {
        fn set_source(&self, uri: &str) {
            *self.source.lock() = Some(uri.to_string());
        }
        fn set_video(&self, on: bool) {
            self.video.store(on, Ordering::SeqCst);
        }
        fn set_inference(&self, on: bool) {
            self.inference.store(on, Ordering::SeqCst);
        }
        fn begin_calibration(&self) {
            self.tracking.store(true, Ordering::SeqCst);
        }
        fn cancel_calibration(&self) {
            self.tracking.store(false, Ordering::SeqCst);
        }
    }

    struct Fixture {
        engine: Arc<StubEngine>,
        mgr: Arc<ExamManager>,
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let classrooms = root.join("classrooms.json");
        std::fs::write(
            &classrooms,
            r#"{"classrooms": [{"id": 1, "url": "file://fixture.mp4"}]}"#,
        )
        .unwrap();
        let engine = Arc::new(StubEngine::default());
        let mgr = Arc::new(ExamManager::new(
            engine.clone(),
            ExamConfig {
                track_delay: Duration::from_millis(10),
                snapshot_threshold_frames: 3,
                snapshot_cooldown_frames: 10,
                snapshots_root: root.join("snapshots"),
                archives_root: root.join("archives"),
                classrooms_path: classrooms,
            },
        ));
        Fixture {
            engine,
            mgr,
            _dir: dir,
            root,
        }
    }

    #[tokio::test]
    async fn start_raises_gates_and_creates_snapshot_dir() {
        let fx = fixture();
        fx.mgr.start_exam("math", "30", 1).unwrap();
        assert!(fx.engine.video.load(Ordering::SeqCst));
        assert!(fx.engine.inference.load(Ordering::SeqCst));
        assert_eq!(
            fx.engine.source.lock().as_deref(),
            Some("file://fixture.mp4")
        );
        let snaps: Vec<_> = std::fs::read_dir(fx.root.join("snapshots"))
            .unwrap()
            .collect();
        assert_eq!(snaps.len(), 1);
        assert!(fx.mgr.is_running());
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let fx = fixture();
        fx.mgr.start_exam("math", "30", 1).unwrap();
        assert!(matches!(
            fx.mgr.start_exam("math", "30", 1),
            Err(ExamError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn stop_without_start_fails() {
        let fx = fixture();
        assert!(matches!(fx.mgr.stop_exam(), Err(ExamError::NotRunning)));
    }

    #[tokio::test]
    async fn bad_duration_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.mgr.start_exam("math", "soon", 1),
            Err(ExamError::InvalidDuration(_))
        ));
    }

    #[tokio::test]
    async fn unknown_classroom_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.mgr.start_exam("math", "30", 99),
            Err(ExamError::Config(ConfigError::UnknownClassroom(99)))
        ));
    }

    #[tokio::test]
    async fn stop_lowers_gates_and_archives() {
        let fx = fixture();
        fx.mgr.start_exam("math", "30", 1).unwrap();
        fx.mgr.stop_exam().unwrap();
        assert!(!fx.engine.video.load(Ordering::SeqCst));
        assert!(!fx.engine.inference.load(Ordering::SeqCst));
        // The snapshot directory moved under archives/.
        let snaps: Vec<_> = std::fs::read_dir(fx.root.join("snapshots"))
            .unwrap()
            .collect();
        assert!(snaps.is_empty());
        let archived: Vec<_> = std::fs::read_dir(fx.root.join("archives"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_stop_fires_after_duration() {
        let fx = fixture();
        fx.mgr.start_exam("math", "1", 1).unwrap();
        assert!(fx.mgr.is_running());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!fx.mgr.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_cancels_auto_stop_timer() {
        let fx = fixture();
        fx.mgr.start_exam("math", "1", 1).unwrap();
        fx.mgr.stop_exam().unwrap();
        // A second exam outliving the first one's would-be deadline must not
        // be stopped by the stale timer.
        fx.mgr.start_exam("physics", "120", 1).unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(fx.mgr.is_running());
        assert_eq!(fx.mgr.status().subject.as_deref(), Some("physics"));
    }

    #[tokio::test]
    async fn frame_counter_only_runs_during_exam() {
        let fx = fixture();
        assert!(fx.mgr.begin_frame().is_none());
        fx.mgr.start_exam("math", "30", 1).unwrap();
        assert_eq!(fx.mgr.begin_frame().unwrap().frame_no, 1);
        assert_eq!(fx.mgr.begin_frame().unwrap().frame_no, 2);
    }

    #[tokio::test]
    async fn attribution_counts_and_snapshot_rule() {
        let fx = fixture();
        fx.mgr.start_exam("math", "30", 1).unwrap();
        fx.mgr
            .complete_calibration(SeatMap::from([(0, (400, 300))]));
        // Threshold is 3 consecutive frames.
        assert!(fx.mgr.apply_observations(1, &[0], &[(0, 2)]).is_empty());
        assert!(fx.mgr.apply_observations(2, &[0], &[(0, 2)]).is_empty());
        assert_eq!(fx.mgr.apply_observations(3, &[0], &[(0, 2)]), vec![(0, 2)]);
        let anomalies = fx.mgr.anomalies();
        assert_eq!(
            anomalies,
            vec![AnomalyEntry {
                id: 0,
                coord: "(400, 300)".to_string(),
                count: 3
            }]
        );
    }

    #[tokio::test]
    async fn recalibrate_clears_counters_and_arms_sync() {
        let fx = fixture();
        let syncs = Arc::new(AtomicUsize::new(0));
        let syncs2 = syncs.clone();
        fx.mgr.set_callbacks(ExamCallbacks {
            on_sync: Some(Box::new(move |_info| {
                syncs2.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        fx.mgr.start_exam("math", "30", 1).unwrap();
        fx.mgr
            .complete_calibration(SeatMap::from([(0, (10, 10))]));
        assert_eq!(syncs.load(Ordering::SeqCst), 0, "plain calibration is silent");
        fx.mgr.apply_observations(1, &[0], &[]);
        assert_eq!(fx.mgr.anomalies()[0].count, 1);

        fx.mgr.recalibrate().unwrap();
        assert!(fx.engine.tracking.load(Ordering::SeqCst));
        assert!(fx.mgr.anomalies().is_empty(), "seat map cleared immediately");
        fx.mgr
            .complete_calibration(SeatMap::from([(0, (12, 12)), (1, (99, 99))]));
        assert_eq!(syncs.load(Ordering::SeqCst), 1);
        assert_eq!(fx.mgr.student_count(), 2);
        assert_eq!(fx.mgr.anomalies()[0].count, 0, "counts restart from zero");
    }

    #[tokio::test]
    async fn callbacks_fire_with_session_info() {
        let fx = fixture();
        let started = Arc::new(Mutex::new(None));
        let started2 = started.clone();
        let stopped = Arc::new(AtomicUsize::new(0));
        let stopped2 = stopped.clone();
        fx.mgr.set_callbacks(ExamCallbacks {
            on_start: Some(Box::new(move |info| {
                *started2.lock() = Some(info);
            })),
            on_stop: Some(Box::new(move |_| {
                stopped2.fetch_add(1, Ordering::SeqCst);
            })),
            on_sync: None,
        });
        fx.mgr.start_exam("math", "30", 1).unwrap();
        let info = started.lock().take().unwrap();
        assert_eq!(info.subject, "math");
        assert_eq!(info.classroom_id, 1);
        fx.mgr.set_exam_id(42);
        fx.mgr.stop_exam().unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
