//! Composition root and HTTP surface.
//!
//! Builds the shared records, wires the exam manager to the engine handle
//! and the control-center client, spawns the pipeline workers and background
//! tasks, and serves the node API plus the live MJPEG stream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{error, info, warn};

use frame_bus::{FrameBus, WaitOutcome};
use invigil_config::{ConfigError, NodeConfig};
use invigil_detect::ModelRuntime;
use invigil_engine::{
    spawn_workers, EngineHandle, EngineShared, InferParams, PostParams, VideoBackend,
};
use invigil_exam::{EngineControl, ExamCallbacks, ExamConfig, ExamError, ExamManager};
use invigil_heartbeat::{run_alert_uploader, run_heartbeat, ControlCenterClient};
use invigil_relay::{RelayConfig, RtmpRelay};
use lossy_queue::LossyQueue;

/// Grace period between lowering the gates and tearing down the model
/// runtime; the inference thread must have released its handles by then.
const MODEL_RELEASE_GRACE: Duration = Duration::from_millis(800);

#[derive(Clone)]
struct AppState {
    shared: Arc<EngineShared>,
    engine: Arc<EngineHandle>,
    exam: Arc<ExamManager>,
    bus: FrameBus,
    relay: Arc<RtmpRelay>,
    classrooms_path: PathBuf,
}

pub(crate) async fn run(cfg: NodeConfig, listen: SocketAddr) -> anyhow::Result<()> {
    let shared = EngineShared::new();
    let engine = Arc::new(EngineHandle::new(shared.clone()));
    let classrooms_path = PathBuf::from(invigil_config::CLASSROOMS_PATH);

    let exam = Arc::new(ExamManager::new(
        engine.clone(),
        ExamConfig {
            track_delay: Duration::from_secs(cfg.track_delay_seconds),
            snapshot_threshold_frames: cfg.snapshot_threshold_frames,
            snapshot_cooldown_frames: cfg.snapshot_cooldown_frames,
            snapshots_root: PathBuf::from("snapshots"),
            archives_root: PathBuf::from("archives"),
            classrooms_path: classrooms_path.clone(),
        },
    ));

    let client = Arc::new(ControlCenterClient::new(
        &cfg.control_center_url,
        &cfg.node_token,
    )?);
    wire_exam_callbacks(&exam, &client);

    let raw_q = LossyQueue::bounded(cfg.queue_size);
    let result_q = LossyQueue::bounded(cfg.queue_size);
    let bus = FrameBus::new();
    let (alert_tx, alert_rx) = tokio::sync::mpsc::unbounded_channel();

    let backend: Arc<dyn VideoBackend> = Arc::new(crate::backends::ImageDirBackend);
    #[cfg(feature = "onnx")]
    let model_runtime: Arc<dyn ModelRuntime> = Arc::new(crate::ort_runtime::OrtRuntime);
    #[cfg(not(feature = "onnx"))]
    let model_runtime: Arc<dyn ModelRuntime> = Arc::new(invigil_detect::UnavailableRuntime);

    let workers = spawn_workers(
        shared.clone(),
        backend,
        model_runtime,
        InferParams::from_config(&cfg),
        PostParams::from_config(&cfg),
        raw_q.clone(),
        result_q.clone(),
        bus.clone(),
        exam.clone(),
        alert_tx,
    )?;

    let (hb_quit_tx, hb_quit_rx) = tokio::sync::oneshot::channel();
    let hb_task = tokio::spawn(run_heartbeat(
        client.clone(),
        shared.clone(),
        exam.clone(),
        cfg.heartbeat_interval,
        hb_quit_rx,
    ));
    let uploader_task = tokio::spawn(run_alert_uploader(client.clone(), alert_rx));

    let relay = Arc::new(RtmpRelay::new(
        RelayConfig {
            rtmp_url: cfg.rtmp_url.clone(),
            fps: cfg.rtmp_fps,
            bitrate: cfg.rtmp_bitrate.clone(),
        },
        bus.clone(),
        tokio::runtime::Handle::current(),
    ));

    let state = AppState {
        shared: shared.clone(),
        engine,
        exam: exam.clone(),
        bus: bus.clone(),
        relay: relay.clone(),
        classrooms_path,
    };
    let router = build_router(state, &cfg.frontend_path);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("invigil node listening at http://{listen}/");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("HTTP server error: {e}");
        }
    });

    // Ctrl-C can fire more than once; only the first message matters.
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(5);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })?;

    let _ = shutdown_rx.recv().await;
    info!("shutting down");

    if exam.is_running() {
        if let Err(e) = exam.stop_exam() {
            warn!("stopping exam during shutdown failed: {e}");
        }
    }
    if relay.is_running() {
        relay.stop();
    }
    shared.gates.set_video(false);
    shared.gates.set_inference(false);
    shared.gates.set_exit();
    raw_q.close();
    result_q.close();
    bus.close();
    let _ = hb_quit_tx.send(());

    // Let the inference thread drop its model handles before any external
    // runtime teardown; skipping this risks a crash in native code.
    tokio::time::sleep(MODEL_RELEASE_GRACE).await;
    tokio::task::spawn_blocking(move || workers.join_all()).await?;
    let _ = tokio::time::timeout(Duration::from_secs(2), hb_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), uploader_task).await;
    server.abort();

    info!("node stopped");
    Ok(())
}

/// Connect the exam lifecycle callbacks to the control-center task API.
/// `start` returns the exam id the node reports in alerts and later syncs.
fn wire_exam_callbacks(exam: &Arc<ExamManager>, client: &Arc<ControlCenterClient>) {
    let on_start = {
        let client = client.clone();
        let exam = Arc::downgrade(exam);
        Box::new(move |info: invigil_exam::ExamInfo| {
            let client = client.clone();
            let exam = exam.clone();
            tokio::spawn(async move {
                let payload = json!({
                    "action": "start",
                    "subject": info.subject,
                    "classroom_id": info.classroom_id,
                });
                match client.sync_task(payload).await {
                    Ok(body) => {
                        if let Some(id) = body.get("exam_id").and_then(Value::as_i64) {
                            info!("control center assigned exam id {id}");
                            if let Some(exam) = exam.upgrade() {
                                exam.set_exam_id(id);
                            }
                        }
                    }
                    Err(e) => warn!("task sync (start) failed: {e}"),
                }
            });
        })
    };
    let on_stop = {
        let client = client.clone();
        Box::new(move |info: invigil_exam::ExamInfo| {
            let client = client.clone();
            tokio::spawn(async move {
                let payload = json!({"action": "stop", "exam_id": info.exam_id});
                if let Err(e) = client.sync_task(payload).await {
                    warn!("task sync (stop) failed: {e}");
                }
            });
        })
    };
    let on_sync = {
        let client = client.clone();
        Box::new(move |info: invigil_exam::ExamInfo| {
            let client = client.clone();
            tokio::spawn(async move {
                let payload = json!({
                    "action": "sync",
                    "exam_id": info.exam_id,
                    "examinee_count": info.student_count,
                });
                if let Err(e) = client.sync_task(payload).await {
                    warn!("task sync (sync) failed: {e}");
                }
            });
        })
    };
    exam.set_callbacks(ExamCallbacks {
        on_start: Some(on_start),
        on_stop: Some(on_stop),
        on_sync: Some(on_sync),
    });
}

fn build_router(state: AppState, frontend_path: &std::path::Path) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/cmd/set_video/{*path}", get(set_video_handler))
        .route("/cmd/{action}", get(cmd_handler))
        .route("/exam/start", post(exam_start_handler))
        .route("/exam/stop", get(exam_stop_handler))
        .route("/exam/status", get(exam_status_handler))
        .route("/exam/recalibrate", get(exam_recalibrate_handler))
        .route("/exam/anomalies", get(exam_anomalies_handler))
        .route("/classrooms", get(classrooms_get).post(classrooms_post))
        .route("/stream", get(stream_handler))
        .route("/relay/{action}", get(relay_handler))
        .route_service("/", ServeFile::new(frontend_path.join("index.html")))
        .nest_service("/static", ServeDir::new(frontend_path.join("static")))
        .with_state(state)
}

type ApiResponse = (StatusCode, Json<Value>);

fn ok_json(value: Value) -> ApiResponse {
    (StatusCode::OK, Json(value))
}

fn fail(status: StatusCode, message: impl std::fmt::Display) -> ApiResponse {
    (
        status,
        Json(json!({"success": false, "error": message.to_string()})),
    )
}

fn exam_error_response(e: ExamError) -> ApiResponse {
    let status = match &e {
        ExamError::AlreadyRunning | ExamError::NotRunning | ExamError::InvalidDuration(_) => {
            StatusCode::BAD_REQUEST
        }
        ExamError::Config(ConfigError::UnknownClassroom(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, e)
}

async fn status_handler(State(app): State<AppState>) -> ApiResponse {
    ok_json(json!({
        "success": true,
        "data": {
            "inferring": app.shared.gates.inference_on(),
            "video_running": app.shared.gates.video_on(),
            "is_inferring": app.shared.status.is_inferring(),
            "fps": (app.shared.status.fps() * 100.0).round() / 100.0,
        }
    }))
}

async fn cmd_handler(State(app): State<AppState>, Path(action): Path<String>) -> ApiResponse {
    let gates = &app.shared.gates;
    match action.as_str() {
        "start_inference" => gates.set_inference(true),
        "stop_inference" | "stop" => {
            gates.set_video(false);
            gates.set_inference(false);
        }
        "start_video" | "start" => {
            gates.set_inference(true);
            gates.set_video(true);
        }
        "stop_video" => gates.set_video(false),
        _ => return fail(StatusCode::BAD_REQUEST, "Invalid action"),
    }
    ok_json(json!({"success": true, "action": action}))
}

async fn set_video_handler(State(app): State<AppState>, Path(path): Path<String>) -> ApiResponse {
    app.engine.set_source(&path);
    ok_json(json!({"success": true, "video_path": path}))
}

#[derive(Debug, Deserialize)]
struct ExamStartRequest {
    subject: Option<String>,
    /// Minutes; clients send either a string or a number.
    duration: Option<Value>,
    classroom_id: Option<i64>,
}

async fn exam_start_handler(
    State(app): State<AppState>,
    Json(req): Json<ExamStartRequest>,
) -> ApiResponse {
    let duration = match &req.duration {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let (Some(subject), Some(duration), Some(classroom_id)) =
        (req.subject, duration, req.classroom_id)
    else {
        return fail(
            StatusCode::BAD_REQUEST,
            "Missing required fields: subject, duration, classroom_id",
        );
    };
    match app.exam.start_exam(&subject, &duration, classroom_id) {
        Ok(()) => ok_json(json!({"success": true})),
        Err(e) => exam_error_response(e),
    }
}

async fn exam_stop_handler(State(app): State<AppState>) -> ApiResponse {
    match app.exam.stop_exam() {
        Ok(()) => ok_json(json!({"success": true})),
        Err(e) => exam_error_response(e),
    }
}

async fn exam_status_handler(State(app): State<AppState>) -> ApiResponse {
    match serde_json::to_value(app.exam.status()) {
        Ok(Value::Object(mut map)) => {
            map.insert("success".to_string(), Value::Bool(true));
            ok_json(Value::Object(map))
        }
        _ => fail(StatusCode::INTERNAL_SERVER_ERROR, "status serialization"),
    }
}

async fn exam_recalibrate_handler(State(app): State<AppState>) -> ApiResponse {
    match app.exam.recalibrate() {
        Ok(()) => ok_json(json!({"success": true})),
        Err(e) => exam_error_response(e),
    }
}

async fn exam_anomalies_handler(State(app): State<AppState>) -> ApiResponse {
    ok_json(json!({"success": true, "anomalies": app.exam.anomalies()}))
}

async fn classrooms_get(State(app): State<AppState>) -> ApiResponse {
    match invigil_config::load_classrooms(&app.classrooms_path) {
        Ok(c) => ok_json(json!({"success": true, "classrooms": c.classrooms})),
        Err(ConfigError::Io { source }) if source.kind() == std::io::ErrorKind::NotFound => {
            fail(StatusCode::NOT_FOUND, "classrooms.json not found")
        }
        Err(e @ ConfigError::Json { .. }) => fail(StatusCode::BAD_REQUEST, e),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn classrooms_post(State(app): State<AppState>, Json(value): Json<Value>) -> ApiResponse {
    match invigil_config::store_classrooms(&app.classrooms_path, &value) {
        Ok(()) => ok_json(json!({"success": true})),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn relay_handler(State(app): State<AppState>, Path(action): Path<String>) -> ApiResponse {
    match action.as_str() {
        "start" => match app.relay.start() {
            Ok(status) => ok_json(json!({"success": true, "relay": status})),
            Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e),
        },
        "stop" => ok_json(json!({"success": true, "relay": app.relay.stop()})),
        _ => fail(StatusCode::BAD_REQUEST, "Invalid action"),
    }
}

/// Frame one JPEG as a `multipart/x-mixed-replace` part.
fn jpeg_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Live MJPEG stream. Each client follows the frame bus at its own pace and
/// never receives the same frame twice.
async fn stream_handler(State(app): State<AppState>) -> impl IntoResponse {
    let tap = app.bus.subscribe();
    let parts = futures::stream::unfold((tap, 0u64), |(mut tap, last_sent)| async move {
        loop {
            match tap.wait_newer(last_sent, Duration::from_millis(200)).await {
                WaitOutcome::Frame { bytes, frame_id } => {
                    let part = jpeg_part(&bytes);
                    return Some((Ok::<_, std::convert::Infallible>(part), (tap, frame_id)));
                }
                WaitOutcome::TimedOut => continue,
                WaitOutcome::Shutdown => return None,
            }
        }
    });
    (
        [
            (
                header::CONTENT_TYPE,
                "multipart/x-mixed-replace; boundary=frame",
            ),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(parts),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_part_framing() {
        let part = jpeg_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let expected: &[u8] =
            b"\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n";
        assert_eq!(part.as_ref(), expected);
    }

    #[test]
    fn exam_errors_map_to_http_statuses() {
        let (s, _) = exam_error_response(ExamError::AlreadyRunning);
        assert_eq!(s, StatusCode::BAD_REQUEST);
        let (s, _) = exam_error_response(ExamError::InvalidDuration("x".into()));
        assert_eq!(s, StatusCode::BAD_REQUEST);
        let (s, _) =
            exam_error_response(ExamError::Config(ConfigError::UnknownClassroom(3)));
        assert_eq!(s, StatusCode::NOT_FOUND);
    }
}
