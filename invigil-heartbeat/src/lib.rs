//! Control-center reporting: the periodic heartbeat, synchronous task sync,
//! and the alert uploader that ships evidence snapshots.
//!
//! Every outbound request carries the shared node token in `X-Node-Token`.
//! Transport failures are logged and swallowed; the next tick retries. An
//! exam is never aborted because reporting is unavailable.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use invigil_engine::EngineShared;
use invigil_exam::ExamManager;
use invigil_types::{AlertUpload, ClassId};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);
const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("control center returned HTTP {0}")]
    Status(u16),
}

type Result<T> = std::result::Result<T, TransportError>;

/// Alert type names by class id, as the control-center API expects them.
pub fn alert_type_for_class(class: ClassId) -> &'static str {
    match class {
        0 => "head_abnormal",
        1 => "limb_abnormal",
        2 => "sleeping",
        3 => "standing",
        4 => "normal",
        _ => "unknown",
    }
}

#[derive(Debug, Serialize)]
pub struct HeartbeatPayload {
    pub status: &'static str,
    pub details: serde_json::Value,
}

/// HTTP client for the control-center node API.
pub struct ControlCenterClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl ControlCenterClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http: reqwest::Client::builder().build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn heartbeat(&self, payload: &HeartbeatPayload) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(self.url("/node-api/v1/heartbeat"))
            .header("X-Node-Token", &self.token)
            .timeout(HEARTBEAT_TIMEOUT)
            .json(payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    /// Synchronize an exam lifecycle action with the control center and
    /// return the parsed response.
    pub async fn sync_task(&self, payload: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(self.url("/node-api/v1/tasks/sync"))
            .header("X-Node-Token", &self.token)
            .timeout(SYNC_TIMEOUT)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    /// Upload one evidence snapshot as a multipart form.
    pub async fn upload_alert(&self, alert: AlertUpload) -> Result<()> {
        let image = reqwest::multipart::Part::bytes(alert.jpeg.to_vec())
            .file_name(format!(
                "snapshot_seat{}_x{}_y{}.jpg",
                alert.seat_id, alert.x, alert.y
            ))
            .mime_str("image/jpeg")?;
        let form = reqwest::multipart::Form::new()
            .text("room_id", alert.room_id.to_string())
            .text(
                "exam_id",
                alert.exam_id.map(|id| id.to_string()).unwrap_or_default(),
            )
            .text("type", alert_type_for_class(alert.class_id))
            .text("seat_number", alert.seat_id.to_string())
            .text("x", alert.x.to_string())
            .text("y", alert.y.to_string())
            .part("image", image);
        let response = self
            .http
            .post(self.url("/node-api/v1/alerts"))
            .header("X-Node-Token", &self.token)
            .timeout(ALERT_TIMEOUT)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Derive the node status the way the control center understands it.
pub fn derive_status(last_error: Option<&str>, is_inferring: bool) -> &'static str {
    if last_error.is_some() {
        "error"
    } else if is_inferring {
        "busy"
    } else {
        "idle"
    }
}

/// Build one heartbeat payload from the current engine and exam state.
pub fn build_payload(shared: &EngineShared, exam: &ExamManager) -> HeartbeatPayload {
    let last_error = shared.status.last_error();
    let status = derive_status(last_error.as_deref(), shared.status.is_inferring());
    let mut details = serde_json::json!({
        "fps": (shared.status.fps() * 100.0).round() / 100.0,
        "video_running": shared.gates.video_on(),
        "inferring": shared.gates.inference_on(),
        "current_video": shared.status.source(),
        "last_error": last_error,
    });
    let exam_status = exam.status();
    if exam_status.exam_running {
        details["exam_running"] = serde_json::json!(true);
        details["subject"] = serde_json::json!(exam_status.subject);
        details["classroom_id"] = serde_json::json!(exam_status.classroom_id);
        details["student_count"] = serde_json::json!(exam_status.student_count);
    }
    HeartbeatPayload { status, details }
}

/// Periodic heartbeat loop. Runs until `quit` fires.
pub async fn run_heartbeat(
    client: Arc<ControlCenterClient>,
    shared: Arc<EngineShared>,
    exam: Arc<ExamManager>,
    interval_secs: u64,
    mut quit: tokio::sync::oneshot::Receiver<()>,
) {
    info!("heartbeat started (every {interval_secs}s)");
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = &mut quit => break,
            _ = ticker.tick() => {
                let payload = build_payload(&shared, &exam);
                match client.heartbeat(&payload).await {
                    Ok(body) => {
                        if body.get("success").and_then(|v| v.as_bool()) != Some(true) {
                            warn!("heartbeat reported success=false: {body}");
                        } else {
                            debug!("heartbeat ok: status={}", payload.status);
                        }
                    }
                    Err(e) => warn!("heartbeat failed: {e}"),
                }
            }
        }
    }
    info!("heartbeat stopped");
}

/// Drain the alert channel, uploading each snapshot. Ends when all senders
/// are gone.
pub async fn run_alert_uploader(
    client: Arc<ControlCenterClient>,
    mut alerts: tokio::sync::mpsc::UnboundedReceiver<AlertUpload>,
) {
    while let Some(alert) = alerts.recv().await {
        let seat = alert.seat_id;
        match client.upload_alert(alert).await {
            Ok(()) => debug!("alert uploaded for seat {seat}"),
            Err(e) => warn!("alert upload failed: {e}"),
        }
    }
    debug!("alert uploader finished");
}
