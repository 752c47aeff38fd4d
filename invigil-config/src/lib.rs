//! Node configuration: JSON config file with per-key environment overrides,
//! plus the classrooms registry.
//!
//! Every key of the config file can be overridden by an environment variable
//! whose name is the key uppercased with dots replaced by underscores; the
//! environment wins. `.env` files are honored via `dotenv` at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use invigil_types::{ClassId, ClassPalette};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("config file is not a JSON object")]
    NotAnObject,
    #[error("classroom with id {0} not found")]
    UnknownClassroom(i64),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Default location of the classrooms registry, relative to the working
/// directory.
pub const CLASSROOMS_PATH: &str = "classrooms.json";

fn default_queue_size() -> usize {
    8
}
fn default_device_id() -> i32 {
    0
}
fn default_det_model_path() -> PathBuf {
    PathBuf::from("models/det.onnx")
}
fn default_cls_model_path() -> PathBuf {
    PathBuf::from("models/cls.onnx")
}
fn default_det_size() -> [usize; 2] {
    [640, 640]
}
fn default_cls_size() -> [usize; 2] {
    [224, 224]
}
fn default_cls_batch() -> usize {
    8
}
fn default_conf_thres() -> f32 {
    0.25
}
fn default_iou_thres() -> f32 {
    0.45
}
fn default_fps_window_size() -> usize {
    30
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_class_names() -> Vec<String> {
    ["head_abnormal", "limb_abnormal", "sleeping", "standing", "normal"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_class_colors() -> Vec<[u8; 3]> {
    vec![
        [0, 0, 255],
        [0, 165, 255],
        [255, 0, 0],
        [0, 255, 255],
        [0, 255, 0],
    ]
}
fn default_anomaly_classes() -> Vec<ClassId> {
    vec![0, 1, 2, 3]
}
fn default_match_threshold() -> f64 {
    50.0
}
fn default_snapshot_threshold_frames() -> u64 {
    12
}
fn default_snapshot_cooldown_frames() -> u64 {
    720
}
fn default_track_max_frames() -> u32 {
    60
}
fn default_track_delay_seconds() -> u64 {
    10
}
fn default_control_center_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_node_token() -> String {
    "default-node-token".to_string()
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_frontend_path() -> PathBuf {
    PathBuf::from("frontend")
}
fn default_rtmp_url() -> String {
    "rtmp://localhost:1935/live/stream".to_string()
}
fn default_rtmp_fps() -> u32 {
    15
}
fn default_rtmp_bitrate() -> String {
    "500k".to_string()
}

/// The node configuration. Field names mirror the keys of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Capacity of both bounded pipeline queues.
    #[serde(rename = "QUEUE_SIZE")]
    pub queue_size: usize,
    /// Device for model load, forwarded to the model runtime.
    #[serde(rename = "DEVICE_ID")]
    pub device_id: i32,
    #[serde(rename = "DET_MODEL_PATH")]
    pub det_model_path: PathBuf,
    #[serde(rename = "CLS_MODEL_PATH")]
    pub cls_model_path: PathBuf,
    /// Detection model input size `[w, h]`.
    #[serde(rename = "DET_SIZE")]
    pub det_size: [usize; 2],
    /// Classification model input size `[w, h]`.
    #[serde(rename = "CLS_SIZE")]
    pub cls_size: [usize; 2],
    #[serde(rename = "CLS_BATCH")]
    pub cls_batch: usize,
    #[serde(rename = "CONF_THRES")]
    pub conf_thres: f32,
    #[serde(rename = "IOU_THRES")]
    pub iou_thres: f32,
    #[serde(rename = "FPS_WINDOW_SIZE")]
    pub fps_window_size: usize,
    #[serde(rename = "JPEG_QUALITY")]
    pub jpeg_quality: u8,
    /// Output stream width; 0 disables resizing.
    #[serde(rename = "JPEG_WIDTH")]
    pub jpeg_width: u32,
    pub class_names: Vec<String>,
    /// One `[b, g, r]` triple per class.
    pub class_colors: Vec<[u8; 3]>,
    pub anomaly_classes: Vec<ClassId>,
    pub snapshot_classes: Vec<ClassId>,
    /// Maximum pixel distance between a detection center and a seat center
    /// for the detection to be attributed to that seat.
    pub anomaly_match_threshold: f64,
    pub snapshot_threshold_frames: u64,
    pub snapshot_cooldown_frames: u64,
    #[serde(rename = "TRACK_MAX_FRAMES")]
    pub track_max_frames: u32,
    #[serde(rename = "TRACK_DELAY_SECONDS")]
    pub track_delay_seconds: u64,
    #[serde(rename = "CONTROL_CENTER_URL")]
    pub control_center_url: String,
    #[serde(rename = "NODE_TOKEN")]
    pub node_token: String,
    /// Heartbeat period in seconds.
    #[serde(rename = "HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: u64,
    #[serde(rename = "FRONTEND_PATH")]
    pub frontend_path: PathBuf,
    #[serde(rename = "RTMP_URL")]
    pub rtmp_url: String,
    #[serde(rename = "RTMP_FPS")]
    pub rtmp_fps: u32,
    #[serde(rename = "RTMP_BITRATE")]
    pub rtmp_bitrate: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            device_id: default_device_id(),
            det_model_path: default_det_model_path(),
            cls_model_path: default_cls_model_path(),
            det_size: default_det_size(),
            cls_size: default_cls_size(),
            cls_batch: default_cls_batch(),
            conf_thres: default_conf_thres(),
            iou_thres: default_iou_thres(),
            fps_window_size: default_fps_window_size(),
            jpeg_quality: default_jpeg_quality(),
            jpeg_width: 0,
            class_names: default_class_names(),
            class_colors: default_class_colors(),
            anomaly_classes: default_anomaly_classes(),
            snapshot_classes: default_anomaly_classes(),
            anomaly_match_threshold: default_match_threshold(),
            snapshot_threshold_frames: default_snapshot_threshold_frames(),
            snapshot_cooldown_frames: default_snapshot_cooldown_frames(),
            track_max_frames: default_track_max_frames(),
            track_delay_seconds: default_track_delay_seconds(),
            control_center_url: default_control_center_url(),
            node_token: default_node_token(),
            heartbeat_interval: default_heartbeat_interval(),
            frontend_path: default_frontend_path(),
            rtmp_url: default_rtmp_url(),
            rtmp_fps: default_rtmp_fps(),
            rtmp_bitrate: default_rtmp_bitrate(),
        }
    }
}

/// Every key the environment overlay recognizes. Must stay in sync with the
/// serde renames above.
const KEYS: &[&str] = &[
    "QUEUE_SIZE",
    "DEVICE_ID",
    "DET_MODEL_PATH",
    "CLS_MODEL_PATH",
    "DET_SIZE",
    "CLS_SIZE",
    "CLS_BATCH",
    "CONF_THRES",
    "IOU_THRES",
    "FPS_WINDOW_SIZE",
    "JPEG_QUALITY",
    "JPEG_WIDTH",
    "class_names",
    "class_colors",
    "anomaly_classes",
    "snapshot_classes",
    "anomaly_match_threshold",
    "snapshot_threshold_frames",
    "snapshot_cooldown_frames",
    "TRACK_MAX_FRAMES",
    "TRACK_DELAY_SECONDS",
    "CONTROL_CENTER_URL",
    "NODE_TOKEN",
    "HEARTBEAT_INTERVAL",
    "FRONTEND_PATH",
    "RTMP_URL",
    "RTMP_FPS",
    "RTMP_BITRATE",
];

impl NodeConfig {
    pub fn palette(&self) -> ClassPalette {
        ClassPalette {
            names: self.class_names.clone(),
            colors: self.class_colors.clone(),
        }
    }
}

/// Environment variable name for a config key: uppercased, dots replaced by
/// underscores.
fn env_name(key: &str) -> String {
    key.replace('.', "_").to_uppercase()
}

fn apply_env_overrides(map: &mut serde_json::Map<String, serde_json::Value>) {
    for key in KEYS {
        let Ok(raw) = std::env::var(env_name(key)) else {
            continue;
        };
        // Values that parse as JSON (numbers, arrays, booleans) are taken
        // verbatim; anything else is a plain string.
        let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
        map.insert(key.to_string(), value);
    }
}

/// Load the node configuration from a JSON file, then overlay environment
/// variables. A missing file yields the defaults (still env-overridable).
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<NodeConfig> {
    // Pick up a `.env` file if one exists next to the working directory.
    dotenv::dotenv().ok();
    let mut map = match std::fs::read_to_string(path.as_ref()) {
        Ok(contents) => match serde_json::from_str(&contents)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(ConfigError::NotAnObject),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                "config file {} not found, using defaults",
                path.as_ref().display()
            );
            serde_json::Map::new()
        }
        Err(e) => return Err(e.into()),
    };
    apply_env_overrides(&mut map);
    Ok(serde_json::from_value(serde_json::Value::Object(map))?)
}

/// One entry of the classrooms registry. Unknown fields are preserved so
/// that a GET/POST round trip does not lose data the frontend stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classroom {
    pub id: i64,
    pub url: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Classrooms {
    #[serde(default)]
    pub classrooms: Vec<Classroom>,
}

pub fn load_classrooms<P: AsRef<Path>>(path: P) -> Result<Classrooms> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Resolve the video URL for a classroom id.
pub fn classroom_url<P: AsRef<Path>>(path: P, classroom_id: i64) -> Result<String> {
    let classrooms = load_classrooms(path)?;
    classrooms
        .classrooms
        .into_iter()
        .find(|c| c.id == classroom_id)
        .map(|c| c.url)
        .ok_or(ConfigError::UnknownClassroom(classroom_id))
}

/// Atomically replace the classrooms registry: write to a temp file in the
/// same directory, then rename over the original.
pub fn store_classrooms<P: AsRef<Path>>(path: P, value: &serde_json::Value) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("json.tmp");
    let contents = serde_json::to_string_pretty(value)?;
    if let Err(e) = std::fs::write(&tmp, contents).and_then(|()| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
