//! RTMP relay: pipes the node's annotated MJPEG output through an ffmpeg
//! child process to an RTMP endpoint.
//!
//! ffmpeg reads MJPEG on stdin and publishes FLV. A feeder thread pulls
//! deduplicated latest frames off the frame bus at a fixed rate; a broken
//! pipe stops the feeder and surfaces ffmpeg's stderr for diagnostics.

use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use frame_bus::{FrameBus, WaitOutcome};

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("ffmpeg not available: {0}")]
    FfmpegMissing(String),
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub rtmp_url: String,
    pub fps: u32,
    pub bitrate: String,
}

/// Status report returned by start/stop, serialized straight to the API.
#[derive(Debug, Serialize)]
pub struct RelayStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder: Option<String>,
}

/// Hardware encoders probed for, in preference order, with their extra
/// arguments. Falls back to software x264 tuned for latency.
const HW_ENCODERS: &[(&str, &[&str])] = &[
    ("h264_nvenc", &["-preset", "llhq", "-zerolatency", "1"]),
    ("h264_vaapi", &["-vf", "format=nv12,hwupload", "-vaapi_device", "/dev/dri/renderD128"]),
    ("h264_videotoolbox", &["-realtime", "1"]),
];
const SW_ENCODER: (&str, &[&str]) = ("libx264", &["-preset", "ultrafast", "-tune", "zerolatency"]);

/// Probe `ffmpeg -encoders` and pick the best available H.264 encoder.
fn detect_encoder() -> Result<(&'static str, &'static [&'static str]), RelayError> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| RelayError::FfmpegMissing(e.to_string()))?;
    let listing = String::from_utf8_lossy(&output.stdout);
    for (name, args) in HW_ENCODERS {
        if listing.contains(name) {
            info!("using hardware encoder {name}");
            return Ok((name, args));
        }
    }
    info!("falling back to software encoding ({})", SW_ENCODER.0);
    Ok(SW_ENCODER)
}

/// Build the ffmpeg command line: MJPEG on stdin, FLV out to RTMP.
fn ffmpeg_args(cfg: &RelayConfig, encoder: &str, encoder_args: &[&str]) -> Vec<String> {
    let mut args: Vec<String> = [
        "-y",
        "-hide_banner",
        "-f",
        "mjpeg",
        "-framerate",
        &cfg.fps.to_string(),
        "-i",
        "pipe:0",
        "-c:v",
        encoder,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend(encoder_args.iter().map(|s| s.to_string()));
    args.extend(
        [
            "-b:v",
            &cfg.bitrate,
            "-g",
            &cfg.fps.to_string(),
            "-bf",
            "0",
            "-pix_fmt",
            "yuv420p",
            "-f",
            "flv",
            &cfg.rtmp_url,
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args
}

struct Running {
    child: Child,
    feeder: std::thread::JoinHandle<()>,
    stop: Arc<AtomicBool>,
    encoder: String,
}

pub struct RtmpRelay {
    cfg: RelayConfig,
    bus: FrameBus,
    runtime: tokio::runtime::Handle,
    running: Mutex<Option<Running>>,
}

impl RtmpRelay {
    pub fn new(cfg: RelayConfig, bus: FrameBus, runtime: tokio::runtime::Handle) -> Self {
        Self {
            cfg,
            bus,
            runtime,
            running: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<RelayStatus, RelayError> {
        let mut running = self.running.lock();
        if let Some(r) = running.as_ref() {
            return Ok(RelayStatus {
                status: "already running",
                encoder: Some(r.encoder.clone()),
            });
        }

        let (encoder, encoder_args) = detect_encoder()?;
        let args = ffmpeg_args(&self.cfg, encoder, encoder_args);
        info!("starting ffmpeg -> {}", self.cfg.rtmp_url);
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            return Err(RelayError::FfmpegMissing("no stdin pipe".to_string()));
        };

        let stop = Arc::new(AtomicBool::new(false));
        let feeder = std::thread::Builder::new().name("rtmp-feeder".into()).spawn({
            let stop = stop.clone();
            let tap = self.bus.subscribe();
            let runtime = self.runtime.clone();
            let fps = self.cfg.fps.max(1);
            move || feed_frames(stdin, tap, runtime, fps, stop)
        })?;

        *running = Some(Running {
            child,
            feeder,
            stop,
            encoder: encoder.to_string(),
        });
        Ok(RelayStatus {
            status: "started",
            encoder: Some(encoder.to_string()),
        })
    }

    pub fn stop(&self) -> RelayStatus {
        let Some(mut r) = self.running.lock().take() else {
            return RelayStatus {
                status: "not running",
                encoder: None,
            };
        };
        r.stop.store(true, Ordering::SeqCst);
        if r.feeder.join().is_err() {
            warn!("rtmp feeder panicked");
        }
        // Closing stdin (dropped with the feeder) lets ffmpeg flush; give it
        // a moment, then make sure it is gone.
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            match r.child.try_wait() {
                Ok(Some(status)) => {
                    info!("ffmpeg exited: {status}");
                    break;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                other => {
                    if let Err(e) = other {
                        warn!("waiting for ffmpeg failed: {e}");
                    } else {
                        warn!("ffmpeg did not exit in time, killing");
                    }
                    let _ = r.child.kill();
                    let _ = r.child.wait();
                    break;
                }
            }
        }
        RelayStatus {
            status: "stopped",
            encoder: Some(r.encoder),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

fn feed_frames(
    mut stdin: std::process::ChildStdin,
    mut tap: frame_bus::FrameTap,
    runtime: tokio::runtime::Handle,
    fps: u32,
    stop: Arc<AtomicBool>,
) {
    let interval = Duration::from_secs_f64(1.0 / fps as f64);
    let mut last_sent = 0u64;
    // Back-dated so the first frame goes out immediately.
    let mut last_push = Instant::now().checked_sub(interval).unwrap_or_else(Instant::now);
    while !stop.load(Ordering::SeqCst) {
        let outcome = runtime.block_on(tap.wait_newer(last_sent, Duration::from_millis(100)));
        let (bytes, frame_id) = match outcome {
            WaitOutcome::Frame { bytes, frame_id } => (bytes, frame_id),
            WaitOutcome::TimedOut => continue,
            WaitOutcome::Shutdown => break,
        };

        // Never push faster than the configured relay rate.
        let wait = (last_push + interval).saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }

        match stdin.write_all(&bytes).and_then(|()| stdin.flush()) {
            Ok(()) => {
                last_push = Instant::now();
                last_sent = frame_id;
            }
            Err(e) => {
                warn!("ffmpeg stdin broken: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_shape() {
        let cfg = RelayConfig {
            rtmp_url: "rtmp://localhost:1935/live/stream".to_string(),
            fps: 15,
            bitrate: "500k".to_string(),
        };
        let args = ffmpeg_args(&cfg, SW_ENCODER.0, SW_ENCODER.1);
        // Input declaration must precede -i.
        let framerate = args.iter().position(|a| a == "-framerate").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(framerate < input);
        assert_eq!(args[framerate + 1], "15");
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-b:v" && w[1] == "500k"));
        assert_eq!(args.last().unwrap(), "rtmp://localhost:1935/live/stream");
    }
}
