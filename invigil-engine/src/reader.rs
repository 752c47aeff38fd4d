//! Video-reader worker: opens the configured source, paces reads to the
//! source frame rate, and feeds raw frames into the bounded queue. Read
//! failures trigger a bounded reconnect dance before giving up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use invigil_types::Frame;
use lossy_queue::LossyQueue;

use crate::source::VideoBackend;
use crate::{EngineShared, InferOut, IDLE_SLEEP};

const FALLBACK_FPS: f64 = 24.0;
const MAX_CONSECUTIVE_FAILURES: u32 = 10;
const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_SPACING: Duration = Duration::from_secs(1);

pub(crate) fn run_video_reader(
    shared: Arc<EngineShared>,
    backend: Arc<dyn VideoBackend>,
    raw_q: LossyQueue<Frame>,
    result_q: LossyQueue<InferOut>,
) {
    let gates = &shared.gates;
    let status = &shared.status;

    while !gates.exiting() {
        if !gates.video_on() {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }
        let Some(uri) = status.source() else {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        };

        info!("opening video source {uri}");
        let mut stream = match backend.open(&uri) {
            Ok(stream) => {
                status.clear_error();
                stream
            }
            Err(e) => {
                warn!("{e}");
                status.set_error(e.to_string());
                gates.set_video(false);
                continue;
            }
        };

        let fps = stream.fps().filter(|f| *f > 0.0).unwrap_or(FALLBACK_FPS);
        let frame_interval = Duration::from_secs_f64(1.0 / fps);
        let mut consecutive_failures = 0u32;

        while gates.video_on() && !gates.exiting() {
            let t_start = Instant::now();
            match stream.read() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    let _ = raw_q.offer(frame);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                        warn!(
                            "{MAX_CONSECUTIVE_FAILURES} consecutive read failures ({e}), \
                             reconnecting"
                        );
                        match reconnect(&shared, backend.as_ref(), &uri) {
                            Some(new_stream) => {
                                stream = new_stream;
                                consecutive_failures = 0;
                                status.clear_error();
                            }
                            None => {
                                status.set_error(format!("video source lost: {uri}"));
                                gates.set_video(false);
                                break;
                            }
                        }
                    }
                    // No pacing after a failed read.
                    continue;
                }
            }
            // Pace reads to the source frame rate.
            let elapsed = t_start.elapsed();
            if frame_interval > elapsed {
                std::thread::sleep(frame_interval - elapsed);
            }
        }

        drop(stream);
        info!("released video source");
        raw_q.drain();
        result_q.drain();
    }

    raw_q.drain();
    result_q.drain();
}

fn reconnect(
    shared: &EngineShared,
    backend: &dyn VideoBackend,
    uri: &str,
) -> Option<Box<dyn crate::source::VideoStream>> {
    for attempt in 1..=RECONNECT_ATTEMPTS {
        std::thread::sleep(RECONNECT_SPACING);
        if shared.gates.exiting() || !shared.gates.video_on() {
            return None;
        }
        match backend.open(uri) {
            Ok(stream) => {
                info!("reconnected to {uri}");
                return Some(stream);
            }
            Err(e) => warn!("reconnect attempt {attempt}/{RECONNECT_ATTEMPTS} failed: {e}"),
        }
    }
    warn!("reconnect to {uri} failed for good");
    None
}
