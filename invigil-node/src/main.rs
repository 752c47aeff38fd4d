//! invigil-node: edge inference node for a distributed exam-proctoring
//! fleet. Watches one classroom's video feed, attributes anomalous behavior
//! to calibrated seats, reports to the control center, and serves an
//! annotated live MJPEG stream.

use anyhow::Result;
use clap::Parser;

mod app;
mod backends;
#[cfg(feature = "onnx")]
mod ort_runtime;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct NodeArgs {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: std::path::PathBuf,
    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8002")]
    listen: std::net::SocketAddr,
}

fn main() -> Result<()> {
    let _log_guard = invigil_log::init();

    let args = NodeArgs::parse();
    tracing::debug!("{:?}", args);

    let cfg = invigil_config::load_config(&args.config)?;
    tracing::debug!("{:?}", cfg);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("invigil-runtime")
        .build()?;

    runtime.block_on(app::run(cfg, args.listen))
}
