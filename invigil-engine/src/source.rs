//! The opaque video-ingress interface.
//!
//! Opening a URI and reading frames is delegated to a [`VideoBackend`]
//! implementation wired in at composition time; the reader worker only sees
//! these traits.

use invigil_types::Frame;

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("cannot open video source {uri}: {reason}")]
    Open { uri: String, reason: String },
    #[error("read failed: {0}")]
    Read(String),
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),
}

/// An open capture. Owned by the reader thread.
pub trait VideoStream: Send {
    /// Native frame rate of the source, when known.
    fn fps(&self) -> Option<f64>;
    /// Read the next frame, blocking.
    fn read(&mut self) -> Result<Frame, SourceError>;
}

/// Factory for opening video sources.
pub trait VideoBackend: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn VideoStream>, SourceError>;
}
