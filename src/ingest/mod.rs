//! Frame ingestion sources.
//!
//! A `FrameSource` wraps one video stream. The connection supervisor owns it
//! exclusively: it calls `connect`, pulls frames with `next_frame` until that
//! fails, then calls `disconnect` and schedules a reconnect.
//!
//! `next_frame` distinguishes three outcomes:
//! - `Ok(Some(frame))`: a decoded frame
//! - `Ok(None)`: nothing arrived within the source's poll timeout; the
//!   supervisor's no-frame watchdog decides when that becomes an error
//! - `Err(_)`: read failure or stream closed
//!
//! Sources never write frames anywhere; a frame lives until the inference
//! worker drops it.

pub mod rtsp;

use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;

use crate::frame::Frame;
use crate::Camera;

pub use rtsp::{RtspConfig, RtspSource};

pub trait FrameSource: Send {
    /// Open the stream. Errors are transient and retried by the supervisor.
    fn connect(&mut self) -> Result<()>;

    /// Pull the next frame, waiting at most the source's poll timeout.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the stream handle. Must be safe to call more than once.
    fn disconnect(&mut self) {}
}

/// Builds a fresh source for a camera on every connection attempt.
pub trait SourceFactory: Send + Sync {
    fn open(&self, camera: &Camera) -> Result<Box<dyn FrameSource>>;
}

/// Default factory: `stub://` addresses get the synthetic source,
/// `rtsp://`/`rtsps://` the GStreamer pipeline when built with
/// `rtsp-gstreamer`.
#[derive(Clone, Debug)]
pub struct StreamSourceFactory {
    /// Synthetic frame size.
    pub width: u32,
    pub height: u32,
}

impl StreamSourceFactory {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for StreamSourceFactory {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl SourceFactory for StreamSourceFactory {
    fn open(&self, camera: &Camera) -> Result<Box<dyn FrameSource>> {
        let source = RtspSource::new(RtspConfig {
            camera_id: camera.id,
            url: camera.stream_url.clone(),
            target_fps: camera.target_fps,
            width: self.width,
            height: self.height,
        })?;
        Ok(Box::new(source))
    }
}

fn stream_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?i)(rtsps?|https?|stub)://[^\s/$.?#][^\s]*$")
            .unwrap_or_else(|err| panic!("invalid stream url regex: {err}"))
    })
}

/// Accept only stream addresses with a supported scheme and a non-empty host.
pub fn validate_stream_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return crate::invalid("stream_url", "must not be empty");
    }
    if !stream_url_pattern().is_match(url) {
        return crate::invalid(
            "stream_url",
            format!("'{}' is not an rtsp(s), http(s) or stub:// address", url),
        );
    }
    Ok(())
}
