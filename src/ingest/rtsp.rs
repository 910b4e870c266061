//! RTSP frame source.
//!
//! `RtspSource` decodes IP camera streams through GStreamer (feature
//! `rtsp-gstreamer`) and falls back to a synthetic generator for `stub://`
//! addresses. Synthetic hosts with special behaviour:
//! - `stub://offline...`: every connection attempt is refused
//! - `stub://stall...`: connects, then never delivers a frame

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{bail, Result};
use std::time::Duration;

use super::FrameSource;
use crate::frame::Frame;
use crate::CameraId;

/// Poll timeout for the synthetic stall mode.
const SYNTHETIC_POLL: Duration = Duration::from_millis(100);

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    pub camera_id: CameraId,
    /// Stream address, e.g. "rtsp://192.168.1.100:554/stream".
    pub url: String,
    pub target_fps: u32,
    /// Frame width for synthetic frames.
    pub width: u32,
    /// Frame height for synthetic frames.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            camera_id: CameraId(0),
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 15,
            width: 640,
            height: 480,
        }
    }
}

pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.to_ascii_lowercase().starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                bail!(
                    "cannot open {}: stream decoding requires the rtsp-gstreamer feature",
                    config.url
                )
            }
        }
    }

    pub fn frames_captured(&self) -> u64 {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.frame_count,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.frame_count,
        }
    }
}

impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn disconnect(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connected = false,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.disconnect(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyntheticMode {
    Live,
    Offline,
    Stall,
}

struct SyntheticRtspSource {
    config: RtspConfig,
    mode: SyntheticMode,
    connected: bool,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        let host = config.url["stub://".len()..].to_ascii_lowercase();
        let mode = if host.starts_with("offline") {
            SyntheticMode::Offline
        } else if host.starts_with("stall") {
            SyntheticMode::Stall
        } else {
            SyntheticMode::Live
        };
        Self {
            config,
            mode,
            connected: false,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.mode == SyntheticMode::Offline {
            bail!("connection refused by {}", self.config.url);
        }
        self.connected = true;
        log::debug!(
            "camera {}: connected to {} (synthetic)",
            self.config.camera_id,
            self.config.url
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            bail!("synthetic stream {} is not connected", self.config.url);
        }
        if self.mode == SyntheticMode::Stall {
            std::thread::sleep(SYNTHETIC_POLL);
            return Ok(None);
        }

        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        Ok(Some(Frame::new(
            self.config.camera_id,
            self.frame_count,
            crate::now_ms()?,
            self.config.width,
            self.config.height,
            pixels,
        )))
    }

    /// Mostly static background with a scene change every 50 frames.
    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width as usize) * (self.config.height as usize) * 3;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let offset = self.frame_count + self.scene_state as u64;
        (0..pixel_count)
            .map(|i| ((i as u64 + offset) % 256) as u8)
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB, drop, 1 buffer).
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.last_error = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!(
            "camera {}: connected to {}",
            self.config.camera_id,
            self.config.url
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::debug!(
                "camera {}: pipeline teardown failed: {err}",
                self.config.camera_id
            );
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            bail!(err);
        }

        let Some(sample) = self.appsink.try_pull_sample(self.frame_timeout()) else {
            if self.appsink.is_eos() {
                bail!("stream closed by {}", self.config.url);
            }
            return Ok(None);
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;

        Ok(Some(Frame::new(
            self.config.camera_id,
            self.frame_count,
            crate::now_ms()?,
            width,
            height,
            pixels,
        )))
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let fps = self.config.target_fps.max(1) as u64;
        gstreamer::ClockTime::from_mseconds((4_000 / fps).max(500))
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached end of stream".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(url: &str) -> RtspConfig {
        RtspConfig {
            camera_id: CameraId(2),
            url: url.to_string(),
            target_fps: 10,
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn synthetic_source_produces_numbered_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config("stub://test"))?;
        source.connect()?;

        let first = source.next_frame()?.expect("frame");
        let second = source.next_frame()?.expect("frame");
        assert_eq!(first.width, 64);
        assert_eq!(first.height, 48);
        assert_eq!(first.pixels().len(), 64 * 48 * 3);
        assert!(second.seq > first.seq);
        assert_eq!(source.frames_captured(), 2);
        Ok(())
    }

    #[test]
    fn synthetic_offline_host_refuses_connection() -> Result<()> {
        let mut source = RtspSource::new(stub_config("stub://offline-cam"))?;
        assert!(source.connect().is_err());
        Ok(())
    }

    #[test]
    fn synthetic_stall_host_yields_no_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config("stub://stall"))?;
        source.connect()?;
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn reading_after_disconnect_fails() -> Result<()> {
        let mut source = RtspSource::new(stub_config("stub://test"))?;
        source.connect()?;
        source.disconnect();
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn rtsp_without_decoder_fails_to_open() {
        assert!(RtspSource::new(stub_config("rtsp://10.0.0.2/stream")).is_err());
    }
}
