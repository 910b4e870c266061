//! Connection supervisor.
//!
//! One capture thread per camera drives the stream lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Online -> Error -> Connecting -> ...
//!                                   (any) -> Removed
//! ```
//!
//! The supervisor is the only writer of its camera's `CameraStatus`. Every
//! transition is logged and forwarded to the event sink. Connection and read
//! failures are never fatal: the supervisor backs off with jitter and retries
//! until its stop signal fires.

use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SettingsHandle;
use crate::frame::{FrameQueue, PushOutcome};
use crate::ingest::{FrameSource, SourceFactory};
use crate::metrics::CameraCounters;
use crate::sink::SinkHandle;
use crate::Camera;

/// Longest pause between polls of a source that had no frame ready.
const IDLE_POLL_PAUSE: Duration = Duration::from_millis(50);

// -------------------- Status --------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    #[default]
    Disconnected,
    Connecting,
    Online,
    Error,
    Removed,
}

impl CameraState {
    pub fn as_str(self) -> &'static str {
        match self {
            CameraState::Disconnected => "disconnected",
            CameraState::Connecting => "connecting",
            CameraState::Online => "online",
            CameraState::Error => "error",
            CameraState::Removed => "removed",
        }
    }
}

impl std::fmt::Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub state: CameraState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_frame_at_ms: Option<u64>,
}

/// Written by one supervisor, read by anyone.
pub type SharedStatus = Arc<RwLock<CameraStatus>>;

// -------------------- Backoff --------------------

/// Reconnect delay policy: `min(base * 2^(failures - 1), cap)`, then
/// multiplied by a random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before retry number `failures` (1-based), without jitter.
    pub fn nominal(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let scaled = self.base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(scaled.min(self.cap_ms))
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let nominal = self.nominal(failures).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 0.99);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(nominal * factor)
    }
}

// -------------------- Stop signal --------------------

/// Cooperative cancellation that also interrupts sleeps.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|p| p.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep up to `timeout`. Returns true if stopped (immediately or while waiting).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

// -------------------- Supervisor --------------------

pub struct Supervisor {
    camera: Camera,
    sources: Arc<dyn SourceFactory>,
    queue: Arc<FrameQueue>,
    status: SharedStatus,
    counters: Arc<CameraCounters>,
    settings: Arc<SettingsHandle>,
    sink: SinkHandle,
    stop: StopSignal,
    next_seq: u64,
}

enum SessionEnd {
    Stopped,
    Failed(anyhow::Error),
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: Camera,
        sources: Arc<dyn SourceFactory>,
        queue: Arc<FrameQueue>,
        status: SharedStatus,
        counters: Arc<CameraCounters>,
        settings: Arc<SettingsHandle>,
        sink: SinkHandle,
        stop: StopSignal,
    ) -> Self {
        Self {
            camera,
            sources,
            queue,
            status,
            counters,
            settings,
            sink,
            stop,
            next_seq: 1,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("capture-{}", self.camera.id))
            .spawn(move || self.run())
            .context("spawn capture thread")
    }

    fn run(mut self) {
        log::info!(
            "camera {} ('{}'): supervisor started for {}",
            self.camera.id,
            self.camera.name,
            self.camera.stream_url
        );
        while !self.stop.is_stopped() {
            self.transition(CameraState::Connecting, None);

            let error = match self.open() {
                Ok(mut source) => {
                    self.transition(CameraState::Online, None);
                    let end = self.stream(source.as_mut());
                    source.disconnect();
                    match end {
                        SessionEnd::Stopped => break,
                        SessionEnd::Failed(err) => err,
                    }
                }
                Err(err) => err,
            };

            let failures = self.record_failure(&error);
            let delay = self.settings.current().backoff.delay(failures);
            log::warn!(
                "camera {}: {error:#}; retry {} in {:.1}s",
                self.camera.id,
                failures,
                delay.as_secs_f64()
            );
            if self.stop.wait_timeout(delay) {
                break;
            }
            self.counters.record_reconnect();
        }
        log::info!("camera {}: supervisor stopped", self.camera.id);
    }

    fn open(&self) -> Result<Box<dyn FrameSource>> {
        let mut source = self.sources.open(&self.camera)?;
        source
            .connect()
            .with_context(|| format!("connect to {}", self.camera.stream_url))?;
        Ok(source)
    }

    /// Read frames until failure, stall or stop.
    fn stream(&mut self, source: &mut dyn FrameSource) -> SessionEnd {
        let interval = Duration::from_secs_f64(1.0 / self.camera.target_fps.max(1) as f64);
        let mut last_frame = Instant::now();
        let mut next_due = Instant::now();

        loop {
            if self.stop.is_stopped() {
                return SessionEnd::Stopped;
            }
            match source.next_frame() {
                Ok(Some(mut frame)) => {
                    last_frame = Instant::now();
                    frame.seq = self.next_seq;
                    self.next_seq += 1;
                    let captured_at = frame.captured_at_ms;
                    self.counters.record_capture();
                    if self.queue.push(frame) == PushOutcome::DroppedOldest {
                        log::trace!("camera {}: queue full, dropped oldest", self.camera.id);
                    }
                    self.write_status(|status| status.last_frame_at_ms = Some(captured_at));

                    next_due += interval;
                    let now = Instant::now();
                    if next_due > now {
                        if self.stop.wait_timeout(next_due - now) {
                            return SessionEnd::Stopped;
                        }
                    } else {
                        next_due = now;
                    }
                }
                Ok(None) => {
                    let stale_after =
                        Duration::from_secs(self.settings.current().stale_frame_secs);
                    if last_frame.elapsed() >= stale_after {
                        return SessionEnd::Failed(anyhow!(
                            "no frame for {}s",
                            stale_after.as_secs()
                        ));
                    }
                    if self.stop.wait_timeout(interval.min(IDLE_POLL_PAUSE)) {
                        return SessionEnd::Stopped;
                    }
                }
                Err(err) => return SessionEnd::Failed(err.context("stream read failed")),
            }
        }
    }

    fn record_failure(&mut self, error: &anyhow::Error) -> u32 {
        let message = format!("{error:#}");
        let failures = self.write_status(|status| {
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            status.consecutive_failures
        });
        self.transition(CameraState::Error, Some(message));
        failures
    }

    fn transition(&mut self, state: CameraState, error: Option<String>) {
        let (previous, status) = self.write_status(|status| {
            let previous = status.state;
            status.state = state;
            match state {
                CameraState::Online => {
                    status.consecutive_failures = 0;
                    status.last_error = None;
                }
                CameraState::Error => status.last_error = error,
                _ => {}
            }
            (previous, status.clone())
        });
        if previous == state && state != CameraState::Error {
            return;
        }
        match state {
            CameraState::Online => log::info!("camera {}: {previous} -> online", self.camera.id),
            CameraState::Error => {}
            _ => log::debug!("camera {}: {previous} -> {state}", self.camera.id),
        }
        self.sink.submit_status(self.camera.id, &status);
    }

    fn write_status<T>(&self, f: impl FnOnce(&mut CameraStatus) -> T) -> T {
        let mut guard = self.status.write().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineSettings;
    use crate::frame::Frame;
    use crate::ingest::StreamSourceFactory;
    use crate::CameraId;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Connects, then reports "nothing yet" without waiting.
    struct IdleFactory {
        polls: Arc<AtomicU64>,
    }

    struct IdleSource {
        polls: Arc<AtomicU64>,
    }

    impl SourceFactory for IdleFactory {
        fn open(&self, _camera: &Camera) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(IdleSource {
                polls: Arc::clone(&self.polls),
            }))
        }
    }

    impl FrameSource for IdleSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    struct Running {
        status: SharedStatus,
        stop: StopSignal,
        handle: JoinHandle<()>,
    }

    fn start_supervisor(url: &str, sources: Arc<dyn SourceFactory>) -> Result<Running> {
        let camera = Camera {
            id: CameraId(7),
            name: "watchdog".to_string(),
            stream_url: url.to_string(),
            location_tag: None,
            target_fps: 100,
        };
        let settings = PipelineSettings {
            stale_frame_secs: 1,
            backoff: Backoff {
                base_ms: 10_000,
                cap_ms: 10_000,
                jitter: 0.0,
            },
            ..PipelineSettings::default()
        };
        let status = SharedStatus::default();
        let stop = StopSignal::new();
        let handle = Supervisor::new(
            camera,
            sources,
            Arc::new(FrameQueue::new(2)),
            Arc::clone(&status),
            Arc::new(CameraCounters::new()),
            Arc::new(SettingsHandle::new(settings)),
            SinkHandle::detached(),
            stop.clone(),
        )
        .spawn()?;
        Ok(Running {
            status,
            stop,
            handle,
        })
    }

    fn wait_for_error(status: &SharedStatus, timeout: Duration) -> Option<CameraStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let current = status.read().unwrap().clone();
            if current.state == CameraState::Error {
                return Some(current);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn stalled_stream_trips_watchdog() -> Result<()> {
        let running = start_supervisor("stub://stall", Arc::new(StreamSourceFactory::new(32, 24)))?;
        let status = wait_for_error(&running.status, Duration::from_secs(5));
        running.stop.stop();
        running.handle.join().expect("supervisor thread");

        let status = status.expect("camera never left online");
        assert_eq!(status.last_error.as_deref(), Some("no frame for 1s"));
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_frame_at_ms.is_none());
        Ok(())
    }

    #[test]
    fn idle_source_is_polled_at_a_bounded_rate() -> Result<()> {
        let polls = Arc::new(AtomicU64::new(0));
        let running = start_supervisor(
            "stub://idle",
            Arc::new(IdleFactory {
                polls: Arc::clone(&polls),
            }),
        )?;
        let status = wait_for_error(&running.status, Duration::from_secs(5));
        let polled = polls.load(Ordering::SeqCst);
        running.stop.stop();
        running.handle.join().expect("supervisor thread");

        assert!(status.is_some());
        // 10ms pause at 100 fps over the one-second watchdog window.
        assert!(polled > 10, "polled {polled} times");
        assert!(polled < 500, "polled {polled} times");
        Ok(())
    }

    #[test]
    fn stop_interrupts_idle_polling() -> Result<()> {
        let polls = Arc::new(AtomicU64::new(0));
        let running = start_supervisor(
            "stub://idle",
            Arc::new(IdleFactory {
                polls: Arc::clone(&polls),
            }),
        )?;
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        running.stop.stop();
        running.handle.join().expect("supervisor thread");
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_ne!(running.status.read().unwrap().state, CameraState::Error);
        Ok(())
    }

    #[test]
    fn nominal_backoff_doubles_to_cap() {
        let backoff = Backoff::default();
        let secs: Vec<u64> = (1..=7).map(|f| backoff.nominal(f).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn nominal_backoff_is_monotonic_and_bounded() {
        let backoff = Backoff {
            base_ms: 250,
            cap_ms: 10_000,
            jitter: 0.0,
        };
        let mut previous = Duration::ZERO;
        for failures in 1..200 {
            let delay = backoff.nominal(failures);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(10_000));
            previous = delay;
        }
        assert_eq!(backoff.delay(3), backoff.nominal(3));
    }

    #[test]
    fn jittered_delays_stay_within_twenty_percent() {
        let backoff = Backoff::default();
        for failures in 1..=5u32 {
            let nominal = backoff.nominal(failures).as_secs_f64();
            for _ in 0..100 {
                let delay = backoff.delay(failures).as_secs_f64();
                assert!(delay >= nominal * 0.8 - 1e-9, "{delay} < 0.8 * {nominal}");
                assert!(delay <= nominal * 1.2 + 1e-9, "{delay} > 1.2 * {nominal}");
            }
        }
    }

    #[test]
    fn stop_signal_interrupts_wait() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let stopped = stop.wait_timeout(Duration::from_secs(30));
                (stopped, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        stop.stop();
        let (stopped, waited) = waiter.join().expect("waiter");
        assert!(stopped);
        assert!(waited < Duration::from_secs(5));
        assert!(stop.wait_timeout(Duration::from_secs(30)));
    }

    #[test]
    fn wait_without_stop_times_out() {
        assert!(!StopSignal::new().wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn camera_state_serializes_lowercase() -> Result<()> {
        assert_eq!(serde_json::to_string(&CameraState::Online)?, "\"online\"");
        assert_eq!(CameraStatus::default().state, CameraState::Disconnected);
        Ok(())
    }
}
