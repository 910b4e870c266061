//! Metrics collection.
//!
//! Workers bump lock-free counters (`CameraCounters`). A separate collector
//! thread samples them on a fixed interval, derives rates, samples process
//! CPU and memory, and publishes an immutable `MetricsSnapshot`. Readers get
//! the latest snapshot as an `Arc` and never touch worker state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::frame::FrameQueue;
use crate::supervisor::{CameraState, SharedStatus, StopSignal};
use crate::CameraId;

/// Weight of the newest sample in the inference latency moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

// -------------------- Counters --------------------

/// Per-camera counters. Each field has exactly one writer thread.
#[derive(Debug, Default)]
pub struct CameraCounters {
    frames_captured: AtomicU64,
    frames_processed: AtomicU64,
    inference_failures: AtomicU64,
    events_accepted: AtomicU64,
    events_suppressed: AtomicU64,
    reconnects: AtomicU64,
    /// f64 bits of the latency moving average, in milliseconds.
    latency_ewma_ms: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CounterSample {
    pub frames_captured: u64,
    pub frames_processed: u64,
    pub inference_failures: u64,
    pub events_accepted: u64,
    pub events_suppressed: u64,
    pub reconnects: u64,
    pub avg_inference_ms: f64,
}

impl CameraCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture worker.
    pub fn record_capture(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture worker.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Inference worker.
    pub fn record_inference(&self, latency: Duration, failed: bool) {
        let sample_ms = latency.as_secs_f64() * 1_000.0;
        let previous = f64::from_bits(self.latency_ewma_ms.load(Ordering::Relaxed));
        let next = if self.frames_processed.load(Ordering::Relaxed) == 0 {
            sample_ms
        } else {
            previous + LATENCY_EWMA_ALPHA * (sample_ms - previous)
        };
        self.latency_ewma_ms.store(next.to_bits(), Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.inference_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Inference worker.
    pub fn record_events(&self, accepted: u64, suppressed: u64) {
        if accepted > 0 {
            self.events_accepted.fetch_add(accepted, Ordering::Relaxed);
        }
        if suppressed > 0 {
            self.events_suppressed.fetch_add(suppressed, Ordering::Relaxed);
        }
    }

    pub fn sample(&self) -> CounterSample {
        CounterSample {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            events_suppressed: self.events_suppressed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            avg_inference_ms: f64::from_bits(self.latency_ewma_ms.load(Ordering::Relaxed)),
        }
    }
}

// -------------------- Snapshot --------------------

#[derive(Clone, Debug, Serialize)]
pub struct CameraMetrics {
    pub camera_id: CameraId,
    pub name: String,
    pub state: CameraState,
    pub last_error: Option<String>,
    /// Frames read from the stream per second.
    pub capture_fps: f64,
    /// Frames run through inference per second.
    pub fps: f64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub dropped_frames: u64,
    pub avg_inference_ms: f64,
    pub inference_failures: u64,
    pub events_accepted: u64,
    pub events_suppressed: u64,
    pub reconnects: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub cameras_online: usize,
    pub cameras_total: usize,
    pub uptime_secs: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at_ms: u64,
    pub cameras: Vec<CameraMetrics>,
    pub system: SystemMetrics,
}

impl MetricsSnapshot {
    pub fn camera(&self, id: CameraId) -> Option<&CameraMetrics> {
        self.cameras.iter().find(|c| c.camera_id == id)
    }
}

// -------------------- Collector --------------------

/// Read-only handles on one camera's shared state.
#[derive(Clone)]
pub struct CameraProbe {
    pub camera_id: CameraId,
    pub name: String,
    pub counters: Arc<CameraCounters>,
    pub queue: Arc<FrameQueue>,
    pub status: SharedStatus,
}

struct RateBaseline {
    at: Instant,
    captured: u64,
    processed: u64,
}

struct ProcessSampler {
    system: System,
    pid: Option<Pid>,
}

impl ProcessSampler {
    fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                log::warn!("process metrics unavailable: {err}");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    /// (cpu %, resident MiB). Zero when the process cannot be sampled.
    fn sample(&mut self) -> (f32, f64) {
        let Some(pid) = self.pid else {
            return (0.0, 0.0);
        };
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        match self.system.process(pid) {
            Some(process) => (
                process.cpu_usage(),
                process.memory() as f64 / 1024.0 / 1024.0,
            ),
            None => (0.0, 0.0),
        }
    }
}

pub struct MetricsCollector {
    probes: RwLock<BTreeMap<CameraId, CameraProbe>>,
    baselines: Mutex<HashMap<CameraId, RateBaseline>>,
    process: Mutex<ProcessSampler>,
    latest: RwLock<Arc<MetricsSnapshot>>,
    started: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            probes: RwLock::new(BTreeMap::new()),
            baselines: Mutex::new(HashMap::new()),
            process: Mutex::new(ProcessSampler::new()),
            latest: RwLock::new(Arc::new(MetricsSnapshot::default())),
            started: Instant::now(),
        }
    }

    pub fn register(&self, probe: CameraProbe) {
        let id = probe.camera_id;
        self.baselines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                id,
                RateBaseline {
                    at: Instant::now(),
                    captured: 0,
                    processed: 0,
                },
            );
        self.probes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, probe);
    }

    pub fn unregister(&self, id: CameraId) {
        self.probes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        self.baselines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Take a sample now and publish it.
    pub fn sample(&self) -> Arc<MetricsSnapshot> {
        let probes: Vec<CameraProbe> = self
            .probes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();

        let now = Instant::now();
        let mut cameras = Vec::with_capacity(probes.len());
        {
            let mut baselines = self.baselines.lock().unwrap_or_else(|p| p.into_inner());
            for probe in &probes {
                let counters = probe.counters.sample();
                let status = probe.status.read().unwrap_or_else(|p| p.into_inner()).clone();
                let baseline = baselines.entry(probe.camera_id).or_insert(RateBaseline {
                    at: now,
                    captured: counters.frames_captured,
                    processed: counters.frames_processed,
                });
                let elapsed = now.duration_since(baseline.at).as_secs_f64();
                let (capture_fps, fps) = if elapsed > 0.0 {
                    (
                        counters.frames_captured.saturating_sub(baseline.captured) as f64 / elapsed,
                        counters.frames_processed.saturating_sub(baseline.processed) as f64
                            / elapsed,
                    )
                } else {
                    (0.0, 0.0)
                };
                *baseline = RateBaseline {
                    at: now,
                    captured: counters.frames_captured,
                    processed: counters.frames_processed,
                };

                cameras.push(CameraMetrics {
                    camera_id: probe.camera_id,
                    name: probe.name.clone(),
                    state: status.state,
                    last_error: status.last_error,
                    capture_fps,
                    fps,
                    queue_depth: probe.queue.depth(),
                    queue_capacity: probe.queue.capacity(),
                    dropped_frames: probe.queue.dropped(),
                    avg_inference_ms: counters.avg_inference_ms,
                    inference_failures: counters.inference_failures,
                    events_accepted: counters.events_accepted,
                    events_suppressed: counters.events_suppressed,
                    reconnects: counters.reconnects,
                });
            }
        }

        let (cpu_percent, memory_mb) = self
            .process
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .sample();

        let snapshot = Arc::new(MetricsSnapshot {
            taken_at_ms: crate::now_ms().unwrap_or_default(),
            system: SystemMetrics {
                cpu_percent,
                memory_mb,
                cameras_online: cameras
                    .iter()
                    .filter(|c| c.state == CameraState::Online)
                    .count(),
                cameras_total: cameras.len(),
                uptime_secs: self.started.elapsed().as_secs(),
            },
            cameras,
        });

        *self.latest.write().unwrap_or_else(|p| p.into_inner()) = snapshot.clone();
        snapshot
    }

    /// Run `sample` every `interval` until `stop` fires.
    pub fn spawn(self: &Arc<Self>, interval: Duration, stop: StopSignal) -> Result<JoinHandle<()>> {
        let collector = Arc::clone(self);
        std::thread::Builder::new()
            .name("metrics".to_string())
            .spawn(move || {
                log::debug!("metrics collector started ({}s interval)", interval.as_secs());
                while !stop.wait_timeout(interval) {
                    let snapshot = collector.sample();
                    log::debug!(
                        "metrics: {}/{} cameras online, cpu {:.1}%, rss {:.1} MiB",
                        snapshot.system.cameras_online,
                        snapshot.system.cameras_total,
                        snapshot.system.cpu_percent,
                        snapshot.system.memory_mb
                    );
                }
                log::debug!("metrics collector stopped");
            })
            .context("spawn metrics collector thread")
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
