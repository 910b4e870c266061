//! Engine: the single coordination point for registration and configuration.
//!
//! Every camera runs two threads, a capture supervisor and an inference
//! worker, joined by that camera's `FrameQueue`. The engine owns the registry
//! of running cameras; mutations (register, remove, zone upsert/delete,
//! settings swap) are linearized here, and workers only ever see immutable
//! snapshots (`Arc<Vec<Zone>>`, `Arc<PipelineSettings>`) taken at the start of
//! a cycle.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::config::{PipelineSettings, SettingsHandle};
use crate::dedup::Deduplicator;
use crate::detect::{DetectorFactory, DetectorRegistry, InferenceAdapter};
use crate::frame::FrameQueue;
use crate::ingest::{validate_stream_url, SourceFactory};
use crate::metrics::{CameraCounters, CameraProbe, MetricsCollector, MetricsSnapshot};
use crate::rules::{RuleConfig, RuleEngine};
use crate::sink::{EventSink, Notifier, SinkHandle, DEFAULT_SINK_CAPACITY};
use crate::storage::Store;
use crate::supervisor::{CameraState, CameraStatus, SharedStatus, StopSignal, Supervisor};
use crate::tracker::PresenceTracker;
use crate::zone::{Geometry, Zone};
use crate::{invalid, Camera, CameraId, ZoneId};

/// Dedup keys older than the window are pruned every this many frames.
const DEDUP_PRUNE_EVERY: u64 = 64;

pub struct EngineOptions {
    pub settings: PipelineSettings,
    pub metrics_interval: Duration,
    pub topic_prefix: String,
    pub sink_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            settings: PipelineSettings::default(),
            metrics_interval: Duration::from_secs(5),
            topic_prefix: "sentinelsight".to_string(),
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraStatusReport {
    pub camera_id: CameraId,
    pub state: CameraState,
    /// Processed frames per second as of the latest metrics sample.
    pub fps: f64,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_frame_at_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineHealth {
    /// `ok` when every camera is online, `degraded` otherwise, `idle` with no cameras.
    pub status: &'static str,
    pub cameras_online: usize,
    pub cameras_total: usize,
    pub detector: String,
    pub settings_version: u64,
    pub sink_dropped: u64,
    pub sink_persist_failures: u64,
}

// -------------------- Per-camera runtime --------------------

/// Zone list of one camera, swapped whole on every change.
#[derive(Default)]
struct ZoneSet {
    current: RwLock<Arc<Vec<Zone>>>,
}

impl ZoneSet {
    fn new(zones: Vec<Zone>) -> Self {
        Self {
            current: RwLock::new(Arc::new(zones)),
        }
    }

    fn load(&self) -> Arc<Vec<Zone>> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn store(&self, zones: Vec<Zone>) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(zones);
    }
}

struct CameraRuntime {
    camera: Camera,
    zones: Arc<ZoneSet>,
    queue: Arc<FrameQueue>,
    status: SharedStatus,
    stop: StopSignal,
    capture: Option<JoinHandle<()>>,
    inference: Option<JoinHandle<()>>,
}

impl CameraRuntime {
    /// Stop both workers and wait for them. Bounded by one in-flight frame.
    fn halt(&mut self) {
        self.stop.stop();
        self.queue.close();
        for (role, handle) in [
            ("capture", self.capture.take()),
            ("inference", self.inference.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    log::error!("camera {}: {role} thread panicked", self.camera.id);
                }
            }
        }
    }

    fn finish(&self, state: CameraState) -> CameraStatus {
        let mut status = self.status.write().unwrap_or_else(|p| p.into_inner());
        status.state = state;
        status.clone()
    }
}

struct InferenceWorker {
    camera_id: CameraId,
    queue: Arc<FrameQueue>,
    zones: Arc<ZoneSet>,
    settings: Arc<SettingsHandle>,
    counters: Arc<CameraCounters>,
    sink: SinkHandle,
    stop: StopSignal,
    adapter: InferenceAdapter,
    tracker: PresenceTracker,
    rules: RuleEngine,
    dedup: Deduplicator,
}

impl InferenceWorker {
    fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("inference-{}", self.camera_id))
            .spawn(move || self.run())
            .context("spawn inference thread")
    }

    fn run(mut self) {
        log::debug!(
            "camera {}: inference worker started ({})",
            self.camera_id,
            self.adapter.detector_name()
        );
        let mut zones = self.zones.load();
        while let Some(frame) = self.queue.pop() {
            if self.stop.is_stopped() {
                break;
            }
            let settings = self.settings.current();
            let latest = self.zones.load();
            if !Arc::ptr_eq(&latest, &zones) {
                let live: HashSet<ZoneId> = latest.iter().map(|z| z.id).collect();
                for zone in zones.iter().filter(|z| !live.contains(&z.id)) {
                    self.dedup.forget_zone(zone.id);
                }
                zones = latest;
            }

            let outcome = self.adapter.run(&frame, &settings.filter);
            self.counters.record_inference(outcome.latency, outcome.failed);

            let update =
                self.tracker
                    .update(&outcome.detections, frame.captured_at_ms, &settings.tracker);
            let candidates = self.rules.evaluate(&zones, &update, &frame);

            let (mut accepted, mut suppressed) = (0u64, 0u64);
            for candidate in candidates {
                if self.dedup.accept(&candidate, settings.dedup_window_ms) {
                    accepted += 1;
                    self.sink.submit_event(candidate);
                } else {
                    suppressed += 1;
                }
            }
            self.counters.record_events(accepted, suppressed);

            if frame.seq % DEDUP_PRUNE_EVERY == 0 {
                self.dedup
                    .prune(frame.captured_at_ms, settings.dedup_window_ms);
            }
        }
        log::debug!("camera {}: inference worker stopped", self.camera_id);
    }
}

// -------------------- Engine --------------------

pub struct Engine {
    store: Arc<dyn Store>,
    sources: Arc<dyn SourceFactory>,
    detector: DetectorFactory,
    detector_name: String,
    settings: Arc<SettingsHandle>,
    metrics: Arc<MetricsCollector>,
    metrics_interval: Duration,
    metrics_stop: StopSignal,
    metrics_thread: Mutex<Option<JoinHandle<()>>>,
    sink: Mutex<EventSink>,
    sink_handle: SinkHandle,
    cameras: Mutex<BTreeMap<CameraId, CameraRuntime>>,
}

impl Engine {
    /// Workers use the registry's default detector.
    pub fn new(
        store: Arc<dyn Store>,
        sources: Arc<dyn SourceFactory>,
        detectors: &DetectorRegistry,
        notifier: Option<Arc<dyn Notifier>>,
        options: EngineOptions,
    ) -> Result<Self> {
        options.settings.validate()?;
        let detector = detectors.default_factory()?;
        let detector_name = detectors
            .default_name()
            .unwrap_or("unknown")
            .to_string();
        let sink = EventSink::spawn(
            Arc::clone(&store),
            notifier,
            &options.topic_prefix,
            options.sink_capacity,
        )?;
        let sink_handle = sink.handle();
        Ok(Self {
            store,
            sources,
            detector,
            detector_name,
            settings: Arc::new(SettingsHandle::new(options.settings)),
            metrics: Arc::new(MetricsCollector::new()),
            metrics_interval: options.metrics_interval,
            metrics_stop: StopSignal::new(),
            metrics_thread: Mutex::new(None),
            sink: Mutex::new(sink),
            sink_handle,
            cameras: Mutex::new(BTreeMap::new()),
        })
    }

    fn cameras(&self) -> MutexGuard<'_, BTreeMap<CameraId, CameraRuntime>> {
        self.cameras.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start every persisted camera and the metrics collector.
    pub fn start(&self) -> Result<()> {
        let persisted = self.store.load_cameras().context("load cameras")?;
        let mut cameras = self.cameras();
        for camera in persisted {
            if cameras.contains_key(&camera.id) {
                continue;
            }
            let id = camera.id;
            let zones = match self.store.load_zones(id) {
                Ok(zones) => zones,
                Err(err) => {
                    log::warn!("camera {id}: zones unavailable, starting without them: {err:#}");
                    Vec::new()
                }
            };
            match self.launch(camera, zones) {
                Ok(runtime) => {
                    cameras.insert(id, runtime);
                }
                Err(err) => log::error!("camera {id}: failed to start: {err:#}"),
            }
        }
        let count = cameras.len();
        drop(cameras);

        let mut metrics_thread = self.metrics_thread.lock().unwrap_or_else(|p| p.into_inner());
        if metrics_thread.is_none() {
            *metrics_thread = Some(
                self.metrics
                    .spawn(self.metrics_interval, self.metrics_stop.clone())?,
            );
        }
        log::info!(
            "engine started: {count} camera(s), detector '{}'",
            self.detector_name
        );
        Ok(())
    }

    fn launch(&self, camera: Camera, zones: Vec<Zone>) -> Result<CameraRuntime> {
        let settings = self.settings.current();
        let adapter = InferenceAdapter::new((self.detector)()?);
        let queue = Arc::new(FrameQueue::new(settings.queue_capacity));
        let status: SharedStatus = Arc::default();
        let counters = Arc::new(CameraCounters::new());
        let zones = Arc::new(ZoneSet::new(zones));
        let stop = StopSignal::new();

        let inference = InferenceWorker {
            camera_id: camera.id,
            queue: Arc::clone(&queue),
            zones: Arc::clone(&zones),
            settings: Arc::clone(&self.settings),
            counters: Arc::clone(&counters),
            sink: self.sink_handle.clone(),
            stop: stop.clone(),
            adapter,
            tracker: PresenceTracker::new(),
            rules: RuleEngine::new(camera.id),
            dedup: Deduplicator::new(),
        }
        .spawn()?;

        let capture = Supervisor::new(
            camera.clone(),
            Arc::clone(&self.sources),
            Arc::clone(&queue),
            Arc::clone(&status),
            Arc::clone(&counters),
            Arc::clone(&self.settings),
            self.sink_handle.clone(),
            stop.clone(),
        )
        .spawn();
        let capture = match capture {
            Ok(handle) => handle,
            Err(err) => {
                stop.stop();
                queue.close();
                return Err(err);
            }
        };

        self.metrics.register(CameraProbe {
            camera_id: camera.id,
            name: camera.name.clone(),
            counters,
            queue: Arc::clone(&queue),
            status: Arc::clone(&status),
        });

        Ok(CameraRuntime {
            camera,
            zones,
            queue,
            status,
            stop,
            capture: Some(capture),
            inference: Some(inference),
        })
    }

    /// Persist a camera and start its workers.
    pub fn register_camera(
        &self,
        name: &str,
        stream_url: &str,
        location_tag: Option<&str>,
    ) -> Result<Camera> {
        let name = name.trim();
        if name.is_empty() {
            return invalid("name", "must not be empty");
        }
        validate_stream_url(stream_url)?;
        let target_fps = self.settings.current().target_fps;

        let mut cameras = self.cameras();
        if cameras.values().any(|rt| rt.camera.stream_url == stream_url) {
            return invalid("stream_url", format!("'{stream_url}' is already registered"));
        }
        let camera = self
            .store
            .insert_camera(name, stream_url, location_tag, target_fps)?;
        let runtime = match self.launch(camera.clone(), Vec::new()) {
            Ok(runtime) => runtime,
            Err(err) => {
                if let Err(cleanup) = self.store.delete_camera(camera.id) {
                    log::warn!("camera {}: rollback failed: {cleanup:#}", camera.id);
                }
                return Err(err);
            }
        };
        cameras.insert(camera.id, runtime);
        log::info!(
            "camera {} ('{}') registered: {}",
            camera.id,
            camera.name,
            camera.stream_url
        );
        Ok(camera)
    }

    /// Stop the camera's workers, release its queue and delete it with its
    /// zones and events.
    pub fn remove_camera(&self, id: CameraId) -> Result<()> {
        let mut runtime = self
            .cameras()
            .remove(&id)
            .ok_or_else(|| anyhow!("camera {id} is not registered"))?;
        runtime.halt();
        self.metrics.unregister(id);
        let status = runtime.finish(CameraState::Removed);
        self.sink_handle.submit_status(id, &status);
        self.store.delete_camera(id)?;
        log::info!("camera {id} removed");
        Ok(())
    }

    pub fn list_cameras(&self) -> Vec<Camera> {
        self.cameras()
            .values()
            .map(|rt| rt.camera.clone())
            .collect()
    }

    /// Create or replace (by camera and name) a zone. Invalid geometry or
    /// rules are rejected before anything is written.
    pub fn upsert_zone(
        &self,
        camera_id: CameraId,
        name: &str,
        geometry: Geometry,
        rules: RuleConfig,
    ) -> Result<Zone> {
        let draft = Zone {
            id: ZoneId(0),
            camera_id,
            name: name.trim().to_string(),
            geometry,
            rules,
        };
        draft.validate()?;

        let cameras = self.cameras();
        let runtime = cameras
            .get(&camera_id)
            .ok_or_else(|| anyhow!("camera {camera_id} is not registered"))?;
        let zone =
            self.store
                .upsert_zone(camera_id, &draft.name, &draft.geometry, &draft.rules)?;
        runtime.zones.store(self.store.load_zones(camera_id)?);
        log::info!(
            "camera {camera_id}: zone {} ('{}') saved ({})",
            zone.id,
            zone.name,
            zone.geometry.kind()
        );
        Ok(zone)
    }

    pub fn delete_zone(&self, id: ZoneId) -> Result<()> {
        let cameras = self.cameras();
        let camera_id = self
            .store
            .delete_zone(id)?
            .ok_or_else(|| anyhow!("zone {id} does not exist"))?;
        if let Some(runtime) = cameras.get(&camera_id) {
            runtime.zones.store(self.store.load_zones(camera_id)?);
        }
        log::info!("camera {camera_id}: zone {id} deleted");
        Ok(())
    }

    /// Zones the camera's worker currently evaluates.
    pub fn zones(&self, camera_id: CameraId) -> Option<Arc<Vec<Zone>>> {
        self.cameras().get(&camera_id).map(|rt| rt.zones.load())
    }

    pub fn camera_status(&self, id: CameraId) -> Option<CameraStatusReport> {
        let status = {
            let cameras = self.cameras();
            let runtime = cameras.get(&id)?;
            let status = runtime.status.read().unwrap_or_else(|p| p.into_inner());
            status.clone()
        };
        let fps = self
            .metrics
            .snapshot()
            .camera(id)
            .map(|m| m.fps)
            .unwrap_or_default();
        Some(CameraStatusReport {
            camera_id: id,
            state: status.state,
            fps,
            last_error: status.last_error,
            consecutive_failures: status.consecutive_failures,
            last_frame_at_ms: status.last_frame_at_ms,
        })
    }

    /// Latest sample published by the collector.
    pub fn metrics_snapshot(&self) -> Arc<MetricsSnapshot> {
        self.metrics.snapshot()
    }

    /// Sample now instead of waiting for the next interval.
    pub fn sample_metrics(&self) -> Arc<MetricsSnapshot> {
        self.metrics.sample()
    }

    pub fn health(&self) -> EngineHealth {
        let (online, total) = {
            let cameras = self.cameras();
            let online = cameras
                .values()
                .filter(|rt| {
                    rt.status.read().unwrap_or_else(|p| p.into_inner()).state
                        == CameraState::Online
                })
                .count();
            (online, cameras.len())
        };
        let status = match (online, total) {
            (_, 0) => "idle",
            (online, total) if online == total => "ok",
            _ => "degraded",
        };
        let stats = self.sink_handle.stats();
        EngineHealth {
            status,
            cameras_online: online,
            cameras_total: total,
            detector: self.detector_name.clone(),
            settings_version: self.settings.current().version,
            sink_dropped: stats.dropped(),
            sink_persist_failures: stats.persist_failures(),
        }
    }

    pub fn settings(&self) -> Arc<PipelineSettings> {
        self.settings.current()
    }

    /// Validate and install new pipeline settings. Returns the new version.
    pub fn update_settings(&self, settings: PipelineSettings) -> Result<u64> {
        let version = self.settings.replace(settings)?;
        log::info!("pipeline settings updated to version {version}");
        Ok(version)
    }

    /// Stop every camera (keeping persisted rows), the collector and the sink.
    pub fn shutdown(&self) {
        let runtimes: Vec<CameraRuntime> = {
            let mut cameras = self.cameras();
            std::mem::take(&mut *cameras).into_values().collect()
        };
        for runtime in &runtimes {
            runtime.stop.stop();
            runtime.queue.close();
        }
        for mut runtime in runtimes {
            runtime.halt();
            self.metrics.unregister(runtime.camera.id);
            let status = runtime.finish(CameraState::Disconnected);
            self.sink_handle.submit_status(runtime.camera.id, &status);
        }

        self.metrics_stop.stop();
        let metrics_thread = self
            .metrics_thread
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = metrics_thread {
            if handle.join().is_err() {
                log::error!("metrics thread panicked");
            }
        }

        self.sink.lock().unwrap_or_else(|p| p.into_inner()).shutdown();
        log::info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, Detector};
    use crate::frame::Frame;
    use crate::ingest::{FrameSource, StreamSourceFactory};
    use crate::storage::InMemoryStore;
    use crate::zone::Point;
    use crate::ValidationError;

    fn silent_detectors() -> DetectorRegistry {
        let mut detectors = DetectorRegistry::new();
        detectors.register("none", || {
            let detect = |_: &Frame| -> Result<Vec<Detection>> { Ok(Vec::new()) };
            Ok(Box::new(detect) as Box<dyn Detector>)
        });
        detectors
    }

    fn engine_with(store: Arc<InMemoryStore>) -> Result<Engine> {
        Engine::new(
            store,
            Arc::new(StreamSourceFactory::new(64, 48)),
            &silent_detectors(),
            None,
            EngineOptions::default(),
        )
    }

    fn square() -> Geometry {
        Geometry::rectangle(Point::new(0.0, 0.0), Point::new(10.0, 10.0))
    }

    #[test]
    fn registration_rejects_bad_input() -> Result<()> {
        let engine = engine_with(Arc::new(InMemoryStore::new()))?;
        let err = engine
            .register_camera("cam", "ftp://host/stream", None)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>().map(|e| e.field),
            Some("stream_url")
        );
        assert!(engine.register_camera("  ", "stub://a", None).is_err());

        engine.register_camera("a", "stub://a", None)?;
        let err = engine.register_camera("b", "stub://a", None).unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
        assert_eq!(engine.list_cameras().len(), 1);
        engine.shutdown();
        Ok(())
    }

    #[test]
    fn zone_upsert_validates_and_swaps_snapshot() -> Result<()> {
        let engine = engine_with(Arc::new(InMemoryStore::new()))?;
        let camera = engine.register_camera("a", "stub://a", None)?;

        let degenerate = Geometry::polygon(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]);
        let err = engine
            .upsert_zone(camera.id, "bad", degenerate, RuleConfig::default())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>().map(|e| e.field),
            Some("zone.points")
        );
        assert!(engine.zones(camera.id).map(|z| z.is_empty()).unwrap_or(false));

        let before = engine.zones(camera.id).ok_or_else(|| anyhow!("no zones"))?;
        let zone = engine.upsert_zone(camera.id, "door", square(), RuleConfig::default())?;
        let after = engine.zones(camera.id).ok_or_else(|| anyhow!("no zones"))?;
        assert!(before.is_empty());
        assert_eq!(after.as_slice(), std::slice::from_ref(&zone));

        engine.delete_zone(zone.id)?;
        assert!(engine.delete_zone(zone.id).is_err());
        assert!(engine.zones(camera.id).map(|z| z.is_empty()).unwrap_or(false));

        assert!(engine
            .upsert_zone(CameraId(999), "x", square(), RuleConfig::default())
            .is_err());
        engine.shutdown();
        Ok(())
    }

    #[test]
    fn removal_stops_workers_and_deletes_rows() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store.clone())?;
        let camera = engine.register_camera("a", "stub://a", None)?;
        engine.upsert_zone(camera.id, "door", square(), RuleConfig::default())?;

        engine.remove_camera(camera.id)?;
        assert!(engine.camera_status(camera.id).is_none());
        assert!(store.load_cameras()?.is_empty());
        assert!(store.load_zones(camera.id)?.is_empty());
        assert!(engine.remove_camera(camera.id).is_err());
        assert_eq!(engine.health().status, "idle");
        engine.shutdown();
        Ok(())
    }

    #[test]
    fn start_resumes_persisted_cameras_with_zones() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let camera = store.insert_camera("yard", "stub://yard", None, 5)?;
        store.upsert_zone(camera.id, "fence", &square(), &RuleConfig::default())?;

        let engine = engine_with(store)?;
        engine.start()?;
        assert_eq!(engine.list_cameras(), vec![camera.clone()]);
        assert_eq!(engine.zones(camera.id).map(|z| z.len()), Some(1));
        assert_eq!(engine.health().cameras_total, 1);
        engine.shutdown();
        Ok(())
    }

    #[test]
    fn settings_updates_are_versioned() -> Result<()> {
        let engine = engine_with(Arc::new(InMemoryStore::new()))?;
        let next = PipelineSettings {
            dedup_window_ms: 1_000,
            ..(*engine.settings()).clone()
        };
        assert_eq!(engine.update_settings(next)?, 2);
        assert_eq!(engine.settings().dedup_window_ms, 1_000);
        assert_eq!(engine.health().settings_version, 2);

        let bad = PipelineSettings {
            queue_capacity: 0,
            ..PipelineSettings::default()
        };
        assert!(engine.update_settings(bad).is_err());
        assert_eq!(engine.settings().version, 2);
        Ok(())
    }

    #[test]
    fn offline_camera_reports_error_and_last_error() -> Result<()> {
        struct Refusing;
        impl SourceFactory for Refusing {
            fn open(&self, _camera: &Camera) -> Result<Box<dyn FrameSource>> {
                Err(anyhow!("connection refused"))
            }
        }
        let engine = Engine::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(Refusing),
            &silent_detectors(),
            None,
            EngineOptions::default(),
        )?;
        let camera = engine.register_camera("down", "rtsp://10.0.0.9/live", None)?;

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let report = loop {
            let report = engine
                .camera_status(camera.id)
                .ok_or_else(|| anyhow!("camera missing"))?;
            if report.state == CameraState::Error || std::time::Instant::now() > deadline {
                break report;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(report.state, CameraState::Error);
        assert!(report
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("connection refused"));
        assert_eq!(engine.health().status, "degraded");
        engine.shutdown();
        Ok(())
    }
}
