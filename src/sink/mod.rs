//! Event sink.
//!
//! Inference workers and supervisors hand accepted events and camera status
//! changes to a single sink thread through a bounded channel. The sink
//! persists each event at most once and publishes it best-effort. Nothing on
//! this path blocks the ingestion pipeline: a full channel drops the message
//! with a warning, and persistence or notification failures are logged and
//! counted, never retried.

mod mqtt;

pub use mqtt::MqttNotifier;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::detect::ObjectClass;
use crate::storage::Store;
use crate::supervisor::{CameraState, CameraStatus};
use crate::{CameraId, CandidateEvent, EventId, EventStatus, Priority, RuleType, ZoneId};

pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// Outbound notification channel.
pub trait Notifier: Send + Sync {
    /// Must not block on the network.
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;
}

pub enum SinkMessage {
    Event(CandidateEvent),
    Status {
        camera_id: CameraId,
        status: CameraStatus,
    },
    Shutdown,
}

#[derive(Debug, Default)]
pub struct SinkStats {
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    dropped: AtomicU64,
}

impl SinkStats {
    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Messages rejected because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer side of the sink channel. Cheap to clone.
#[derive(Clone)]
pub struct SinkHandle {
    tx: Sender<SinkMessage>,
    stats: Arc<SinkStats>,
}

impl SinkHandle {
    fn channel(capacity: usize) -> (Self, Receiver<SinkMessage>) {
        let (tx, rx) = bounded(capacity.max(1));
        let handle = Self {
            tx,
            stats: Arc::new(SinkStats::default()),
        };
        (handle, rx)
    }

    /// A handle with no sink behind it; every submission is discarded.
    pub fn detached() -> Self {
        Self::channel(1).0
    }

    /// Returns false when the event was not queued.
    pub fn submit_event(&self, candidate: CandidateEvent) -> bool {
        let camera_id = candidate.camera_id;
        self.offer(SinkMessage::Event(candidate), camera_id, "event")
    }

    pub fn submit_status(&self, camera_id: CameraId, status: &CameraStatus) -> bool {
        let message = SinkMessage::Status {
            camera_id,
            status: status.clone(),
        };
        self.offer(message, camera_id, "status")
    }

    fn offer(&self, message: SinkMessage, camera_id: CameraId, kind: &str) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("camera {camera_id}: sink queue full, {kind} dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("camera {camera_id}: sink closed, {kind} discarded");
                false
            }
        }
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }
}

/// Owns the sink thread.
pub struct EventSink {
    handle: SinkHandle,
    worker: Option<JoinHandle<()>>,
}

impl EventSink {
    pub fn spawn(
        store: Arc<dyn Store>,
        notifier: Option<Arc<dyn Notifier>>,
        topic_prefix: &str,
        capacity: usize,
    ) -> Result<Self> {
        let (handle, rx) = SinkHandle::channel(capacity);
        let worker = SinkWorker {
            store,
            notifier,
            topics: Topics::new(topic_prefix),
            stats: Arc::clone(&handle.stats),
        };
        let thread = std::thread::Builder::new()
            .name("event-sink".to_string())
            .spawn(move || worker.run(rx))
            .context("spawn event sink thread")?;
        Ok(Self {
            handle,
            worker: Some(thread),
        })
    }

    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> &SinkStats {
        self.handle.stats()
    }

    /// Drain what is already queued, then stop the thread.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if self
            .handle
            .tx
            .send_timeout(SinkMessage::Shutdown, Duration::from_secs(5))
            .is_err()
        {
            log::warn!("event sink did not accept shutdown; detaching");
            return;
        }
        if worker.join().is_err() {
            log::error!("event sink thread panicked");
        }
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// -------------------- Worker --------------------

struct Topics {
    prefix: String,
}

impl Topics {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    fn event(&self, camera_id: CameraId, rule_type: RuleType) -> String {
        format!("{}/events/{}/{}", self.prefix, camera_id, rule_type)
    }

    fn status(&self, camera_id: CameraId) -> String {
        format!("{}/status/{}", self.prefix, camera_id)
    }
}

#[derive(Serialize)]
struct EventPayload<'a> {
    /// Null when persistence failed.
    event_id: Option<EventId>,
    camera_id: CameraId,
    zone_id: ZoneId,
    timestamp_ms: u64,
    rule_type: RuleType,
    object_type: ObjectClass,
    confidence: f32,
    priority: Priority,
    status: EventStatus,
    snapshot_ref: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dwell_ms: Option<u64>,
}

#[derive(Serialize)]
struct StatusPayload<'a> {
    camera_id: CameraId,
    state: CameraState,
    last_error: Option<&'a str>,
}

struct SinkWorker {
    store: Arc<dyn Store>,
    notifier: Option<Arc<dyn Notifier>>,
    topics: Topics,
    stats: Arc<SinkStats>,
}

impl SinkWorker {
    fn run(self, rx: Receiver<SinkMessage>) {
        log::debug!("event sink started");
        for message in rx.iter() {
            match message {
                SinkMessage::Event(candidate) => self.handle_event(&candidate),
                SinkMessage::Status { camera_id, status } => {
                    self.handle_status(camera_id, &status)
                }
                SinkMessage::Shutdown => break,
            }
        }
        log::debug!("event sink stopped");
    }

    fn handle_event(&self, candidate: &CandidateEvent) {
        let event_id = match self.store.save_event(candidate) {
            Ok(id) => {
                self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "camera {}: event {} {} in zone {} ({} {:.2}, {})",
                    candidate.camera_id,
                    id,
                    candidate.rule_type,
                    candidate.zone_id,
                    candidate.object_type,
                    candidate.confidence,
                    candidate.priority.as_str()
                );
                Some(id)
            }
            Err(err) => {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "camera {}: failed to persist {} event: {err:#}",
                    candidate.camera_id,
                    candidate.rule_type
                );
                None
            }
        };

        let payload = EventPayload {
            event_id,
            camera_id: candidate.camera_id,
            zone_id: candidate.zone_id,
            timestamp_ms: candidate.detected_at_ms,
            rule_type: candidate.rule_type,
            object_type: candidate.object_type,
            confidence: candidate.confidence,
            priority: candidate.priority,
            status: EventStatus::New,
            snapshot_ref: &candidate.snapshot_ref,
            dwell_ms: candidate.dwell_ms,
        };
        let topic = self.topics.event(candidate.camera_id, candidate.rule_type);
        self.publish(&topic, &payload, false);
    }

    fn handle_status(&self, camera_id: CameraId, status: &CameraStatus) {
        if let Err(err) = self.store.update_camera_status(camera_id, status) {
            log::warn!("camera {camera_id}: failed to persist status: {err:#}");
        }
        let payload = StatusPayload {
            camera_id,
            state: status.state,
            last_error: status.last_error.as_deref(),
        };
        self.publish(&self.topics.status(camera_id), &payload, true);
    }

    fn publish<T: Serialize>(&self, topic: &str, payload: &T, retain: bool) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let result = serde_json::to_vec(payload)
            .context("serialize payload")
            .and_then(|bytes| notifier.publish(topic, &bytes, retain));
        match result {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("publish to {topic} failed: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::storage::InMemoryStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        published: Mutex<Vec<(String, serde_json::Value, bool)>>,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
            if self.fail {
                anyhow::bail!("broker unreachable");
            }
            let value = serde_json::from_slice(payload)?;
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), value, retain));
            Ok(())
        }
    }

    fn candidate(camera_id: CameraId) -> CandidateEvent {
        CandidateEvent {
            camera_id,
            zone_id: ZoneId(4),
            rule_type: RuleType::Intrusion,
            object_type: ObjectClass::Person,
            confidence: 0.5,
            detected_at_ms: 1_000,
            snapshot_ref: "snapshot:1:1:ab".to_string(),
            priority: Priority::High,
            dwell_ms: None,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        }
    }

    #[test]
    fn events_are_persisted_then_published() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let camera = store.insert_camera("gate", "stub://gate", None, 5)?;
        let notifier = Arc::new(RecordingNotifier::default());
        let mut sink = EventSink::spawn(
            store.clone(),
            Some(notifier.clone() as Arc<dyn Notifier>),
            "site/",
            8,
        )?;
        assert!(sink.handle().submit_event(candidate(camera.id)));
        sink.shutdown();

        assert_eq!(store.event_count(), 1);
        assert_eq!(sink.stats().persisted(), 1);
        let published = notifier.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (topic, payload, retain) = &published[0];
        assert_eq!(topic, &format!("site/events/{}/intrusion", camera.id));
        assert!(!retain);
        assert_eq!(payload["event_id"], 1);
        assert_eq!(payload["priority"], "high");
        assert_eq!(payload["status"], "new");
        assert_eq!(payload["snapshot_ref"], "snapshot:1:1:ab");
        Ok(())
    }

    #[test]
    fn persistence_failure_still_notifies_without_id() -> Result<()> {
        let store = Arc::new(InMemoryStore::rejecting_events());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut sink = EventSink::spawn(
            store.clone(),
            Some(notifier.clone() as Arc<dyn Notifier>),
            "site",
            8,
        )?;
        sink.handle().submit_event(candidate(CameraId(1)));
        sink.shutdown();

        assert_eq!(sink.stats().persist_failures(), 1);
        let published = notifier.published.lock().unwrap();
        assert!(published[0].1["event_id"].is_null());
        Ok(())
    }

    #[test]
    fn notifier_failures_are_counted_not_fatal() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        });
        let mut sink = EventSink::spawn(store.clone(), Some(notifier as Arc<dyn Notifier>), "s", 8)?;
        let handle = sink.handle();
        handle.submit_event(candidate(CameraId(1)));
        handle.submit_event(candidate(CameraId(1)));
        sink.shutdown();
        assert_eq!(sink.stats().publish_failures(), 2);
        assert_eq!(store.event_count(), 2);
        Ok(())
    }

    #[test]
    fn status_changes_reach_store_and_retained_topic() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let camera = store.insert_camera("dock", "stub://dock", None, 5)?;
        let notifier = Arc::new(RecordingNotifier::default());
        let mut sink = EventSink::spawn(
            store.clone(),
            Some(notifier.clone() as Arc<dyn Notifier>),
            "site",
            8,
        )?;
        let status = CameraStatus {
            state: CameraState::Error,
            consecutive_failures: 1,
            last_error: Some("connection refused".to_string()),
            last_frame_at_ms: None,
        };
        sink.handle().submit_status(camera.id, &status);
        sink.shutdown();

        assert_eq!(store.camera_status(camera.id), Some(status));
        let published = notifier.published.lock().unwrap();
        let (topic, payload, retain) = &published[0];
        assert_eq!(topic, &format!("site/status/{}", camera.id));
        assert!(retain);
        assert_eq!(payload["state"], "error");
        assert_eq!(payload["last_error"], "connection refused");
        Ok(())
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (handle, _rx) = SinkHandle::channel(1);
        assert!(handle.submit_event(candidate(CameraId(1))));
        assert!(!handle.submit_event(candidate(CameraId(1))));
        assert_eq!(handle.stats().dropped(), 1);
    }

    #[test]
    fn detached_handle_discards_silently() {
        let handle = SinkHandle::detached();
        assert!(!handle.submit_status(CameraId(1), &CameraStatus::default()));
        assert_eq!(handle.stats().dropped(), 0);
    }
}
