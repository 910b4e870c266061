//! Frames and the per-camera frame queue.
//!
//! - `Frame`: one decoded image plus capture metadata. Owned by exactly one
//!   queue slot until the inference worker takes it; dropped after inference.
//! - `FrameQueue`: bounded hand-off between capture and inference.
//!
//! The queue is the backpressure contract of the pipeline: capture never
//! blocks, occupancy never exceeds capacity, and inference always receives the
//! most recent frame available when it asks.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::CameraId;

/// Default frame queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Decoded frame. Not `Clone`: a frame moves from source to queue to detector.
pub struct Frame {
    pub camera_id: CameraId,
    /// Monotonically increasing per camera, across reconnects.
    pub seq: u64,
    /// Wall-clock capture time (ms since epoch).
    pub captured_at_ms: u64,
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(
        camera_id: CameraId,
        seq: u64,
        captured_at_ms: u64,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Self {
        Self {
            camera_id,
            seq,
            captured_at_ms,
            width,
            height,
            data,
        }
    }

    /// Packed RGB pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Content-addressed reference recorded on events produced from this frame.
    ///
    /// The image itself is not written anywhere.
    pub fn snapshot_ref(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.camera_id.0.to_le_bytes());
        hasher.update(self.seq.to_le_bytes());
        hasher.update(&self.data);
        let digest = hasher.finalize();
        format!(
            "snapshot:{}:{}:{}",
            self.camera_id,
            self.seq,
            hex::encode(&digest[..8])
        )
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("seq", &self.seq)
            .field("captured_at_ms", &self.captured_at_ms)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameQueue
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest frame was evicted to make room.
    DroppedOldest,
    /// Queue has been closed; the frame was discarded.
    Closed,
}

struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Bounded drop-oldest queue between a camera's capture and inference workers.
///
/// - `push` never blocks. When full, the oldest frame is evicted.
/// - `pop` blocks until a frame arrives or the queue is closed. It returns the
///   newest frame and discards the older ones, which are stale by definition.
/// - `close` wakes any waiter and discards everything still queued.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
    /// Mirror of `frames.len()`, readable without the lock.
    depth: AtomicUsize,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
            depth: AtomicUsize::new(0),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue state stays consistent across a panicking holder: every
        // mutation is a single VecDeque call.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut state = self.lock();
        if state.closed {
            return PushOutcome::Closed;
        }
        let mut outcome = PushOutcome::Queued;
        while state.frames.len() >= self.capacity {
            state.frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            outcome = PushOutcome::DroppedOldest;
        }
        state.frames.push_back(frame);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.depth.store(state.frames.len(), Ordering::Relaxed);
        drop(state);
        self.ready.notify_one();
        outcome
    }

    /// Block until a frame is available. Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<Frame> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(frame) = self.take_newest(&mut state) {
                return Some(frame);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like `pop`, but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(frame) = self.take_newest(&mut state) {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    fn take_newest(&self, state: &mut QueueState) -> Option<Frame> {
        let newest = state.frames.pop_back()?;
        let stale = state.frames.len() as u64;
        if stale > 0 {
            state.frames.clear();
            self.dropped.fetch_add(stale, Ordering::Relaxed);
        }
        self.depth.store(0, Ordering::Relaxed);
        Some(newest)
    }

    /// Close the queue, discard queued frames and wake the consumer.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.frames.clear();
        self.depth.store(0, Ordering::Relaxed);
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Current occupancy, sampled without taking the lock.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted on overflow or discarded as stale at dequeue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
