// --- Lifecycle events ------------------------------------------------------
//
// Per-owner ring buffers of state transitions and transcoder diagnostics.
// The UI polls `tail`; the WebSocket endpoint subscribes to the broadcast
// side. Both see the same sequence numbers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::media::OwnerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Started,
    Stopped,
    Diagnostic,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct LifecycleEvent {
    /// Engine-wide, strictly increasing.
    pub seq: u64,
    pub timestamp: String,
    pub timestamp_ms: i64,
    pub owner: OwnerId,
    pub kind: EventKind,
    pub message: String,
}

struct SinkInner {
    capacity: usize,
    buffers: Mutex<HashMap<OwnerId, VecDeque<LifecycleEvent>>>,
    next_seq: AtomicU64,
    live: broadcast::Sender<LifecycleEvent>,
}

#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (live, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SinkInner {
                capacity,
                buffers: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                live,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn append(&self, owner: OwnerId, kind: EventKind, message: impl Into<String>) -> LifecycleEvent {
        let mut buffers = self
            .inner
            .buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Sequence and timestamp are taken under the lock so buffer order is
        // chronological order.
        let now = OffsetDateTime::now_utc();
        let event = LifecycleEvent {
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            timestamp: now.format(&Rfc3339).unwrap_or_default(),
            timestamp_ms: (now.unix_timestamp_nanos() / 1_000_000) as i64,
            owner,
            kind,
            message: message.into(),
        };

        let buf = buffers
            .entry(owner)
            .or_insert_with(|| VecDeque::with_capacity(self.inner.capacity));
        if buf.len() >= self.inner.capacity {
            buf.pop_front();
        }
        buf.push_back(event.clone());
        drop(buffers);

        // No subscribers is the normal case.
        let _ = self.inner.live.send(event.clone());
        event
    }

    /// The newest `limit` events for `owner`, oldest first.
    pub fn tail(&self, owner: OwnerId, limit: usize) -> Vec<LifecycleEvent> {
        self.tail_after(owner, 0, limit)
    }

    /// Like `tail`, restricted to events with `seq > after`. Lets a polling
    /// client ask only for what it hasn't seen.
    pub fn tail_after(&self, owner: OwnerId, after: u64, limit: usize) -> Vec<LifecycleEvent> {
        let buffers = self
            .inner
            .buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(buf) = buffers.get(&owner) else {
            return Vec::new();
        };
        let fresh: Vec<&LifecycleEvent> = buf.iter().filter(|e| e.seq > after).collect();
        let skip = fresh.len().saturating_sub(limit);
        fresh.into_iter().skip(skip).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.live.subscribe()
    }
}
