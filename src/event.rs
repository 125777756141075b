//! Session event union and the multi-subscriber event bus

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::warn;

use crate::error::Error;
use crate::media::MediaStream;
use crate::signal::Signal;

/// Notification emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A signaling message that must be delivered to the remote peer
    Signal(Signal),

    /// Payload received over the data channel
    Data(Bytes),

    /// A remote media stream became available
    Stream(MediaStream),

    /// Transport is connected and the data channel is open
    Connect,

    /// Session finished tearing down; emitted exactly once
    Close,

    /// A failure surfaced asynchronously; always followed by `Close` when
    /// raised from teardown
    Error(Arc<Error>),
}

impl SessionEvent {
    /// The subscription kind this event is delivered under
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Signal(_) => EventKind::Signal,
            SessionEvent::Data(_) => EventKind::Data,
            SessionEvent::Stream(_) => EventKind::Stream,
            SessionEvent::Connect => EventKind::Connect,
            SessionEvent::Close => EventKind::Close,
            SessionEvent::Error(_) => EventKind::Error,
        }
    }
}

/// Discriminant-only mirror of [`SessionEvent`], used for subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Outgoing signaling messages
    Signal,
    /// Incoming data channel payloads
    Data,
    /// Incoming remote media streams
    Stream,
    /// Connection established
    Connect,
    /// Session closed
    Close,
    /// Asynchronous failures
    Error,
}

/// Handle returned by `on`/`once`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

pub(crate) type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    once: bool,
    callback: EventCallback,
}

/// Ordered multi-subscriber callback registry
///
/// Delivery order is subscription order. Emission snapshots the current
/// subscriber set, so unsubscribing mid-delivery neither skips nor
/// double-invokes the remaining subscribers. A panicking subscriber is
/// logged and never aborts delivery to the rest.
pub(crate) struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(
        &self,
        kind: EventKind,
        once: bool,
        callback: EventCallback,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.subscribers.lock().unwrap();
        map.entry(kind).or_default().push(Subscriber {
            id,
            once,
            callback,
        });
        SubscriptionId(id)
    }

    /// Remove a subscriber; returns false if the id was not registered
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut map = self.subscribers.lock().unwrap();
        for subs in map.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id.0) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    pub(crate) fn has_subscribers(&self, kind: EventKind) -> bool {
        self.subscribers
            .lock()
            .unwrap()
            .get(&kind)
            .is_some_and(|subs| !subs.is_empty())
    }

    /// Deliver `event` to every current subscriber of its kind
    pub(crate) fn emit(&self, event: &SessionEvent) {
        let snapshot: Vec<EventCallback> = {
            let mut map = self.subscribers.lock().unwrap();
            match map.get_mut(&event.kind()) {
                Some(subs) => {
                    let callbacks = subs.iter().map(|s| Arc::clone(&s.callback)).collect();
                    // once-subscribers are consumed by this delivery
                    subs.retain(|s| !s.once);
                    callbacks
                }
                None => return,
            }
        };

        for callback in snapshot {
            Self::invoke(&callback, event);
        }
    }

    /// Deliver `event` to a single subscriber by id, consuming it if it was
    /// registered with `once`. Used for late-subscriber catch-up.
    pub(crate) fn deliver_to(&self, id: SubscriptionId, event: &SessionEvent) {
        let callback = {
            let mut map = self.subscribers.lock().unwrap();
            let Some(subs) = map.get_mut(&event.kind()) else {
                return;
            };
            let Some(pos) = subs.iter().position(|s| s.id == id.0) else {
                return;
            };
            if subs[pos].once {
                subs.remove(pos).callback
            } else {
                Arc::clone(&subs[pos].callback)
            }
        };
        Self::invoke(&callback, event);
    }

    fn invoke(callback: &EventCallback, event: &SessionEvent) {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            warn!(kind = ?event.kind(), "event subscriber panicked; continuing delivery");
        }
    }
}
