//! Change notifications for hosts.

use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::trace;

use satchel_sync::{EntryId, EntryKind};

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A local `add`.
    Created,
    /// A local `update`.
    Updated,
    /// A local `remove`.
    Removed,
    /// The entry changed while applying a remote state.
    Synced,
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// The entry affected.
    pub entry_id: EntryId,
    /// The entry's kind, when known.
    pub entry_kind: Option<EntryKind>,
    /// Wall-clock time the event was published.
    pub wall_time: SystemTime,
}

impl Event {
    pub(crate) fn now(kind: EventKind, entry_id: EntryId, entry_kind: Option<EntryKind>) -> Self {
        Event {
            kind,
            entry_id,
            entry_kind,
            wall_time: SystemTime::now(),
        }
    }
}

const SUBSCRIPTION_CAPACITY: usize = 128;

/// A bounded stream of [`Event`]s. Dropping the subscription detaches it;
/// the publisher prunes it on its next publish.
#[derive(Debug)]
pub struct Subscription {
    rx: flume::Receiver<Event>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the engine is closed
    /// and the queue is drained.
    pub async fn recv(&self) -> Option<Event> {
        self.rx.recv_async().await.ok()
    }

    /// Returns the next event if one is queued.
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Fans events out to subscribers over independent bounded queues.
///
/// Publishing never blocks: a subscriber whose queue is full loses the
/// incoming event, and only that subscriber does.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<flume::Sender<Event>>>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = flume::bounded(SUBSCRIPTION_CAPACITY);
        self.subscribers.write().push(tx);
        Subscription { rx }
    }

    /// Delivers `event` to every live subscriber, dropping it for any whose
    /// queue is full and pruning subscribers that went away.
    pub fn publish(&self, event: Event) {
        let mut stale = false;
        {
            let subscribers = self.subscribers.read();
            for tx in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(flume::TrySendError::Full(_)) => {
                        trace!(?event, "subscriber queue full, dropping event");
                    }
                    Err(flume::TrySendError::Disconnected(_)) => stale = true,
                }
            }
        }
        if stale {
            self.subscribers
                .write()
                .retain(|tx| !tx.is_disconnected());
        }
    }

    /// Disconnects every subscriber.
    pub fn close(&self) {
        self.subscribers.write().clear();
    }
}
