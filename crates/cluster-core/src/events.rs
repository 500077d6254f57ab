//! Membership events and the subscription bus that fans them out.
//!
//! The heartbeat service never calls application code inline. It pushes
//! [`MembershipEvent`]s into a channel; a dispatch task drains the channel
//! and calls [`EventBus::emit`].

use crate::member::Member;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Change in the set of live peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MembershipEvent {
    /// First heartbeat seen from a new identity.
    Added(Member),
    /// Member expired or announced shutdown.
    Disappeared(Member),
}

impl MembershipEvent {
    pub fn member(&self) -> &Member {
        match self {
            Self::Added(m) | Self::Disappeared(m) => m,
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(MembershipEvent) + Send + Sync>;

/// Event bus for publishing membership events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(MembershipEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: MembershipEvent) {
        // Clone the callback list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberId;

    fn added() -> MembershipEvent {
        MembershipEvent::Added(Member::new(MemberId::from_bytes([1; 16]), "10.0.0.1", 4000))
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(added());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        bus.emit(added());
        drop(sub);
        bus.emit(added());

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_callbacks_see_event_kind() {
        let bus = Arc::new(EventBus::new());
        let gone = Arc::new(AtomicUsize::new(0));
        let gone_clone = Arc::clone(&gone);

        let _sub = bus.subscribe(move |event| {
            if matches!(event, MembershipEvent::Disappeared(_)) {
                gone_clone.fetch_add(1, Ordering::Relaxed);
            }
        });

        let member = added().member().clone();
        bus.emit(MembershipEvent::Added(member.clone()));
        bus.emit(MembershipEvent::Disappeared(member));

        assert_eq!(gone.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&added()).unwrap();
        assert!(json.contains("\"type\":\"added\""));
        assert!(json.contains("\"host\":\"10.0.0.1\""));
        assert!(json.contains("\"aliveMs\":0"));
    }
}
