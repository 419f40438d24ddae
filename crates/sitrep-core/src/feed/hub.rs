//! In-process fan-out used by the bundled backends to implement
//! [`ChangeFeed`].

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::Result;
use tracing::debug;

use super::{ConnectionState, FeedEvent, FeedMessage, Subscription};
use crate::ports::ChangeFeed;

struct Subscriber {
    collection: String,
    sender: Sender<FeedMessage>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
    /// Last broadcast status. `None` until the first broadcast, read as
    /// connected.
    status: Option<ConnectionState>,
}

/// Delivers feed messages to every live subscription of a collection.
///
/// Cloning shares the same subscriber table.
#[derive(Clone, Default)]
pub struct FeedHub {
    inner: Arc<Mutex<HubState>>,
}

impl FeedHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. The first message it sees is the hub's current
    /// status, so a subscription opened while the feed is down starts out
    /// `Disconnected`.
    #[must_use]
    pub fn open(&self, collection: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel();

        let id = {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let current = state.status.unwrap_or(ConnectionState::Connected);
            let _ = sender.send(FeedMessage::Status(current));
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.insert(
                id,
                Subscriber {
                    collection: collection.to_string(),
                    sender,
                },
            );
            id
        };
        debug!(collection, subscriber = id, "feed subscriber registered");

        let weak: Weak<Mutex<HubState>> = Arc::downgrade(&self.inner);
        Subscription::new(collection, receiver, move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subscribers
                    .remove(&id);
            }
        })
    }

    /// Send `event` to every subscriber of `collection`. Returns the number of
    /// subscribers reached.
    pub fn publish(&self, collection: &str, event: &FeedEvent) -> usize {
        self.send(collection, &FeedMessage::Change(event.clone()))
    }

    /// Send a connectivity signal to every subscriber of every collection.
    pub fn broadcast_status(&self, status: ConnectionState) -> usize {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.status = Some(status);
        let mut dead = Vec::new();
        for (id, sub) in &state.subscribers {
            if sub.sender.send(FeedMessage::Status(status)).is_err() {
                dead.push(*id);
            }
        }
        for id in &dead {
            state.subscribers.remove(id);
        }
        state.subscribers.len()
    }

    /// Forcibly hang up every subscriber.
    pub fn disconnect_all(&self) -> usize {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = state.subscribers.len();
        state.subscribers.clear();
        debug!(dropped, "feed hub disconnected all subscribers");
        dropped
    }

    #[must_use]
    pub fn subscriber_count(&self, collection: &str) -> usize {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .subscribers
            .values()
            .filter(|sub| sub.collection == collection)
            .count()
    }

    fn send(&self, collection: &str, message: &FeedMessage) -> usize {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut reached = 0;
        let mut dead = Vec::new();
        for (id, sub) in &state.subscribers {
            if sub.collection != collection {
                continue;
            }
            if sub.sender.send(message.clone()).is_ok() {
                reached += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in &dead {
            state.subscribers.remove(id);
        }
        reached
    }
}

impl ChangeFeed for FeedHub {
    fn subscribe(&self, collection: &str) -> Result<Subscription> {
        Ok(self.open(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IncidentId;

    #[test]
    fn publish_reaches_only_matching_collection() {
        let hub = FeedHub::new();
        let incidents = hub.open("incident_reports");
        let officers = hub.open("profiles");

        let reached = hub.publish("incident_reports", &FeedEvent::Removed(IncidentId::new("a")));
        assert_eq!(reached, 1);

        assert_eq!(
            incidents.try_recv(),
            Ok(FeedMessage::Status(ConnectionState::Connected))
        );
        assert_eq!(
            incidents.try_recv(),
            Ok(FeedMessage::Change(FeedEvent::Removed(IncidentId::new("a"))))
        );
        assert_eq!(
            officers.try_recv(),
            Ok(FeedMessage::Status(ConnectionState::Connected))
        );
        assert!(officers.try_recv().is_err());
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let hub = FeedHub::new();
        let sub = hub.open("incident_reports");
        assert_eq!(hub.subscriber_count("incident_reports"), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count("incident_reports"), 0);
    }

    #[test]
    fn broadcast_status_reaches_everyone() {
        let hub = FeedHub::new();
        let a = hub.open("incident_reports");
        let b = hub.open("profiles");
        assert_eq!(hub.broadcast_status(ConnectionState::Disconnected), 2);
        let _ = a.try_recv();
        let _ = b.try_recv();
        assert_eq!(
            a.try_recv(),
            Ok(FeedMessage::Status(ConnectionState::Disconnected))
        );
        assert_eq!(
            b.try_recv(),
            Ok(FeedMessage::Status(ConnectionState::Disconnected))
        );
    }

    #[test]
    fn late_subscriber_sees_the_current_status() {
        let hub = FeedHub::new();
        hub.broadcast_status(ConnectionState::Disconnected);
        let late = hub.open("incident_reports");
        assert_eq!(
            late.try_recv(),
            Ok(FeedMessage::Status(ConnectionState::Disconnected))
        );

        hub.broadcast_status(ConnectionState::Connected);
        assert_eq!(
            late.try_recv(),
            Ok(FeedMessage::Status(ConnectionState::Connected))
        );
        let fresh = hub.open("incident_reports");
        assert_eq!(
            fresh.try_recv(),
            Ok(FeedMessage::Status(ConnectionState::Connected))
        );
    }

    #[test]
    fn disconnect_all_clears_table() {
        let hub = FeedHub::new();
        let _a = hub.open("incident_reports");
        let _b = hub.open("incident_reports");
        assert_eq!(hub.disconnect_all(), 2);
        assert_eq!(hub.subscriber_count("incident_reports"), 0);
    }
}
