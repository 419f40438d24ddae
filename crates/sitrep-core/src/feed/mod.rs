//! Push-based change feed.
//!
//! A backing store delivers [`FeedMessage`]s over a channel per
//! [`Subscription`]. [`FeedSubscriber`] owns one subscription, tracks its
//! [`ConnectionState`] and drains typed [`FeedEvent`]s for the reconciler.
//!
//! Inserted rows arrive without the officer join; [`RelationBackfiller`]
//! hydrates them before they reach the store.

pub mod backfill;
pub mod hub;

pub use backfill::RelationBackfiller;
pub use hub::FeedHub;

use std::fmt;
use std::sync::mpsc::{Receiver, TryRecvError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ErrorCode;
use crate::model::{FieldPatch, IncidentId, IncidentRecord, IncidentRow};
use crate::ports::ChangeFeed;

/// A row-level change notification.
///
/// `T` is the insert payload: raw [`IncidentRow`]s on the wire, hydrated
/// [`IncidentRecord`]s once the backfiller has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedEvent<T = IncidentRow> {
    Inserted(T),
    Updated { id: IncidentId, patch: FieldPatch },
    Removed(IncidentId),
}

/// Payloads that know which incident they describe.
pub trait Keyed {
    fn incident_id(&self) -> &IncidentId;
}

impl Keyed for IncidentRow {
    fn incident_id(&self) -> &IncidentId {
        &self.id
    }
}

impl Keyed for IncidentRecord {
    fn incident_id(&self) -> &IncidentId {
        &self.row.id
    }
}

impl<T> FeedEvent<T> {
    /// Transform the insert payload, passing the other variants through.
    pub fn map_inserted<U>(self, f: impl FnOnce(T) -> U) -> FeedEvent<U> {
        match self {
            Self::Inserted(payload) => FeedEvent::Inserted(f(payload)),
            Self::Updated { id, patch } => FeedEvent::Updated { id, patch },
            Self::Removed(id) => FeedEvent::Removed(id),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Inserted(_) => "inserted",
            Self::Updated { .. } => "updated",
            Self::Removed(_) => "removed",
        }
    }
}

impl<T: Keyed> FeedEvent<T> {
    #[must_use]
    pub fn id(&self) -> &IncidentId {
        match self {
            Self::Inserted(payload) => payload.incident_id(),
            Self::Updated { id, .. } | Self::Removed(id) => id,
        }
    }
}

/// What travels down a subscription channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Connectivity signal from the feed primitive.
    Status(ConnectionState),
    Change(FeedEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A live subscription. Dropping it releases the subscription with the feed.
pub struct Subscription {
    collection: String,
    receiver: Receiver<FeedMessage>,
    release: Option<ReleaseFn>,
}

impl Subscription {
    pub fn new(
        collection: impl Into<String>,
        receiver: Receiver<FeedMessage>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            collection: collection.into(),
            receiver,
            release: Some(Box::new(release)),
        }
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Non-blocking receive.
    ///
    /// # Errors
    ///
    /// `Empty` when nothing is queued, `Disconnected` once the sender side is gone.
    pub fn try_recv(&self) -> Result<FeedMessage, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Owns at most one subscription to a collection and its connection state.
#[derive(Debug)]
pub struct FeedSubscriber {
    collection: String,
    subscription: Option<Subscription>,
    state: ConnectionState,
}

impl FeedSubscriber {
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            subscription: None,
            state: ConnectionState::Disconnected,
        }
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// (Re)subscribe. Any existing subscription is released first.
    pub fn connect<F: ChangeFeed + ?Sized>(&mut self, feed: &F) -> ConnectionState {
        self.release();
        self.state = ConnectionState::Connecting;
        match feed.subscribe(&self.collection) {
            Ok(subscription) => {
                info!(collection = %self.collection, "subscribed to change feed");
                self.subscription = Some(subscription);
            }
            Err(err) => {
                warn!(
                    code = ErrorCode::FeedUnavailable.code(),
                    collection = %self.collection,
                    error = %err,
                    "subscription failed"
                );
                self.state = ConnectionState::Disconnected;
            }
        }
        self.state
    }

    /// Drain every queued change. Status signals update [`Self::state`].
    pub fn poll(&mut self) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        let Some(subscription) = &self.subscription else {
            return events;
        };

        let mut hung_up = false;
        loop {
            match subscription.try_recv() {
                Ok(FeedMessage::Change(event)) => events.push(event),
                Ok(FeedMessage::Status(state)) => {
                    if state != self.state {
                        info!(collection = %self.collection, %state, "feed connection state");
                    }
                    self.state = state;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    hung_up = true;
                    break;
                }
            }
        }

        if hung_up {
            warn!(
                code = ErrorCode::FeedUnavailable.code(),
                collection = %self.collection,
                "change feed hung up"
            );
            self.subscription = None;
            self.state = ConnectionState::Disconnected;
        }
        events
    }

    /// Drop the subscription, if any.
    pub fn release(&mut self) {
        if self.subscription.take().is_some() {
            info!(collection = %self.collection, "released change feed subscription");
        }
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, bail};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Refusing;

    impl ChangeFeed for Refusing {
        fn subscribe(&self, _collection: &str) -> Result<Subscription> {
            bail!("feed offline")
        }
    }

    #[test]
    fn dropping_subscription_runs_release() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let (_tx, rx) = std::sync::mpsc::channel();
        let sub = Subscription::new("incident_reports", rx, move || flag.store(true, Ordering::SeqCst));
        assert!(!released.load(Ordering::SeqCst));
        drop(sub);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_subscribe_is_disconnected() {
        let mut sub = FeedSubscriber::new("incident_reports");
        assert_eq!(sub.connect(&Refusing), ConnectionState::Disconnected);
        assert!(!sub.is_subscribed());
        assert!(sub.poll().is_empty());
    }

    #[test]
    fn hub_subscription_reports_connected_and_hangup() {
        let hub = FeedHub::new();
        let mut sub = FeedSubscriber::new("incident_reports");
        assert_eq!(sub.connect(&hub), ConnectionState::Connecting);

        sub.poll();
        assert_eq!(sub.state(), ConnectionState::Connected);

        hub.publish("incident_reports", &FeedEvent::Removed(IncidentId::new("a")));
        hub.disconnect_all();
        let events = sub.poll();
        assert_eq!(events, vec![FeedEvent::Removed(IncidentId::new("a"))]);
        assert_eq!(sub.state(), ConnectionState::Disconnected);
        assert!(!sub.is_subscribed());
    }

    #[test]
    fn map_inserted_keeps_other_variants() {
        let event: FeedEvent<u32> = FeedEvent::Removed(IncidentId::new("a"));
        assert_eq!(event.map_inserted(|n| n + 1), FeedEvent::<u32>::Removed(IncidentId::new("a")));
        assert_eq!(FeedEvent::Inserted(1_u32).map_inserted(|n| n + 1), FeedEvent::Inserted(2));
    }
}
