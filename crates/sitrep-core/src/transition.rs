//! Operator status transitions and timed auto-archival.
//!
//! A transition is applied to the store optimistically, then written. A
//! failed write abandons the optimistic overlay and asks the caller to
//! re-synchronize from the query executor; nothing is rolled back locally.
//!
//! Confirming `RESOLVED` schedules `COMPLETED` after the configured delay.
//! The schedule is a set of deadlines checked by the view's `tick`.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::error::ErrorCode;
use crate::feed::FeedEvent;
use crate::model::{FieldPatch, IncidentId, IncidentRecord, Status};
use crate::reconcile::{IncidentStore, TxnId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("transition target is empty")]
    EmptyTarget,
    #[error("unknown status '{0}'")]
    UnknownStatus(String),
}

impl TransitionError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyTarget => ErrorCode::EmptyTransitionTarget,
            Self::UnknownStatus(_) => ErrorCode::InvalidStatus,
        }
    }
}

/// Validate an operator-supplied target status.
///
/// Only emptiness and membership are checked; any status may follow any
/// other.
///
/// # Errors
///
/// [`TransitionError::EmptyTarget`] for blank input,
/// [`TransitionError::UnknownStatus`] for anything else unrecognized.
pub fn parse_target(raw: &str) -> Result<Status, TransitionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TransitionError::EmptyTarget);
    }
    trimmed
        .parse()
        .map_err(|_| TransitionError::UnknownStatus(trimmed.to_string()))
}

/// A transition applied locally whose write has not completed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransition {
    pub id: IncidentId,
    pub target: Status,
    /// `None` when the record was not loaded, so nothing was overlaid.
    pub txn: Option<TxnId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Confirmed { archival_scheduled: bool },
    /// The write failed; the view must be re-read from the store.
    Resync,
}

/// Pending auto-archival deadlines, one per incident.
#[derive(Debug, Clone, Default)]
pub struct ArchiveSchedule {
    due: BTreeMap<IncidentId, i64>,
}

impl ArchiveSchedule {
    /// Schedule unless a deadline already exists. Returns whether one was added.
    pub fn schedule(&mut self, id: &IncidentId, due_ms: i64) -> bool {
        if self.due.contains_key(id) {
            return false;
        }
        self.due.insert(id.clone(), due_ms);
        true
    }

    pub fn cancel(&mut self, id: &IncidentId) -> bool {
        self.due.remove(id).is_some()
    }

    #[must_use]
    pub fn deadline(&self, id: &IncidentId) -> Option<i64> {
        self.due.get(id).copied()
    }

    /// Remove and return every id whose deadline is at or before `now_ms`.
    pub fn take_due(&mut self, now_ms: i64) -> Vec<IncidentId> {
        let ready: Vec<IncidentId> = self
            .due
            .iter()
            .filter(|(_, due)| **due <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ready {
            self.due.remove(id);
        }
        ready
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.due.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }

    pub fn clear(&mut self) {
        self.due.clear();
    }
}

#[derive(Debug, Clone)]
pub struct TransitionEngine {
    delay_ms: i64,
    follow_feed: bool,
    schedule: ArchiveSchedule,
}

impl TransitionEngine {
    #[must_use]
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            delay_ms: i64::try_from(config.delay_ms).unwrap_or(i64::MAX),
            follow_feed: config.follow_feed,
            schedule: ArchiveSchedule::default(),
        }
    }

    #[must_use]
    pub const fn schedule(&self) -> &ArchiveSchedule {
        &self.schedule
    }

    /// Apply the optimistic half. Any pending archival for the record is
    /// cancelled: the operator's newer decision wins.
    pub fn begin(&mut self, store: &mut IncidentStore, id: &IncidentId, target: Status) -> PendingTransition {
        if self.schedule.cancel(id) {
            debug!(%id, "archival cancelled by newer transition");
        }
        let txn = store.apply_optimistic_mutation(id, &FieldPatch::status(target));
        PendingTransition {
            id: id.clone(),
            target,
            txn,
        }
    }

    /// Settle a transition with the write's result.
    pub fn complete(
        &mut self,
        store: &mut IncidentStore,
        pending: &PendingTransition,
        result: anyhow::Result<()>,
        now_ms: i64,
    ) -> TransitionOutcome {
        match result {
            Ok(()) => {
                if let Some(txn) = pending.txn {
                    store.confirm(&pending.id, txn);
                }
                let archival_scheduled = pending.target == Status::Resolved
                    && self
                        .schedule
                        .schedule(&pending.id, now_ms.saturating_add(self.delay_ms));
                info!(
                    id = %pending.id,
                    status = %pending.target,
                    archival_scheduled,
                    "status transition confirmed"
                );
                TransitionOutcome::Confirmed { archival_scheduled }
            }
            Err(err) => {
                if let Some(txn) = pending.txn {
                    store.abandon(&pending.id, txn);
                }
                warn!(
                    code = ErrorCode::StoreWriteFailed.code(),
                    id = %pending.id,
                    status = %pending.target,
                    error = %err,
                    "status write failed; re-synchronizing"
                );
                TransitionOutcome::Resync
            }
        }
    }

    /// Keep the schedule in step with statuses arriving over the feed.
    pub fn observe_feed(&mut self, store: &IncidentStore, event: &FeedEvent<IncidentRecord>, now_ms: i64) {
        let (id, status) = match event {
            FeedEvent::Updated { id, patch } => match patch.status {
                Some(status) => (id, status),
                None => return,
            },
            FeedEvent::Inserted(record) => (record.id(), record.status()),
            FeedEvent::Removed(id) => {
                self.schedule.cancel(id);
                return;
            }
        };

        if status != Status::Resolved {
            if self.schedule.cancel(id) {
                debug!(%id, %status, "archival cancelled by feed status");
            }
            return;
        }
        let is_update = matches!(event, FeedEvent::Updated { .. });
        if is_update
            && self.follow_feed
            && store.contains(id)
            && self.schedule.schedule(id, now_ms.saturating_add(self.delay_ms))
        {
            debug!(%id, "archival scheduled from feed resolve");
        }
    }

    /// Deadlines that have passed and still apply: the record is loaded and
    /// still `RESOLVED`. Stale deadlines are dropped.
    pub fn take_due(&mut self, store: &IncidentStore, now_ms: i64) -> Vec<IncidentId> {
        self.schedule
            .take_due(now_ms)
            .into_iter()
            .filter(|id| {
                let live = store.get(id).is_some_and(|r| r.status() == Status::Resolved);
                if !live {
                    debug!(%id, "archival deadline no longer applies");
                }
                live
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.schedule.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeoPoint, IncidentRow, Reporter, micros_to_utc};
    use crate::query::{PageRequest, ViewFilter};
    use anyhow::anyhow;

    fn record(id: &str, status: Status) -> IncidentRecord {
        IncidentRow {
            id: IncidentId::new(id),
            category: "Fire".to_string(),
            severity: 4,
            position: GeoPoint::new(0.0, 0.0),
            victim_count: 1,
            reported_at: micros_to_utc(10_000_000).expect("valid"),
            status,
            evidence_ref: None,
            reporter_id: None,
        }
        .hydrate(Reporter::placeholder("Unknown Officer"))
    }

    fn setup(status: Status) -> (IncidentStore, TransitionEngine) {
        let mut store = IncidentStore::new(ViewFilter::from_request(&PageRequest::default()));
        store.apply_bulk(vec![record("a", status)], 1);
        (store, TransitionEngine::new(&ArchiveConfig::default()))
    }

    #[test]
    fn target_validation() {
        assert_eq!(parse_target("  "), Err(TransitionError::EmptyTarget));
        assert_eq!(parse_target("DISPATCHED"), Ok(Status::Dispatched));
        assert_eq!(
            parse_target("teleported"),
            Err(TransitionError::UnknownStatus("teleported".to_string()))
        );
        assert_eq!(TransitionError::EmptyTarget.code(), ErrorCode::EmptyTransitionTarget);
    }

    #[test]
    fn backward_transition_is_allowed() {
        let (mut store, mut engine) = setup(Status::OnSite);
        let id = IncidentId::new("a");
        let pending = engine.begin(&mut store, &id, Status::Pending);
        assert_eq!(store.get(&id).map(IncidentRecord::status), Some(Status::Pending));
        assert_eq!(
            engine.complete(&mut store, &pending, Ok(()), 0),
            TransitionOutcome::Confirmed { archival_scheduled: false }
        );
    }

    #[test]
    fn confirmed_resolve_schedules_archival() {
        let (mut store, mut engine) = setup(Status::OnSite);
        let id = IncidentId::new("a");
        let pending = engine.begin(&mut store, &id, Status::Resolved);
        let outcome = engine.complete(&mut store, &pending, Ok(()), 1_000);
        assert_eq!(outcome, TransitionOutcome::Confirmed { archival_scheduled: true });
        assert_eq!(engine.schedule().deadline(&id), Some(3_000));
        assert!(engine.take_due(&store, 2_999).is_empty());
        assert_eq!(engine.take_due(&store, 3_000), vec![id]);
    }

    #[test]
    fn failed_write_requests_resync_without_rollback() {
        let (mut store, mut engine) = setup(Status::Pending);
        let id = IncidentId::new("a");
        let pending = engine.begin(&mut store, &id, Status::Dispatched);
        let outcome = engine.complete(&mut store, &pending, Err(anyhow!("503")), 0);
        assert_eq!(outcome, TransitionOutcome::Resync);
        assert_eq!(store.get(&id).map(IncidentRecord::status), Some(Status::Dispatched));
        assert_eq!(store.pending_status(&id), None);
    }

    #[test]
    fn newer_transition_cancels_archival() {
        let (mut store, mut engine) = setup(Status::OnSite);
        let id = IncidentId::new("a");
        let pending = engine.begin(&mut store, &id, Status::Resolved);
        engine.complete(&mut store, &pending, Ok(()), 0);
        engine.begin(&mut store, &id, Status::OnSite);
        assert!(engine.schedule().is_empty());
    }

    #[test]
    fn feed_resolve_schedules_and_feed_change_cancels() {
        let (mut store, mut engine) = setup(Status::OnSite);
        let id = IncidentId::new("a");
        let resolve = FeedEvent::Updated {
            id: id.clone(),
            patch: FieldPatch::status(Status::Resolved),
        };
        store.apply_feed_event(resolve.clone());
        engine.observe_feed(&store, &resolve, 500);
        assert_eq!(engine.schedule().deadline(&id), Some(2_500));

        let reopen = FeedEvent::Updated {
            id: id.clone(),
            patch: FieldPatch::status(Status::OnSite),
        };
        store.apply_feed_event(reopen.clone());
        engine.observe_feed(&store, &reopen, 600);
        assert!(engine.schedule().is_empty());
    }

    #[test]
    fn feed_following_can_be_disabled() {
        let (mut store, _) = setup(Status::OnSite);
        let mut engine = TransitionEngine::new(&ArchiveConfig {
            delay_ms: 2_000,
            follow_feed: false,
        });
        let resolve = FeedEvent::Updated {
            id: IncidentId::new("a"),
            patch: FieldPatch::status(Status::Resolved),
        };
        store.apply_feed_event(resolve.clone());
        engine.observe_feed(&store, &resolve, 0);
        assert!(engine.schedule().is_empty());
    }

    #[test]
    fn stale_deadline_is_ignored() {
        let (mut store, mut engine) = setup(Status::OnSite);
        let id = IncidentId::new("a");
        let pending = engine.begin(&mut store, &id, Status::Resolved);
        engine.complete(&mut store, &pending, Ok(()), 0);
        // Another desk reopens it without this engine seeing a feed event.
        store.apply_bulk(vec![record("a", Status::OnSite)], 1);
        assert!(engine.take_due(&store, 10_000).is_empty());
        assert!(engine.schedule().is_empty());
    }
}
