//! The incident store: one consistent, ordered, filtered set of records fed
//! by bulk reads, change-feed events and optimistic mutations.
//!
//! # Ordering of sources
//!
//! Every feed event gets a logical sequence number. A bulk read is bracketed
//! by [`IncidentStore::begin_read`] and [`IncidentStore::apply_bulk_read`];
//! feed events that arrive in between are journaled and replayed on top of
//! the read's result, so a read never erases a change it did not see.
//!
//! Optimistic status changes are kept as a per-record overlay keyed by
//! transaction id. The overlay is re-applied after every bulk read until a
//! status-bearing feed event for that record arrives, the transaction is
//! abandoned, or a read issued after confirmation lands.
//!
//! # Page window
//!
//! A store built [`IncidentStore::with_window`] holds one page of the view.
//! Live inserts that sort past the page are counted in `total` and kept
//! aside; an insert into a full page pushes the last record out. Changes the
//! store cannot place without the rows it never loaded (an insert ahead of a
//! later page, a record leaving a page that has rows after it) mark the store
//! stale, and the owner re-reads.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::debug;

use crate::feed::FeedEvent;
use crate::model::{FieldPatch, IncidentId, IncidentRecord, OrderKey, Status};
use crate::query::{PageWindow, ViewFilter};

/// Identifies one optimistic mutation.
pub type TxnId = u64;

/// Handle for an in-flight bulk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadToken {
    id: u64,
    epoch: u64,
    issued_at_seq: u64,
}

/// Effect of applying one change to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing visible changed (duplicate, no-op patch, or filtered out).
    Unchanged,
    Inserted,
    Updated,
    /// The record left the store (deleted or no longer matches the filter).
    Removed,
    /// An update for an id the store has never materialized.
    Unknown,
}

impl ApplyOutcome {
    #[must_use]
    pub const fn is_visible_change(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Removed)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingStatus {
    txn: TxnId,
    status: Status,
    /// Set on confirmation: reads issued from this id onward reflect the write.
    settled_from_read: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct IncidentStore {
    filter: ViewFilter,
    window: PageWindow,
    records: HashMap<IncidentId, IncidentRecord>,
    order: BTreeSet<OrderKey>,
    /// Counted in `total` but outside the loaded page.
    unloaded: HashMap<IncidentId, IncidentRecord>,
    stale: bool,
    replaying: bool,
    total: u64,
    revision: u64,
    epoch: u64,
    feed_seq: u64,
    journal: VecDeque<(u64, FeedEvent<IncidentRecord>)>,
    open_reads: BTreeMap<u64, u64>,
    next_read: u64,
    last_applied_read: Option<u64>,
    pending: HashMap<IncidentId, PendingStatus>,
    next_txn: TxnId,
}

impl IncidentStore {
    #[must_use]
    pub fn new(filter: ViewFilter) -> Self {
        Self {
            filter,
            next_txn: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_window(mut self, window: PageWindow) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub const fn filter(&self) -> &ViewFilter {
        &self.filter
    }

    /// Move to another page. Takes effect with the next bulk read.
    pub fn set_window(&mut self, window: PageWindow) {
        self.window = window;
        self.unloaded.clear();
    }

    /// Whether the loaded page may no longer match the source. Clears the
    /// flag.
    pub fn take_stale(&mut self) -> bool {
        std::mem::take(&mut self.stale)
    }

    /// Swap the predicate. Contents are dropped and in-flight reads are
    /// invalidated; the caller is expected to refresh.
    pub fn set_filter(&mut self, filter: ViewFilter) {
        self.filter = filter;
        self.records.clear();
        self.order.clear();
        self.unloaded.clear();
        self.stale = false;
        self.total = 0;
        self.epoch += 1;
        self.open_reads.clear();
        self.journal.clear();
        self.last_applied_read = None;
        self.revision += 1;
    }

    // -----------------------------------------------------------------------
    // Bulk reads
    // -----------------------------------------------------------------------

    pub fn begin_read(&mut self) -> ReadToken {
        let id = self.next_read;
        self.next_read += 1;
        self.open_reads.insert(id, self.feed_seq);
        ReadToken {
            id,
            epoch: self.epoch,
            issued_at_seq: self.feed_seq,
        }
    }

    /// Replace contents with a read issued now.
    pub fn apply_bulk(&mut self, records: Vec<IncidentRecord>, total: u64) -> bool {
        let token = self.begin_read();
        self.apply_bulk_read(token, records, total)
    }

    /// Replace contents with the result of the read `token` was issued for,
    /// then replay newer feed events and pending optimistic statuses.
    ///
    /// Returns `false` if the read was superseded (filter changed, or a read
    /// issued later already landed) and nothing was applied.
    pub fn apply_bulk_read(
        &mut self,
        token: ReadToken,
        records: Vec<IncidentRecord>,
        total: u64,
    ) -> bool {
        if token.epoch != self.epoch || self.open_reads.remove(&token.id).is_none() {
            debug!(read = token.id, "discarding read from a previous filter");
            return false;
        }
        if self
            .last_applied_read
            .is_some_and(|last| token.issued_at_seq < last)
        {
            debug!(read = token.id, "discarding read overtaken by a newer one");
            self.prune_journal();
            return false;
        }
        self.last_applied_read = Some(token.issued_at_seq);

        self.records.clear();
        self.order.clear();
        self.unloaded.clear();
        self.stale = false;
        for record in records {
            if let Some(previous) = self.records.remove(record.id()) {
                self.order.remove(&previous.order_key());
            }
            self.order.insert(record.order_key());
            self.records.insert(record.id().clone(), record);
        }
        self.total = total.max(self.records.len() as u64);

        let replay: Vec<FeedEvent<IncidentRecord>> = self
            .journal
            .iter()
            .filter(|(seq, _)| *seq > token.issued_at_seq)
            .map(|(_, event)| event.clone())
            .collect();
        let replayed = replay.len();
        self.replaying = true;
        for event in replay {
            self.apply_change(event);
        }
        self.replaying = false;

        self.overlay_pending(token.id);
        self.prune_journal();
        self.revision += 1;

        debug!(
            read = token.id,
            records = self.records.len(),
            total = self.total,
            replayed,
            "bulk read applied"
        );
        true
    }

    fn overlay_pending(&mut self, read_id: u64) {
        let pending: Vec<(IncidentId, PendingStatus)> =
            self.pending.iter().map(|(id, p)| (id.clone(), *p)).collect();
        for (id, entry) in pending {
            if entry.settled_from_read.is_some_and(|from| read_id >= from) {
                self.pending.remove(&id);
                continue;
            }
            if !self.records.contains_key(&id) && !self.unloaded.contains_key(&id) {
                continue;
            }
            self.patch(&id, &FieldPatch::status(entry.status));
        }
    }

    fn prune_journal(&mut self) {
        match self.open_reads.values().min().copied() {
            None => self.journal.clear(),
            Some(oldest) => self.journal.retain(|(seq, _)| *seq > oldest),
        }
    }

    // -----------------------------------------------------------------------
    // Feed events
    // -----------------------------------------------------------------------

    pub fn apply_feed_event(&mut self, event: FeedEvent<IncidentRecord>) -> ApplyOutcome {
        self.feed_seq += 1;
        let seq = self.feed_seq;

        let carries_status = match &event {
            FeedEvent::Inserted(_) | FeedEvent::Removed(_) => true,
            FeedEvent::Updated { patch, .. } => patch.status.is_some(),
        };
        let superseded = if carries_status {
            self.pending.remove(event.id())
        } else {
            None
        };
        if let Some(entry) = superseded {
            debug!(id = %event.id(), txn = entry.txn, "feed superseded optimistic status");
        }

        if !self.open_reads.is_empty() {
            self.journal.push_back((seq, event.clone()));
        }

        let kind = event.kind();
        let id = event.id().clone();
        let outcome = self.apply_change(event);
        debug!(seq, kind, %id, ?outcome, total = self.total, "feed event reconciled");
        outcome
    }

    fn apply_change(&mut self, event: FeedEvent<IncidentRecord>) -> ApplyOutcome {
        match event {
            FeedEvent::Inserted(record) => self.upsert(record),
            FeedEvent::Updated { id, patch } => self.patch(&id, &patch),
            FeedEvent::Removed(id) => {
                if self.evict(&id) {
                    return ApplyOutcome::Removed;
                }
                if !self.drop_unloaded(&id) && self.has_unseen_rows() {
                    self.stale = true;
                }
                ApplyOutcome::Unchanged
            }
        }
    }

    fn upsert(&mut self, record: IncidentRecord) -> ApplyOutcome {
        if self.unloaded.contains_key(record.id()) {
            return self.upsert_unloaded(record);
        }
        let visible = self.filter.matches(&record);
        let current = self
            .records
            .get(record.id())
            .map(|existing| (*existing == record, existing.order_key()));
        match current {
            Some(_) if !visible => {
                self.evict(record.id());
                ApplyOutcome::Removed
            }
            Some((true, _)) => ApplyOutcome::Unchanged,
            Some((false, old_key)) => {
                let new_key = record.order_key();
                self.order.remove(&old_key);
                self.order.insert(new_key.clone());
                self.records.insert(record.id().clone(), record);
                if old_key != new_key {
                    self.note_move(&new_key);
                }
                self.revision += 1;
                ApplyOutcome::Updated
            }
            None if visible => self.admit(record),
            None => ApplyOutcome::Unchanged,
        }
    }

    /// Count a newly visible record and place it against the page window.
    fn admit(&mut self, record: IncidentRecord) -> ApplyOutcome {
        let key = record.order_key();
        let ahead = self.before_page(&key);
        let after = self.page_full() && self.order.last().is_some_and(|last| key > *last);
        if (ahead || after) && self.replaying {
            // The read being replayed onto may already count this record.
            self.stale = true;
            return ApplyOutcome::Unchanged;
        }
        self.total += 1;
        self.revision += 1;
        if ahead || after {
            self.stale |= ahead;
            self.unloaded.insert(record.id().clone(), record);
            return ApplyOutcome::Unchanged;
        }
        self.order.insert(key);
        self.records.insert(record.id().clone(), record);
        self.spill();
        ApplyOutcome::Inserted
    }

    /// Push records off the end of an overfull page.
    fn spill(&mut self) {
        let Some(limit) = self.window.limit else {
            return;
        };
        while self.records.len() > limit {
            let Some(key) = self.order.pop_last() else {
                break;
            };
            if let Some(record) = self.records.remove(key.id()) {
                debug!(id = %key.id(), "record pushed off the page");
                self.unloaded.insert(key.id().clone(), record);
            }
        }
    }

    fn upsert_unloaded(&mut self, record: IncidentRecord) -> ApplyOutcome {
        let id = record.id().clone();
        if !self.filter.matches(&record) {
            self.drop_unloaded(&id);
            return ApplyOutcome::Unchanged;
        }
        let key = record.order_key();
        let moved = self
            .unloaded
            .insert(id, record)
            .is_some_and(|previous| previous.order_key() != key);
        self.stale |= moved;
        ApplyOutcome::Unchanged
    }

    fn patch_unloaded(&mut self, id: &IncidentId, patch: &FieldPatch) -> ApplyOutcome {
        let Some(record) = self.unloaded.get_mut(id) else {
            return ApplyOutcome::Unknown;
        };
        let old_key = record.order_key();
        if patch.apply(&mut record.row).is_empty() {
            return ApplyOutcome::Unchanged;
        }
        let moved = record.order_key() != old_key;
        let visible = self.filter.matches(record);
        self.stale |= moved;
        if !visible {
            self.drop_unloaded(id);
        }
        ApplyOutcome::Unchanged
    }

    /// Forget a record outside the page and shrink `total`.
    fn drop_unloaded(&mut self, id: &IncidentId) -> bool {
        let Some(record) = self.unloaded.remove(id) else {
            return false;
        };
        self.stale |= self.before_page(&record.order_key());
        self.total = self.total.saturating_sub(1);
        self.revision += 1;
        true
    }

    /// `key` sorts ahead of the loaded page, on an earlier page.
    fn before_page(&self, key: &OrderKey) -> bool {
        self.window.offset > 0 && self.order.first().is_none_or(|first| key < first)
    }

    fn page_full(&self) -> bool {
        self.window.limit.is_some_and(|limit| self.records.len() >= limit)
    }

    /// A loaded record now sorting to an edge of the page may belong on a
    /// neighbouring one.
    fn note_move(&mut self, key: &OrderKey) {
        let at_edge = (self.window.offset > 0 && self.order.first() == Some(key))
            || (self.has_rows_after_page() && self.order.last() == Some(key));
        self.stale |= at_edge;
    }

    /// Rows sort after the loaded page.
    fn has_rows_after_page(&self) -> bool {
        self.window.is_bounded() && self.total > self.window.offset + self.records.len() as u64
    }

    /// `total` counts rows this store has never seen.
    fn has_unseen_rows(&self) -> bool {
        if !self.window.is_bounded() {
            return false;
        }
        let seen = (self.records.len() + self.unloaded.len()) as u64;
        self.window.offset > 0 || self.total > seen
    }

    fn patch(&mut self, id: &IncidentId, patch: &FieldPatch) -> ApplyOutcome {
        if self.unloaded.contains_key(id) {
            return self.patch_unloaded(id, patch);
        }
        let unseen = self.has_unseen_rows();
        let Some(record) = self.records.get_mut(id) else {
            if unseen && patch.moves_rows() {
                self.stale = true;
            }
            return ApplyOutcome::Unknown;
        };
        let old_key = record.order_key();
        if patch.apply(&mut record.row).is_empty() {
            return ApplyOutcome::Unchanged;
        }
        let new_key = record.order_key();
        let visible = self.filter.matches(record);

        if old_key != new_key {
            self.order.remove(&old_key);
            self.order.insert(new_key.clone());
            self.note_move(&new_key);
        }
        if visible {
            self.revision += 1;
            ApplyOutcome::Updated
        } else {
            self.evict(id);
            ApplyOutcome::Removed
        }
    }

    /// Remove a record and shrink `total`. Returns whether it was present.
    fn evict(&mut self, id: &IncidentId) -> bool {
        let Some(record) = self.records.remove(id) else {
            return false;
        };
        self.order.remove(&record.order_key());
        self.total = self.total.saturating_sub(1);
        self.revision += 1;
        // The next row would slide into the gap.
        self.stale |= self.has_rows_after_page();
        true
    }

    // -----------------------------------------------------------------------
    // Optimistic mutations
    // -----------------------------------------------------------------------

    /// Apply `patch` locally ahead of the write. Returns `None` when the record
    /// is not in the store, in which case nothing is overlaid.
    pub fn apply_optimistic_mutation(&mut self, id: &IncidentId, patch: &FieldPatch) -> Option<TxnId> {
        if !self.records.contains_key(id) {
            return None;
        }
        let txn = self.next_txn;
        self.next_txn += 1;
        if let Some(status) = patch.status {
            self.pending.insert(
                id.clone(),
                PendingStatus {
                    txn,
                    status,
                    settled_from_read: None,
                },
            );
        }
        let outcome = self.patch(id, patch);
        debug!(%id, txn, ?outcome, "optimistic mutation applied");
        Some(txn)
    }

    /// The write for `txn` succeeded. Returns `false` if a newer transaction
    /// or a feed event already owns the record's status.
    pub fn confirm(&mut self, id: &IncidentId, txn: TxnId) -> bool {
        let next_read = self.next_read;
        let held = self.records.contains_key(id) || self.unloaded.contains_key(id);
        match self.pending.get_mut(id) {
            Some(entry) if entry.txn == txn => {
                if held {
                    entry.settled_from_read = Some(next_read);
                } else {
                    // The record already left the store; nothing to settle.
                    self.pending.remove(id);
                }
                true
            }
            _ => false,
        }
    }

    /// The write for `txn` failed. The overlay is dropped; nothing is rolled
    /// back locally.
    pub fn abandon(&mut self, id: &IncidentId, txn: TxnId) -> bool {
        match self.pending.get(id) {
            Some(entry) if entry.txn == txn => {
                self.pending.remove(id);
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Records in view order.
    pub fn records(&self) -> impl Iterator<Item = &IncidentRecord> + '_ {
        self.order.iter().filter_map(|key| self.records.get(key.id()))
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<IncidentRecord> {
        self.records().cloned().collect()
    }

    #[must_use]
    pub fn get(&self, id: &IncidentId) -> Option<&IncidentRecord> {
        self.records.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &IncidentId) -> bool {
        self.records.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Size of the whole filtered set, not just the loaded page.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn pending_status(&self, id: &IncidentId) -> Option<Status> {
        self.pending.get(id).map(|entry| entry.status)
    }

    #[must_use]
    pub fn open_reads(&self) -> usize {
        self.open_reads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeoPoint, IncidentRow, Reporter, micros_to_utc};
    use crate::query::{PageRequest, PageWindow, ViewScope};

    fn record(id: &str, severity: u8, status: Status, at_secs: i64) -> IncidentRecord {
        IncidentRow {
            id: IncidentId::new(id),
            category: "Flood".to_string(),
            severity,
            position: GeoPoint::new(6.9, 79.8),
            victim_count: 2,
            reported_at: micros_to_utc(at_secs * 1_000_000).expect("valid"),
            status,
            evidence_ref: Some(format!("evidence/{id}.jpg")),
            reporter_id: Some("off-1".to_string()),
        }
        .hydrate(Reporter::new("K. Silva", None))
    }

    fn active() -> IncidentStore {
        IncidentStore::new(ViewFilter::from_request(&PageRequest::default()))
    }

    fn paged(page: u32, size: u32) -> IncidentStore {
        let request = PageRequest::scoped(ViewScope::Active, size).with_page(page);
        IncidentStore::new(ViewFilter::from_request(&request)).with_window(PageWindow::from_request(&request))
    }

    fn ids(store: &IncidentStore) -> Vec<String> {
        store.records().map(|r| r.id().to_string()).collect()
    }

    fn status_update(id: &str, status: Status) -> FeedEvent<IncidentRecord> {
        FeedEvent::Updated {
            id: IncidentId::new(id),
            patch: FieldPatch::status(status),
        }
    }

    #[test]
    fn bulk_orders_newest_first_with_id_tiebreak() {
        let mut store = active();
        store.apply_bulk(
            vec![
                record("b", 1, Status::Pending, 10),
                record("c", 1, Status::Pending, 20),
                record("a", 1, Status::Pending, 10),
            ],
            3,
        );
        assert_eq!(ids(&store), vec!["c", "a", "b"]);
        assert_eq!(store.total(), 3);
    }

    #[test]
    fn bulk_with_repeated_id_keeps_one() {
        let mut store = active();
        store.apply_bulk(
            vec![record("a", 1, Status::Pending, 10), record("a", 5, Status::Pending, 10)],
            1,
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&IncidentId::new("a")).map(|r| r.row.severity), Some(5));
    }

    #[test]
    fn partial_update_touches_only_carried_fields() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);
        let before = store.get(&IncidentId::new("a")).cloned().expect("present");

        let outcome = store.apply_feed_event(status_update("a", Status::Dispatched));

        assert_eq!(outcome, ApplyOutcome::Updated);
        let after = store.get(&IncidentId::new("a")).expect("present");
        assert_eq!(after.row.status, Status::Dispatched);
        assert_eq!(after.row.severity, before.row.severity);
        assert_eq!(after.row.evidence_ref, before.row.evidence_ref);
        assert_eq!(after.reporter, before.reporter);
    }

    #[test]
    fn reapplying_an_update_is_a_no_op() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);
        store.apply_feed_event(status_update("a", Status::OnSite));
        let once = store.snapshot();
        let revision = store.revision();

        assert_eq!(
            store.apply_feed_event(status_update("a", Status::OnSite)),
            ApplyOutcome::Unchanged
        );
        assert_eq!(store.snapshot(), once);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn update_for_unknown_id_is_ignored() {
        let mut store = active();
        assert_eq!(
            store.apply_feed_event(status_update("ghost", Status::Resolved)),
            ApplyOutcome::Unknown
        );
        assert!(store.is_empty());
        assert_eq!(store.total(), 0);
    }

    #[test]
    fn duplicate_insert_does_not_duplicate_or_recount() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);
        store.apply_feed_event(FeedEvent::Inserted(record("a", 3, Status::Pending, 10)));
        store.apply_feed_event(FeedEvent::Inserted(record("a", 4, Status::Pending, 10)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.total(), 1);
        assert_eq!(store.get(&IncidentId::new("a")).map(|r| r.row.severity), Some(4));
    }

    #[test]
    fn remove_then_insert_keeps_later_values() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);
        store.apply_feed_event(FeedEvent::Removed(IncidentId::new("a")));
        assert_eq!(store.total(), 0);
        store.apply_feed_event(FeedEvent::Inserted(record("a", 2, Status::Dispatched, 30)));
        assert_eq!(ids(&store), vec!["a"]);
        assert_eq!(store.total(), 1);
        assert_eq!(
            store.get(&IncidentId::new("a")).map(|r| r.row.status),
            Some(Status::Dispatched)
        );
    }

    #[test]
    fn removing_absent_id_keeps_total() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 5);
        store.apply_feed_event(FeedEvent::Removed(IncidentId::new("zzz")));
        assert_eq!(store.total(), 5);
    }

    #[test]
    fn status_leaving_filter_removes_and_decrements() {
        let mut store = active();
        store.apply_bulk(
            vec![record("a", 3, Status::Resolved, 10), record("b", 3, Status::Pending, 5)],
            2,
        );
        assert_eq!(
            store.apply_feed_event(status_update("a", Status::Completed)),
            ApplyOutcome::Removed
        );
        assert_eq!(ids(&store), vec!["b"]);
        assert_eq!(store.total(), 1);
    }

    #[test]
    fn filtered_insert_is_not_admitted() {
        let mut store = IncidentStore::new(ViewFilter::from_request(&PageRequest::scoped(
            ViewScope::Completed,
            8,
        )));
        let outcome = store.apply_feed_event(FeedEvent::Inserted(record("a", 3, Status::Pending, 10)));
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(store.total(), 0);
    }

    #[test]
    fn update_racing_a_read_is_replayed() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);

        let token = store.begin_read();
        store.apply_feed_event(status_update("a", Status::Dispatched));
        // The read was served before the update reached the server.
        store.apply_bulk_read(token, vec![record("a", 3, Status::Pending, 10)], 1);

        assert_eq!(
            store.get(&IncidentId::new("a")).map(|r| r.row.status),
            Some(Status::Dispatched)
        );
        assert_eq!(store.open_reads(), 0);
    }

    #[test]
    fn insert_racing_a_read_counts_once() {
        let mut store = active();
        let token = store.begin_read();
        store.apply_feed_event(FeedEvent::Inserted(record("b", 2, Status::Pending, 20)));
        // The read already saw the insert.
        store.apply_bulk_read(
            token,
            vec![record("b", 2, Status::Pending, 20), record("a", 3, Status::Pending, 10)],
            2,
        );
        assert_eq!(ids(&store), vec!["b", "a"]);
        assert_eq!(store.total(), 2);
    }

    #[test]
    fn overtaken_read_is_discarded() {
        let mut store = active();
        let old = store.begin_read();
        store.apply_feed_event(FeedEvent::Inserted(record("a", 3, Status::Pending, 10)));
        let fresh = store.begin_read();
        assert!(store.apply_bulk_read(fresh, vec![record("a", 3, Status::Pending, 10)], 1));
        assert!(!store.apply_bulk_read(old, Vec::new(), 0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn filter_change_invalidates_reads() {
        let mut store = active();
        let token = store.begin_read();
        store.set_filter(ViewFilter::from_request(&PageRequest::scoped(ViewScope::Completed, 8)));
        assert!(!store.apply_bulk_read(token, vec![record("a", 3, Status::Pending, 10)], 1));
        assert!(store.is_empty());
    }

    #[test]
    fn pending_status_survives_stale_read() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);
        let txn = store
            .apply_optimistic_mutation(&IncidentId::new("a"), &FieldPatch::status(Status::Dispatched))
            .expect("record present");

        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);

        assert_eq!(
            store.get(&IncidentId::new("a")).map(|r| r.row.status),
            Some(Status::Dispatched)
        );
        assert_eq!(store.pending_status(&IncidentId::new("a")), Some(Status::Dispatched));
        assert!(store.abandon(&IncidentId::new("a"), txn));
        assert_eq!(store.pending_status(&IncidentId::new("a")), None);
    }

    #[test]
    fn optimistic_archive_hides_record_across_stale_read() {
        let mut store = active();
        store.apply_bulk(
            vec![record("a", 3, Status::Resolved, 10), record("b", 3, Status::Pending, 5)],
            2,
        );
        store.apply_optimistic_mutation(&IncidentId::new("a"), &FieldPatch::status(Status::Completed));
        assert_eq!(ids(&store), vec!["b"]);
        assert_eq!(store.total(), 1);

        store.apply_bulk(
            vec![record("a", 3, Status::Resolved, 10), record("b", 3, Status::Pending, 5)],
            2,
        );
        assert_eq!(ids(&store), vec!["b"]);
        assert_eq!(store.total(), 1);
    }

    #[test]
    fn feed_status_supersedes_pending() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);
        store.apply_optimistic_mutation(&IncidentId::new("a"), &FieldPatch::status(Status::Dispatched));
        store.apply_feed_event(status_update("a", Status::OnSite));
        assert_eq!(store.pending_status(&IncidentId::new("a")), None);

        store.apply_bulk(vec![record("a", 3, Status::OnSite, 10)], 1);
        assert_eq!(
            store.get(&IncidentId::new("a")).map(|r| r.row.status),
            Some(Status::OnSite)
        );
    }

    #[test]
    fn non_status_feed_update_keeps_pending() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);
        store.apply_optimistic_mutation(&IncidentId::new("a"), &FieldPatch::status(Status::Dispatched));
        store.apply_feed_event(FeedEvent::Updated {
            id: IncidentId::new("a"),
            patch: FieldPatch {
                victim_count: Some(9),
                ..FieldPatch::default()
            },
        });
        assert_eq!(store.pending_status(&IncidentId::new("a")), Some(Status::Dispatched));
    }

    #[test]
    fn older_transaction_cannot_clear_newer_overlay() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);
        let id = IncidentId::new("a");
        let first = store
            .apply_optimistic_mutation(&id, &FieldPatch::status(Status::Dispatched))
            .expect("present");
        let second = store
            .apply_optimistic_mutation(&id, &FieldPatch::status(Status::OnSite))
            .expect("present");

        assert!(!store.abandon(&id, first));
        assert!(!store.confirm(&id, first));
        assert_eq!(store.pending_status(&id), Some(Status::OnSite));
        assert!(store.confirm(&id, second));
    }

    #[test]
    fn confirmed_overlay_settles_on_next_read() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 1);
        let id = IncidentId::new("a");
        let txn = store
            .apply_optimistic_mutation(&id, &FieldPatch::status(Status::Dispatched))
            .expect("present");

        let in_flight = store.begin_read();
        assert!(store.confirm(&id, txn));
        // Issued before confirmation: still overlaid.
        store.apply_bulk_read(in_flight, vec![record("a", 3, Status::Pending, 10)], 1);
        assert_eq!(store.get(&id).map(|r| r.row.status), Some(Status::Dispatched));

        store.apply_bulk(vec![record("a", 3, Status::Dispatched, 10)], 1);
        assert_eq!(store.pending_status(&id), None);
    }

    #[test]
    fn mutation_on_absent_record_is_not_tracked() {
        let mut store = active();
        assert_eq!(
            store.apply_optimistic_mutation(&IncidentId::new("x"), &FieldPatch::status(Status::Resolved)),
            None
        );
    }

    #[test]
    fn reported_at_change_reorders() {
        let mut store = active();
        store.apply_bulk(
            vec![record("a", 3, Status::Pending, 10), record("b", 3, Status::Pending, 20)],
            2,
        );
        assert_eq!(ids(&store), vec!["b", "a"]);
        store.apply_feed_event(FeedEvent::Updated {
            id: IncidentId::new("a"),
            patch: FieldPatch {
                reported_at: micros_to_utc(30_000_000),
                ..FieldPatch::default()
            },
        });
        assert_eq!(ids(&store), vec!["a", "b"]);
    }

    #[test]
    fn insert_into_full_page_pushes_last_record_out() {
        let mut store = paged(1, 2);
        store.apply_bulk(
            vec![record("c", 1, Status::Pending, 30), record("b", 1, Status::Pending, 20)],
            3,
        );

        assert_eq!(
            store.apply_feed_event(FeedEvent::Inserted(record("d", 1, Status::Pending, 40))),
            ApplyOutcome::Inserted
        );
        assert_eq!(ids(&store), vec!["d", "c"]);
        assert_eq!(store.total(), 4);
        assert!(!store.take_stale());

        // Still counted once, and gone without disturbing the page.
        store.apply_feed_event(FeedEvent::Inserted(record("b", 1, Status::Pending, 20)));
        assert_eq!(store.total(), 4);
        store.apply_feed_event(FeedEvent::Removed(IncidentId::new("b")));
        assert_eq!(store.total(), 3);
        assert_eq!(ids(&store), vec!["d", "c"]);
    }

    #[test]
    fn insert_after_full_page_only_counts() {
        let mut store = paged(1, 2);
        store.apply_bulk(
            vec![record("c", 1, Status::Pending, 30), record("b", 1, Status::Pending, 20)],
            2,
        );
        let late = FeedEvent::Inserted(record("a", 1, Status::Pending, 10));
        assert_eq!(store.apply_feed_event(late.clone()), ApplyOutcome::Unchanged);
        store.apply_feed_event(late);
        assert_eq!(ids(&store), vec!["c", "b"]);
        assert_eq!(store.total(), 3);
        assert!(!store.take_stale());
    }

    #[test]
    fn insert_ahead_of_later_page_marks_stale() {
        let mut store = paged(2, 2);
        store.apply_bulk(
            vec![record("b", 1, Status::Pending, 20), record("a", 1, Status::Pending, 10)],
            4,
        );
        store.apply_feed_event(FeedEvent::Inserted(record("z", 1, Status::Pending, 99)));
        assert_eq!(ids(&store), vec!["b", "a"]);
        assert_eq!(store.total(), 5);
        assert!(store.take_stale());
        assert!(!store.take_stale());
    }

    #[test]
    fn leaving_a_page_with_rows_after_it_marks_stale() {
        let mut store = paged(1, 2);
        store.apply_bulk(
            vec![record("c", 1, Status::Resolved, 30), record("b", 1, Status::Pending, 20)],
            3,
        );
        assert_eq!(
            store.apply_feed_event(status_update("c", Status::Completed)),
            ApplyOutcome::Removed
        );
        assert_eq!(store.total(), 2);
        assert!(store.take_stale());

        store.apply_bulk(
            vec![record("b", 1, Status::Pending, 20), record("a", 1, Status::Pending, 10)],
            2,
        );
        assert!(!store.take_stale());
    }

    #[test]
    fn unbounded_store_is_never_stale() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Pending, 10)], 5);
        store.apply_feed_event(FeedEvent::Removed(IncidentId::new("zzz")));
        store.apply_feed_event(status_update("a", Status::Completed));
        assert!(!store.take_stale());
    }

    #[test]
    fn confirming_overlay_of_departed_record_drops_it() {
        let mut store = active();
        store.apply_bulk(vec![record("a", 3, Status::Resolved, 10)], 1);
        let id = IncidentId::new("a");
        let txn = store
            .apply_optimistic_mutation(&id, &FieldPatch::status(Status::Completed))
            .expect("present");
        assert!(!store.contains(&id));
        assert_eq!(store.pending_status(&id), Some(Status::Completed));

        assert!(store.confirm(&id, txn));
        assert_eq!(store.pending_status(&id), None);
    }
}
