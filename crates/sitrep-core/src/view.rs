//! A live, filtered view of incidents.
//!
//! [`IncidentView`] owns everything one screen of the desk needs: the store,
//! a feed subscription, the transition engine and its archival schedule. It
//! is driven explicitly. `pump` drains the feed, `tick` fires due archival
//! deadlines, `refresh` re-reads the current page. Two views (for example
//! active and completed) hold independent subscriptions.

use std::cell::Cell;
use std::sync::Arc;

use tracing::{debug, info};

use crate::aggregate::{DashboardStats, summarize};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::feed::{ConnectionState, FeedEvent, FeedSubscriber, RelationBackfiller};
use crate::model::{IncidentId, IncidentRecord, Status};
use crate::ports::{Backend, INCIDENTS_COLLECTION};
use crate::query::{Page, PageRequest, PageRequestError, PageWindow, QueryExecutor, ViewFilter};
use crate::reconcile::{IncidentStore, ReadToken};
use crate::transition::{
    ArchiveSchedule, PendingTransition, TransitionEngine, TransitionError, TransitionOutcome,
    parse_target,
};

pub struct IncidentView<B: Backend + ?Sized> {
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
    request: PageRequest,
    store: IncidentStore,
    subscriber: FeedSubscriber,
    engine: TransitionEngine,
    critical_threshold: u8,
    placeholder: String,
    degraded: bool,
    stats_cache: Cell<Option<(u64, DashboardStats)>>,
}

impl<B: Backend + ?Sized> IncidentView<B> {
    /// Subscribe, then load the first page.
    ///
    /// The subscription is opened before the read so no change between the
    /// two is missed.
    ///
    /// # Errors
    ///
    /// Rejects an invalid page request. Store and feed failures surface as
    /// [`Self::is_degraded`] and [`Self::connection`] instead.
    pub fn open(
        backend: Arc<B>,
        clock: Arc<dyn Clock>,
        request: PageRequest,
        config: &EngineConfig,
    ) -> Result<Self, PageRequestError> {
        request.validate()?;
        let mut view = Self {
            store: IncidentStore::new(ViewFilter::from_request(&request))
                .with_window(PageWindow::from_request(&request)),
            subscriber: FeedSubscriber::new(INCIDENTS_COLLECTION),
            engine: TransitionEngine::new(&config.archive),
            critical_threshold: config.stats.critical_threshold,
            placeholder: config.backfill.placeholder_name.clone(),
            degraded: false,
            stats_cache: Cell::new(None),
            backend,
            clock,
            request,
        };
        view.subscriber.connect(&*view.backend);
        view.refresh();
        info!(scope = %view.request.scope, total = view.store.total(), "view opened");
        Ok(view)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Drain the feed, then re-read the current page.
    pub fn refresh(&mut self) {
        self.drain();
        self.store.take_stale();
        let (token, page) = self.begin_refresh();
        self.finish_refresh(token, page);
    }

    /// Issue the read now; apply it later with [`Self::finish_refresh`].
    /// Feed events pumped in between are replayed over the result.
    pub fn begin_refresh(&mut self) -> (ReadToken, Page) {
        let token = self.store.begin_read();
        let page = QueryExecutor::new(&*self.backend)
            .run(&self.request)
            .unwrap_or_else(|_| Page::degraded());
        (token, page)
    }

    pub fn finish_refresh(&mut self, token: ReadToken, page: Page) -> bool {
        self.degraded = page.degraded;
        let applied = self.store.apply_bulk_read(token, page.records, page.total);
        debug!(applied, degraded = self.degraded, total = self.store.total(), "refresh finished");
        applied
    }

    /// Switch page, search, severity or scope and reload.
    ///
    /// # Errors
    ///
    /// Rejects an invalid request, leaving the view untouched.
    pub fn set_request(&mut self, request: PageRequest) -> Result<(), PageRequestError> {
        request.validate()?;
        self.store.set_window(PageWindow::from_request(&request));
        self.store.set_filter(ViewFilter::from_request(&request));
        self.request = request;
        self.refresh();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Feed
    // -----------------------------------------------------------------------

    /// Drain queued feed events into the store. Returns how many were applied.
    ///
    /// Re-reads the page when an event moved rows across its edges.
    pub fn pump(&mut self) -> usize {
        let count = self.drain();
        if self.store.take_stale() {
            debug!(page = self.request.page, "page window shifted, re-reading");
            let (token, page) = self.begin_refresh();
            self.finish_refresh(token, page);
        }
        count
    }

    fn drain(&mut self) -> usize {
        let events = self.subscriber.poll();
        let now = self.clock.now_millis();
        let count = events.len();
        for event in events {
            let event = self.materialize(event);
            self.store.apply_feed_event(event.clone());
            self.engine.observe_feed(&self.store, &event, now);
        }
        count
    }

    /// Hydrate an event for the store.
    ///
    /// Inserts get their reporter from the directory. An update that moves an
    /// unloaded record into this view's scope is turned into an insert of the
    /// freshly read record.
    fn materialize(&self, event: FeedEvent) -> FeedEvent<IncidentRecord> {
        match event {
            FeedEvent::Updated { id, patch }
                if !self.store.contains(&id)
                    && patch
                        .status
                        .is_some_and(|status| self.request.scope.entered_by(status)) =>
            {
                match QueryExecutor::new(&*self.backend).fetch_one(&id) {
                    Some(record) => {
                        debug!(%id, "materialized record entering scope");
                        FeedEvent::Inserted(record)
                    }
                    None => FeedEvent::Updated { id, patch },
                }
            }
            other => RelationBackfiller::new(&*self.backend, &self.placeholder).hydrate_event(other),
        }
    }

    /// Re-subscribe and reload. Used after the feed drops.
    pub fn reconnect(&mut self) -> ConnectionState {
        info!(scope = %self.request.scope, "reconnecting view");
        self.subscriber.connect(&*self.backend);
        self.refresh();
        self.subscriber.state()
    }

    /// Release the subscription. Dropping the view does the same.
    pub fn close(mut self) {
        self.subscriber.release();
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Validate `target` and run the transition against the backend.
    ///
    /// # Errors
    ///
    /// Only target validation fails; write failures re-synchronize the view.
    pub fn transition(&mut self, id: &IncidentId, target: &str) -> Result<TransitionOutcome, TransitionError> {
        let status = parse_target(target)?;
        Ok(self.transition_to(id, status))
    }

    pub fn transition_to(&mut self, id: &IncidentId, status: Status) -> TransitionOutcome {
        let pending = self.begin_transition(id, status);
        let result = self.backend.update_status(id, status);
        self.complete_transition(&pending, result)
    }

    pub fn begin_transition(&mut self, id: &IncidentId, status: Status) -> PendingTransition {
        self.engine.begin(&mut self.store, id, status)
    }

    pub fn complete_transition(
        &mut self,
        pending: &PendingTransition,
        result: anyhow::Result<()>,
    ) -> TransitionOutcome {
        let now = self.clock.now_millis();
        let outcome = self.engine.complete(&mut self.store, pending, result, now);
        if outcome == TransitionOutcome::Resync {
            self.refresh();
        }
        outcome
    }

    /// Archive every record whose deadline has passed. Returns the ids
    /// archived.
    pub fn tick(&mut self) -> Vec<IncidentId> {
        let now = self.clock.now_millis();
        let due = self.engine.take_due(&self.store, now);
        for id in &due {
            info!(%id, "auto-archiving resolved incident");
            self.transition_to(id, Status::Completed);
        }
        due
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn records(&self) -> impl Iterator<Item = &IncidentRecord> + '_ {
        self.store.records()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<IncidentRecord> {
        self.store.snapshot()
    }

    #[must_use]
    pub fn get(&self, id: &IncidentId) -> Option<&IncidentRecord> {
        self.store.get(id)
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.store.total()
    }

    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.store.revision()
    }

    /// Dashboard counters over the loaded records, recomputed when the store
    /// revision moves.
    #[must_use]
    pub fn stats(&self) -> DashboardStats {
        let revision = self.store.revision();
        if let Some((_, stats)) = self.stats_cache.get().filter(|(at, _)| *at == revision) {
            return stats;
        }
        let stats = summarize(self.store.records(), self.critical_threshold);
        self.stats_cache.set(Some((revision, stats)));
        stats
    }

    #[must_use]
    pub const fn connection(&self) -> ConnectionState {
        self.subscriber.state()
    }

    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.degraded
    }

    #[must_use]
    pub const fn request(&self) -> &PageRequest {
        &self.request
    }

    #[must_use]
    pub const fn store(&self) -> &IncidentStore {
        &self.store
    }

    #[must_use]
    pub const fn archive_schedule(&self) -> &ArchiveSchedule {
        self.engine.schedule()
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }
}
