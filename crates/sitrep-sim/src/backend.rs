use anyhow::{Result, bail};

use sitrep_core::backend::MemoryBackend;
use sitrep_core::feed::{FeedHub, Subscription};
use sitrep_core::model::{IncidentId, IncidentRecord, Officer, Reporter, Status};
use sitrep_core::ports::{ChangeFeed, IncidentSource, OfficerDirectory, StatusWriter};
use sitrep_core::query::PageRequest;

/// Memory store whose change feed goes through the simulator.
///
/// Writes land in the inner [`MemoryBackend`], whose own hub the simulator
/// taps. Views subscribe to the delivery hub, which only sees what the
/// simulated feed lets through.
#[derive(Default)]
pub struct SimBackend {
    inner: MemoryBackend,
    delivery: FeedHub,
}

impl SimBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    #[must_use]
    pub const fn delivery(&self) -> &FeedHub {
        &self.delivery
    }
}

impl IncidentSource for SimBackend {
    fn fetch_page(&self, request: &PageRequest) -> Result<(Vec<IncidentRecord>, u64)> {
        self.inner.fetch_page(request)
    }

    fn fetch_incident(&self, id: &IncidentId) -> Result<Option<IncidentRecord>> {
        self.inner.fetch_incident(id)
    }
}

impl OfficerDirectory for SimBackend {
    fn lookup_officer(&self, officer_id: &str) -> Result<Option<Reporter>> {
        self.inner.lookup_officer(officer_id)
    }

    fn list_officers(&self) -> Result<Vec<Officer>> {
        self.inner.list_officers()
    }
}

impl StatusWriter for SimBackend {
    fn update_status(&self, id: &IncidentId, status: Status) -> Result<()> {
        self.inner.update_status(id, status)
    }
}

impl ChangeFeed for SimBackend {
    fn subscribe(&self, collection: &str) -> Result<Subscription> {
        if self.inner.faults().fail_subscribe {
            bail!("simulated feed: subscriptions disabled");
        }
        Ok(self.delivery.open(collection))
    }
}
