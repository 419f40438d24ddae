use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use tracing::debug;

use crate::feed::{ConnectionState, FeedEvent, FeedHub, Subscription};
use crate::model::{
    FieldPatch, IncidentId, IncidentRecord, IncidentRow, Officer, PLACEHOLDER_REPORTER, Reporter,
    Status, sort_roster,
};
use crate::ports::{ChangeFeed, INCIDENTS_COLLECTION, IncidentSource, OfficerDirectory, StatusWriter};
use crate::query::{PageRequest, ViewFilter};

/// Fault switches for exercising degraded paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    pub fail_reads: bool,
    pub fail_writes: bool,
    pub fail_lookups: bool,
    pub fail_subscribe: bool,
}

#[derive(Default)]
struct Tables {
    incidents: BTreeMap<IncidentId, IncidentRow>,
    officers: BTreeMap<String, Officer>,
}

/// In-memory store that publishes a feed event for every write.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    hub: FeedHub,
    lookups: AtomicUsize,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn faults(&self) -> Faults {
        *self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock().unwrap_or_else(PoisonError::into_inner) = faults;
    }

    #[must_use]
    pub const fn hub(&self) -> &FeedHub {
        &self.hub
    }

    /// Number of officer point lookups served (including failed ones).
    #[must_use]
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Writes (each publishes to the feed)
    // -----------------------------------------------------------------------

    /// File a new incident, or overwrite one with the same id.
    ///
    /// A new id publishes `Inserted`. Overwriting publishes `Updated` with
    /// only the fields that changed, or nothing when the row is identical.
    pub fn submit(&self, row: IncidentRow) {
        let event = {
            let mut tables = self.tables();
            match tables.incidents.get_mut(&row.id) {
                Some(existing) => {
                    let changed = FieldPatch::replacing(&row).apply(existing);
                    if changed.is_empty() {
                        None
                    } else {
                        Some(FeedEvent::Updated {
                            id: row.id.clone(),
                            patch: changed,
                        })
                    }
                }
                None => {
                    tables.incidents.insert(row.id.clone(), row.clone());
                    Some(FeedEvent::Inserted(row))
                }
            }
        };
        if let Some(event) = event {
            self.hub.publish(INCIDENTS_COLLECTION, &event);
        }
    }

    /// Merge `patch` into a stored row. Only effective changes are published.
    ///
    /// # Errors
    ///
    /// Fails if no incident has this id.
    pub fn apply_patch(&self, id: &IncidentId, patch: &FieldPatch) -> Result<FieldPatch> {
        let changed = {
            let mut tables = self.tables();
            let Some(row) = tables.incidents.get_mut(id) else {
                bail!("incident {id} not found");
            };
            patch.apply(row)
        };
        if !changed.is_empty() {
            self.hub.publish(
                INCIDENTS_COLLECTION,
                &FeedEvent::Updated {
                    id: id.clone(),
                    patch: changed.clone(),
                },
            );
        }
        Ok(changed)
    }

    pub fn remove(&self, id: &IncidentId) -> bool {
        let removed = self.tables().incidents.remove(id).is_some();
        if removed {
            self.hub
                .publish(INCIDENTS_COLLECTION, &FeedEvent::Removed(id.clone()));
        }
        removed
    }

    pub fn upsert_officer(&self, officer: Officer) {
        self.tables().officers.insert(officer.id.clone(), officer);
    }

    /// Hang up every live subscription.
    pub fn drop_connections(&self) -> usize {
        self.hub.disconnect_all()
    }

    /// Tell subscribers the feed is (un)available without hanging up.
    pub fn signal(&self, state: ConnectionState) -> usize {
        self.hub.broadcast_status(state)
    }

    // -----------------------------------------------------------------------
    // Direct reads (not fault-injected)
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn row(&self, id: &IncidentId) -> Option<IncidentRow> {
        self.tables().incidents.get(id).cloned()
    }

    /// The row joined with its reporter, as a bulk read would return it.
    #[must_use]
    pub fn record(&self, id: &IncidentId) -> Option<IncidentRecord> {
        let tables = self.tables();
        tables
            .incidents
            .get(id)
            .map(|row| join(row.clone(), &tables.officers))
    }

    /// Every record, joined and in view order.
    #[must_use]
    pub fn all_records(&self) -> Vec<IncidentRecord> {
        let tables = self.tables();
        let mut records: Vec<IncidentRecord> = tables
            .incidents
            .values()
            .map(|row| join(row.clone(), &tables.officers))
            .collect();
        records.sort_by_key(IncidentRecord::order_key);
        records
    }

    #[must_use]
    pub fn incident_ids(&self) -> Vec<IncidentId> {
        self.tables().incidents.keys().cloned().collect()
    }
}

fn join(row: IncidentRow, officers: &BTreeMap<String, Officer>) -> IncidentRecord {
    let reporter = row
        .reporter_id
        .as_ref()
        .and_then(|officer_id| officers.get(officer_id))
        .map_or_else(|| Reporter::placeholder(PLACEHOLDER_REPORTER), Officer::to_reporter);
    row.hydrate(reporter)
}

impl IncidentSource for MemoryBackend {
    fn fetch_page(&self, request: &PageRequest) -> Result<(Vec<IncidentRecord>, u64)> {
        if self.faults().fail_reads {
            bail!("memory backend: reads disabled");
        }
        let filter = ViewFilter::from_request(request);
        let mut matching: Vec<IncidentRecord> = {
            let tables = self.tables();
            tables
                .incidents
                .values()
                .map(|row| join(row.clone(), &tables.officers))
                .filter(|record| filter.matches(record))
                .collect()
        };
        matching.sort_by_key(IncidentRecord::order_key);

        let total = matching.len() as u64;
        let offset = usize::try_from(request.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(request.page_size).unwrap_or(usize::MAX);
        let page: Vec<IncidentRecord> = matching.into_iter().skip(offset).take(limit).collect();
        debug!(returned = page.len(), total, "memory page read");
        Ok((page, total))
    }

    fn fetch_incident(&self, id: &IncidentId) -> Result<Option<IncidentRecord>> {
        if self.faults().fail_reads {
            bail!("memory backend: reads disabled");
        }
        Ok(self.record(id))
    }
}

impl OfficerDirectory for MemoryBackend {
    fn lookup_officer(&self, officer_id: &str) -> Result<Option<Reporter>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.faults().fail_lookups {
            bail!("memory backend: officer lookups disabled");
        }
        Ok(self
            .tables()
            .officers
            .get(officer_id)
            .map(Officer::to_reporter))
    }

    fn list_officers(&self) -> Result<Vec<Officer>> {
        if self.faults().fail_reads {
            bail!("memory backend: reads disabled");
        }
        let mut roster: Vec<Officer> = self.tables().officers.values().cloned().collect();
        sort_roster(&mut roster);
        Ok(roster)
    }
}

impl StatusWriter for MemoryBackend {
    fn update_status(&self, id: &IncidentId, status: Status) -> Result<()> {
        if self.faults().fail_writes {
            bail!("memory backend: writes disabled");
        }
        self.apply_patch(id, &FieldPatch::status(status)).map(|_| ())
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe(&self, collection: &str) -> Result<Subscription> {
        if self.faults().fail_subscribe {
            bail!("memory backend: subscriptions disabled");
        }
        Ok(self.hub.open(collection))
    }
}
