use tracing::{debug, warn};

use super::FeedEvent;
use crate::error::ErrorCode;
use crate::model::{IncidentRecord, IncidentRow, Reporter};
use crate::ports::OfficerDirectory;

/// Supplies the officer relation that feed inserts arrive without.
///
/// Each insert costs exactly one directory lookup. A missing reference, a
/// failed lookup or an unknown officer all fall back to the placeholder
/// reporter; the record itself is always admitted.
pub struct RelationBackfiller<'a, D: OfficerDirectory + ?Sized> {
    directory: &'a D,
    placeholder: &'a str,
}

impl<'a, D: OfficerDirectory + ?Sized> RelationBackfiller<'a, D> {
    pub const fn new(directory: &'a D, placeholder: &'a str) -> Self {
        Self {
            directory,
            placeholder,
        }
    }

    pub fn hydrate(&self, row: IncidentRow) -> IncidentRecord {
        let reporter = self.reporter_for(&row);
        row.hydrate(reporter)
    }

    pub fn hydrate_event(&self, event: FeedEvent) -> FeedEvent<IncidentRecord> {
        event.map_inserted(|row| self.hydrate(row))
    }

    fn reporter_for(&self, row: &IncidentRow) -> Reporter {
        let Some(officer_id) = row.reporter_id.as_deref() else {
            debug!(id = %row.id, "insert has no reporter reference");
            return Reporter::placeholder(self.placeholder);
        };

        match self.directory.lookup_officer(officer_id) {
            Ok(Some(reporter)) => reporter,
            Ok(None) => {
                debug!(id = %row.id, officer_id, "reporter not on roster");
                Reporter::placeholder(self.placeholder)
            }
            Err(err) => {
                warn!(
                    code = ErrorCode::RelationLookupFailed.code(),
                    id = %row.id,
                    officer_id,
                    error = %err,
                    "reporter lookup failed; using placeholder"
                );
                Reporter::placeholder(self.placeholder)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeoPoint, IncidentId, Officer, Status, micros_to_utc};
    use anyhow::{Result, bail};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Directory {
        fail: bool,
        calls: AtomicUsize,
    }

    impl OfficerDirectory for Directory {
        fn lookup_officer(&self, officer_id: &str) -> Result<Option<Reporter>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("profiles table unavailable");
            }
            Ok((officer_id == "off-1").then(|| Reporter::new("K. Silva", Some("011".to_string()))))
        }

        fn list_officers(&self) -> Result<Vec<Officer>> {
            Ok(Vec::new())
        }
    }

    fn row(reporter_id: Option<&str>) -> IncidentRow {
        IncidentRow {
            id: IncidentId::new("inc-1"),
            category: "Flood".to_string(),
            severity: 2,
            position: GeoPoint::new(0.0, 0.0),
            victim_count: 1,
            reported_at: micros_to_utc(0).expect("valid"),
            status: Status::Pending,
            evidence_ref: None,
            reporter_id: reporter_id.map(str::to_string),
        }
    }

    #[test]
    fn known_officer_is_joined_with_one_lookup() {
        let dir = Directory { fail: false, calls: AtomicUsize::new(0) };
        let record = RelationBackfiller::new(&dir, "Unknown Officer").hydrate(row(Some("off-1")));
        assert_eq!(record.reporter.name, "K. Silva");
        assert_eq!(dir.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_lookup_admits_with_placeholder() {
        let dir = Directory { fail: true, calls: AtomicUsize::new(0) };
        let record = RelationBackfiller::new(&dir, "Unknown Officer").hydrate(row(Some("off-1")));
        assert_eq!(record.reporter, Reporter::placeholder("Unknown Officer"));
        assert_eq!(record.row.category, "Flood");
        assert_eq!(dir.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_or_missing_reference_uses_placeholder() {
        let dir = Directory { fail: false, calls: AtomicUsize::new(0) };
        let backfill = RelationBackfiller::new(&dir, "Unassigned");
        assert_eq!(backfill.hydrate(row(Some("off-9"))).reporter.name, "Unassigned");
        assert_eq!(backfill.hydrate(row(None)).reporter.name, "Unassigned");
        assert_eq!(dir.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn updates_pass_through_without_lookup() {
        let dir = Directory { fail: false, calls: AtomicUsize::new(0) };
        let event = FeedEvent::Removed(IncidentId::new("inc-1"));
        let hydrated = RelationBackfiller::new(&dir, "Unknown Officer").hydrate_event(event);
        assert_eq!(hydrated, FeedEvent::Removed(IncidentId::new("inc-1")));
        assert_eq!(dir.calls.load(Ordering::SeqCst), 0);
    }
}
