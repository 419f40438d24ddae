use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sitrep_core::IncidentView;
use sitrep_core::aggregate::{DashboardStats, summarize};
use sitrep_core::feed::FeedEvent;
use sitrep_core::model::{IncidentId, IncidentRecord};
use sitrep_core::ports::Backend;
use sitrep_core::query::{PageRequest, ViewFilter};
use sitrep_core::reconcile::IncidentStore;

// ── Core result types ─────────────────────────────────────────────────────────

/// Oracle result for an invariant check.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    /// The same incident is held twice.
    DuplicateId { view: String, id: IncidentId },

    /// Records are not in (reported-at desc, id asc) order.
    OrderBroken { view: String, position: usize },

    /// A held record does not satisfy the view's filter.
    FilterMismatch { view: String, id: IncidentId },

    /// `total` is smaller than the number of loaded records.
    TotalBelowLoaded { view: String, total: u64, loaded: usize },

    /// More records are loaded than one page holds.
    PageOverflow { view: String, loaded: usize, page_size: u32 },

    /// Cached dashboard counters disagree with the loaded records.
    StatsMismatch {
        view: String,
        expected: DashboardStats,
        actual: DashboardStats,
    },

    /// Re-applying a delivered event changed the store.
    NotIdempotent { view: String, id: IncidentId },

    /// After quiescence a visible record disagrees with the source of truth.
    Diverged {
        view: String,
        id: IncidentId,
        detail: String,
    },

    /// After a final read the page differs from the source's first page.
    PageMismatch {
        view: String,
        expected: Vec<IncidentId>,
        actual: Vec<IncidentId>,
    },

    /// After a final read the total differs from the source's filtered count.
    TotalMismatch { view: String, expected: u64, actual: u64 },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId { view, id } => write!(f, "{view}: incident {id} held twice"),
            Self::OrderBroken { view, position } => {
                write!(f, "{view}: ordering broken at position {position}")
            }
            Self::FilterMismatch { view, id } => {
                write!(f, "{view}: incident {id} does not match the view filter")
            }
            Self::TotalBelowLoaded {
                view,
                total,
                loaded,
            } => write!(f, "{view}: total {total} below loaded count {loaded}"),
            Self::PageOverflow {
                view,
                loaded,
                page_size,
            } => write!(f, "{view}: {loaded} records loaded on a page of {page_size}"),
            Self::StatsMismatch {
                view,
                expected,
                actual,
            } => write!(f, "{view}: stats {actual:?} but records give {expected:?}"),
            Self::NotIdempotent { view, id } => {
                write!(f, "{view}: re-applying an event for {id} mutated the store")
            }
            Self::Diverged { view, id, detail } => {
                write!(f, "{view}: incident {id} diverged from the store ({detail})")
            }
            Self::PageMismatch {
                view,
                expected,
                actual,
            } => write!(f, "{view}: page {actual:?} but store has {expected:?}"),
            Self::TotalMismatch {
                view,
                expected,
                actual,
            } => write!(f, "{view}: total {actual} but store has {expected}"),
        }
    }
}

// ── Captured view state ──────────────────────────────────────────────────────

/// Immutable snapshot of one view, taken between simulation steps.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub name: String,
    pub request: PageRequest,
    pub filter: ViewFilter,
    pub records: Vec<IncidentRecord>,
    pub total: u64,
    pub stats: DashboardStats,
    pub critical_threshold: u8,
}

impl ViewState {
    #[must_use]
    pub fn capture<B: Backend + ?Sized>(
        name: &str,
        view: &IncidentView<B>,
        critical_threshold: u8,
    ) -> Self {
        Self {
            name: name.to_string(),
            request: view.request().clone(),
            filter: view.store().filter().clone(),
            records: view.snapshot(),
            total: view.total(),
            stats: view.stats(),
            critical_threshold,
        }
    }
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Checks a view against the invariants the engine promises.
///
/// # Invariants checked
///
/// 1. **Uniqueness**: no incident id is held twice.
/// 2. **Ordering**: records are sorted by the view order.
/// 3. **Filter consistency**: every record satisfies the view's filter.
/// 4. **Totals**: `total` is never below the loaded count, and the loaded
///    count never exceeds the page size.
/// 5. **Aggregates**: dashboard counters match the records.
/// 6. **Idempotence**: re-applying a delivered event is a no-op.
/// 7. **Convergence**: after quiescence visible rows equal the store, and a
///    fresh read equals the store's first page.
pub struct ViewOracle;

impl ViewOracle {
    /// Invariants 1 to 5, which must hold after every step.
    #[must_use]
    pub fn check_view(state: &ViewState) -> OracleResult {
        Self::check_unique(state)
            .merge(Self::check_ordering(state))
            .merge(Self::check_filter(state))
            .merge(Self::check_totals(state))
            .merge(Self::check_page_size(state))
            .merge(Self::check_stats(state))
    }

    #[must_use]
    pub fn check_unique(state: &ViewState) -> OracleResult {
        let mut seen = BTreeSet::new();
        let violations = state
            .records
            .iter()
            .filter(|record| !seen.insert(record.id().clone()))
            .map(|record| InvariantViolation::DuplicateId {
                view: state.name.clone(),
                id: record.id().clone(),
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_ordering(state: &ViewState) -> OracleResult {
        let violations = state
            .records
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[0].order_key() >= pair[1].order_key())
            .map(|(position, _)| InvariantViolation::OrderBroken {
                view: state.name.clone(),
                position: position + 1,
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_filter(state: &ViewState) -> OracleResult {
        let violations = state
            .records
            .iter()
            .filter(|record| !state.filter.matches(record))
            .map(|record| InvariantViolation::FilterMismatch {
                view: state.name.clone(),
                id: record.id().clone(),
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_totals(state: &ViewState) -> OracleResult {
        if state.total >= state.records.len() as u64 {
            return OracleResult::pass();
        }
        OracleResult::from_violations(vec![InvariantViolation::TotalBelowLoaded {
            view: state.name.clone(),
            total: state.total,
            loaded: state.records.len(),
        }])
    }

    #[must_use]
    pub fn check_page_size(state: &ViewState) -> OracleResult {
        let limit = usize::try_from(state.request.page_size).unwrap_or(usize::MAX);
        if state.records.len() <= limit {
            return OracleResult::pass();
        }
        OracleResult::from_violations(vec![InvariantViolation::PageOverflow {
            view: state.name.clone(),
            loaded: state.records.len(),
            page_size: state.request.page_size,
        }])
    }

    #[must_use]
    pub fn check_stats(state: &ViewState) -> OracleResult {
        let expected = summarize(&state.records, state.critical_threshold);
        if expected == state.stats {
            return OracleResult::pass();
        }
        OracleResult::from_violations(vec![InvariantViolation::StatsMismatch {
            view: state.name.clone(),
            expected,
            actual: state.stats,
        }])
    }

    /// Apply each event twice to a copy of `store`; the second application
    /// must change nothing.
    #[must_use]
    pub fn check_idempotence(
        view: &str,
        store: &IncidentStore,
        events: &[FeedEvent<IncidentRecord>],
    ) -> OracleResult {
        let mut violations = Vec::new();
        let mut probe = store.clone();
        for event in events {
            probe.apply_feed_event(event.clone());
            let once = (probe.snapshot(), probe.total());
            probe.apply_feed_event(event.clone());
            let twice = (probe.snapshot(), probe.total());
            if once != twice {
                violations.push(InvariantViolation::NotIdempotent {
                    view: view.to_string(),
                    id: event.id().clone(),
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Every visible row equals the stored row. Reporter relations are not
    /// compared: a live insert keeps the placeholder until the next read.
    #[must_use]
    pub fn check_feed_convergence(state: &ViewState, source: &[IncidentRecord]) -> OracleResult {
        let by_id: BTreeMap<&IncidentId, &IncidentRecord> =
            source.iter().map(|record| (record.id(), record)).collect();
        let mut violations = Vec::new();
        for record in &state.records {
            let detail = match by_id.get(record.id()) {
                None => Some("removed from the store".to_string()),
                Some(stored) if stored.row != record.row => Some(format!(
                    "view has {} sev {}, store has {} sev {}",
                    record.row.status, record.row.severity, stored.row.status, stored.row.severity
                )),
                Some(_) => None,
            };
            if let Some(detail) = detail {
                violations.push(InvariantViolation::Diverged {
                    view: state.name.clone(),
                    id: record.id().clone(),
                    detail,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// A view that has just re-read holds exactly the store's page.
    #[must_use]
    pub fn check_page(state: &ViewState, source: &[IncidentRecord]) -> OracleResult {
        let mut matching: Vec<&IncidentRecord> =
            source.iter().filter(|record| state.filter.matches(record)).collect();
        matching.sort_by_key(|record| record.order_key());
        let expected_total = matching.len() as u64;
        let offset = usize::try_from(state.request.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(state.request.page_size).unwrap_or(usize::MAX);
        let page: Vec<&IncidentRecord> = matching.into_iter().skip(offset).take(limit).collect();

        let mut violations = Vec::new();
        let same_page = page.len() == state.records.len()
            && page.iter().zip(&state.records).all(|(a, b)| *a == b);
        if !same_page {
            violations.push(InvariantViolation::PageMismatch {
                view: state.name.clone(),
                expected: page.iter().map(|record| record.id().clone()).collect(),
                actual: state.records.iter().map(|record| record.id().clone()).collect(),
            });
        }
        if expected_total != state.total {
            violations.push(InvariantViolation::TotalMismatch {
                view: state.name.clone(),
                expected: expected_total,
                actual: state.total,
            });
        }
        OracleResult::from_violations(violations)
    }
}
