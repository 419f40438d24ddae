//! Paginated, filtered reads of incident records.
//!
//! A [`PageRequest`] names a page of the view. The severity bucket, search
//! term and scope are evaluated by the backing store so that `total` counts
//! the filtered set. [`ViewFilter`] evaluates the same predicate client-side;
//! the reconciler uses it to decide whether a feed insert or an optimistic
//! mutation keeps a record visible.
//!
//! [`QueryExecutor`] wraps an [`IncidentSource`] and never propagates store
//! failures: a failed read yields an empty page flagged `degraded`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::model::{IncidentId, IncidentRecord, ParseEnumError, Status};
use crate::ports::IncidentSource;

// ---------------------------------------------------------------------------
// Severity buckets
// ---------------------------------------------------------------------------

/// Closed set of severity filters offered by the desk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityBucket {
    #[default]
    All,
    Critical,
    High,
    Moderate,
    Low,
}

/// Numeric condition a bucket maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityRange {
    AtLeast(u8),
    Exactly(u8),
}

impl SeverityRange {
    #[must_use]
    pub const fn contains(self, severity: u8) -> bool {
        match self {
            Self::AtLeast(min) => severity >= min,
            Self::Exactly(value) => severity == value,
        }
    }
}

impl SeverityBucket {
    pub const ALL: [Self; 5] = [Self::All, Self::Critical, Self::High, Self::Moderate, Self::Low];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Critical => "critical",
            Self::High => "high",
            Self::Moderate => "moderate",
            Self::Low => "low",
        }
    }

    /// `None` for [`SeverityBucket::All`], which applies no condition.
    #[must_use]
    pub const fn range(self) -> Option<SeverityRange> {
        match self {
            Self::All => None,
            Self::Critical => Some(SeverityRange::AtLeast(4)),
            Self::High => Some(SeverityRange::Exactly(3)),
            Self::Moderate => Some(SeverityRange::Exactly(2)),
            Self::Low => Some(SeverityRange::Exactly(1)),
        }
    }

    #[must_use]
    pub fn admits(self, severity: u8) -> bool {
        self.range().is_none_or(|range| range.contains(severity))
    }
}

impl fmt::Display for SeverityBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeverityBucket {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "" => Ok(Self::All),
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "moderate" | "medium" => Ok(Self::Moderate),
            "low" => Ok(Self::Low),
            _ => Err(ParseEnumError {
                expected: "severity",
                got: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Which side of the archival split a view shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewScope {
    #[default]
    Active,
    Completed,
    All,
}

impl ViewScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::All => "all",
        }
    }

    #[must_use]
    pub const fn admits(self, status: Status) -> bool {
        match self {
            Self::Active => !status.is_archival(),
            Self::Completed => status.is_archival(),
            Self::All => true,
        }
    }

    /// Whether moving to `status` can bring a record into this scope that
    /// was outside it before.
    #[must_use]
    pub const fn entered_by(self, status: Status) -> bool {
        matches!(self, Self::Completed) && status.is_archival()
    }
}

impl fmt::Display for ViewScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewScope {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "completed" | "archived" => Ok(Self::Completed),
            "all" => Ok(Self::All),
            _ => Err(ParseEnumError {
                expected: "scope",
                got: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request rejected before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageRequestError {
    #[error("page numbers start at 1")]
    ZeroPage,
    #[error("page size must be positive")]
    ZeroPageSize,
}

impl PageRequestError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ZeroPage | Self::ZeroPageSize => ErrorCode::InvalidPageRequest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
    pub search: Option<String>,
    pub severity: SeverityBucket,
    pub scope: ViewScope,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 8,
            search: None,
            severity: SeverityBucket::All,
            scope: ViewScope::Active,
        }
    }
}

impl PageRequest {
    #[must_use]
    pub fn scoped(scope: ViewScope, page_size: u32) -> Self {
        Self {
            page_size,
            scope,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    #[must_use]
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    #[must_use]
    pub const fn with_severity(mut self, severity: SeverityBucket) -> Self {
        self.severity = severity;
        self
    }

    pub const fn validate(&self) -> Result<(), PageRequestError> {
        if self.page == 0 {
            return Err(PageRequestError::ZeroPage);
        }
        if self.page_size == 0 {
            return Err(PageRequestError::ZeroPageSize);
        }
        Ok(())
    }

    /// Row offset of the first record on this page.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    /// Trimmed search term, or `None` when the search is blank.
    #[must_use]
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }
}

/// The slice of the ordered, filtered set a store holds: `offset` rows are
/// skipped and at most `limit` are kept. The default window is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageWindow {
    pub offset: u64,
    pub limit: Option<usize>,
}

impl PageWindow {
    #[must_use]
    pub fn from_request(request: &PageRequest) -> Self {
        Self {
            offset: request.offset(),
            limit: usize::try_from(request.page_size).ok(),
        }
    }

    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        self.offset > 0 || self.limit.is_some()
    }
}

// ---------------------------------------------------------------------------
// Client-side predicate
// ---------------------------------------------------------------------------

/// The request's filter predicate, evaluated locally.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewFilter {
    scope: ViewScope,
    severity: SeverityBucket,
    needle: Option<String>,
}

impl ViewFilter {
    #[must_use]
    pub fn from_request(request: &PageRequest) -> Self {
        Self {
            scope: request.scope,
            severity: request.severity,
            needle: request.search_term().map(str::to_lowercase),
        }
    }

    #[must_use]
    pub const fn scope(&self) -> ViewScope {
        self.scope
    }

    #[must_use]
    pub fn matches(&self, record: &IncidentRecord) -> bool {
        if !self.scope.admits(record.row.status) || !self.severity.admits(record.row.severity) {
            return false;
        }
        let Some(needle) = &self.needle else {
            return true;
        };
        if record.row.category.to_lowercase().contains(needle.as_str()) {
            return true;
        }
        // The completed list also finds records by reporting officer.
        self.scope == ViewScope::Completed && record.reporter.name.to_lowercase().contains(needle.as_str())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// One page of the view plus the size of the whole filtered set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Page {
    pub records: Vec<IncidentRecord>,
    pub total: u64,
    /// The store could not be read; `records` is empty and `total` is 0.
    pub degraded: bool,
}

impl Page {
    #[must_use]
    pub fn degraded() -> Self {
        Self {
            records: Vec::new(),
            total: 0,
            degraded: true,
        }
    }
}

pub struct QueryExecutor<'a, S: IncidentSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: IncidentSource + ?Sized> QueryExecutor<'a, S> {
    pub const fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Run a page read.
    ///
    /// # Errors
    ///
    /// Only request validation fails; store failures produce a degraded page.
    pub fn run(&self, request: &PageRequest) -> Result<Page, PageRequestError> {
        request.validate()?;
        match self.source.fetch_page(request) {
            Ok((records, total)) => {
                debug!(
                    scope = %request.scope,
                    page = request.page,
                    returned = records.len(),
                    total,
                    "bulk read"
                );
                Ok(Page {
                    records,
                    total,
                    degraded: false,
                })
            }
            Err(err) => {
                warn!(
                    code = ErrorCode::StoreReadFailed.code(),
                    scope = %request.scope,
                    error = %err,
                    "bulk read failed; showing empty page"
                );
                Ok(Page::degraded())
            }
        }
    }

    /// Point read. Failures are logged and treated as not found.
    pub fn fetch_one(&self, id: &IncidentId) -> Option<IncidentRecord> {
        match self.source.fetch_incident(id) {
            Ok(found) => found,
            Err(err) => {
                warn!(code = ErrorCode::StoreReadFailed.code(), %id, error = %err, "point read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeoPoint, IncidentRow, Reporter, micros_to_utc};
    use anyhow::{Result, bail};

    fn record(id: &str, category: &str, severity: u8, status: Status, reporter: &str) -> IncidentRecord {
        IncidentRow {
            id: IncidentId::new(id),
            category: category.to_string(),
            severity,
            position: GeoPoint::new(7.29, 80.63),
            victim_count: 0,
            reported_at: micros_to_utc(1_700_000_000_000_000).expect("valid"),
            status,
            evidence_ref: None,
            reporter_id: None,
        }
        .hydrate(Reporter::new(reporter, None))
    }

    struct Failing;

    impl IncidentSource for Failing {
        fn fetch_page(&self, _request: &PageRequest) -> Result<(Vec<IncidentRecord>, u64)> {
            bail!("connection reset")
        }

        fn fetch_incident(&self, _id: &IncidentId) -> Result<Option<IncidentRecord>> {
            bail!("connection reset")
        }
    }

    #[test]
    fn bucket_ranges() {
        assert!(SeverityBucket::Critical.admits(4));
        assert!(SeverityBucket::Critical.admits(5));
        assert!(!SeverityBucket::Critical.admits(3));
        assert!(SeverityBucket::High.admits(3));
        assert!(!SeverityBucket::High.admits(4));
        assert!(SeverityBucket::Low.admits(1));
        assert!(SeverityBucket::All.admits(0));
        assert_eq!("Moderate".parse::<SeverityBucket>(), Ok(SeverityBucket::Moderate));
        assert!("severe".parse::<SeverityBucket>().is_err());
    }

    #[test]
    fn offset_math() {
        let req = PageRequest::default().with_page(3);
        assert_eq!(req.offset(), 16);
        assert_eq!(PageRequest::default().offset(), 0);
    }

    #[test]
    fn window_follows_the_request() {
        let window = PageWindow::from_request(&PageRequest::scoped(ViewScope::Active, 5).with_page(3));
        assert_eq!(window.offset, 10);
        assert_eq!(window.limit, Some(5));
        assert!(window.is_bounded());
        assert!(!PageWindow::default().is_bounded());
    }

    #[test]
    fn zero_page_and_size_are_rejected() {
        assert_eq!(PageRequest::default().with_page(0).validate(), Err(PageRequestError::ZeroPage));
        let req = PageRequest::scoped(ViewScope::Active, 0);
        assert_eq!(req.validate(), Err(PageRequestError::ZeroPageSize));
        assert_eq!(PageRequestError::ZeroPage.code(), ErrorCode::InvalidPageRequest);
    }

    #[test]
    fn blank_search_is_no_filter() {
        let req = PageRequest::default().with_search("   ");
        assert_eq!(req.search_term(), None);
        let filter = ViewFilter::from_request(&req);
        assert!(filter.matches(&record("a", "Flood", 2, Status::Pending, "X")));
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let filter = ViewFilter::from_request(&PageRequest::default().with_search(" FLO "));
        assert!(filter.matches(&record("a", "Flash flood", 2, Status::Pending, "X")));
        assert!(!filter.matches(&record("b", "Landslide", 2, Status::Pending, "X")));
    }

    #[test]
    fn active_scope_excludes_completed() {
        let filter = ViewFilter::from_request(&PageRequest::default());
        assert!(filter.matches(&record("a", "Flood", 2, Status::Resolved, "X")));
        assert!(!filter.matches(&record("a", "Flood", 2, Status::Completed, "X")));
    }

    #[test]
    fn completed_scope_searches_reporter_name() {
        let req = PageRequest::scoped(ViewScope::Completed, 8).with_search("silva");
        let filter = ViewFilter::from_request(&req);
        assert!(filter.matches(&record("a", "Flood", 2, Status::Completed, "K. Silva")));
        assert!(!filter.matches(&record("b", "Flood", 2, Status::Completed, "Perera")));

        let active = ViewFilter::from_request(&PageRequest::default().with_search("silva"));
        assert!(!active.matches(&record("a", "Flood", 2, Status::Pending, "K. Silva")));
    }

    #[test]
    fn scope_entry() {
        assert!(ViewScope::Completed.entered_by(Status::Completed));
        assert!(!ViewScope::Active.entered_by(Status::Pending));
        assert!(!ViewScope::Completed.entered_by(Status::Resolved));
    }

    #[test]
    fn store_failure_degrades_instead_of_erroring() {
        let exec = QueryExecutor::new(&Failing);
        let page = exec.run(&PageRequest::default()).expect("validation passes");
        assert!(page.degraded);
        assert!(page.records.is_empty());
        assert_eq!(page.total, 0);
        assert_eq!(exec.fetch_one(&IncidentId::new("a")), None);
    }

    #[test]
    fn invalid_request_never_reaches_store() {
        let exec = QueryExecutor::new(&Failing);
        let err = exec.run(&PageRequest::default().with_page(0)).expect_err("must reject");
        assert_eq!(err, PageRequestError::ZeroPage);
    }
}
