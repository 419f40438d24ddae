use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::{fmt, str::FromStr};

/// Reporter name used when the officer relation cannot be hydrated.
pub const PLACEHOLDER_REPORTER: &str = "Unknown Officer";

/// Opaque incident identifier, stable across bulk reads and feed events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IncidentId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for IncidentId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// The five lifecycle states of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Dispatched,
    OnSite,
    Resolved,
    Completed,
}

impl Status {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Dispatched,
        Self::OnSite,
        Self::Resolved,
        Self::Completed,
    ];

    /// Persisted lowercase form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::OnSite => "on_site",
            Self::Resolved => "resolved",
            Self::Completed => "completed",
        }
    }

    /// Upper-case label as shown on the command desk.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Dispatched => "DISPATCHED",
            Self::OnSite => "ON_SITE",
            Self::Resolved => "RESOLVED",
            Self::Completed => "COMPLETED",
        }
    }

    /// Whether this status removes the incident from the active view.
    #[must_use]
    pub const fn is_archival(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// The forward step in the nominal lifecycle, if any.
    ///
    /// Operators may still move an incident to any status directly; this is
    /// only the "advance" suggestion.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Dispatched),
            Self::Dispatched => Some(Self::OnSite),
            Self::OnSite => Some(Self::Resolved),
            Self::Resolved => Some(Self::Completed),
            Self::Completed => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "on_site" | "on-site" | "onsite" => Ok(Self::OnSite),
            "resolved" => Ok(Self::Resolved),
            "completed" => Ok(Self::Completed),
            _ => Err(ParseEnumError {
                expected: "status",
                got: s.to_string(),
            }),
        }
    }
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

/// Signed decimal-degree position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Denormalized officer relation carried on every visible record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reporter {
    pub name: String,
    pub phone: Option<String>,
}

impl Reporter {
    #[must_use]
    pub fn new(name: impl Into<String>, phone: Option<String>) -> Self {
        Self {
            name: name.into(),
            phone,
        }
    }

    /// Stand-in used when the officer lookup fails or finds nothing.
    #[must_use]
    pub fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phone: None,
        }
    }
}

/// An incident row exactly as the backing store holds it, without the
/// officer join.
///
/// This is what the change feed delivers for inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRow {
    pub id: IncidentId,
    pub category: String,
    pub severity: u8,
    pub position: GeoPoint,
    pub victim_count: u32,
    pub reported_at: DateTime<Utc>,
    pub status: Status,
    pub evidence_ref: Option<String>,
    pub reporter_id: Option<String>,
}

impl IncidentRow {
    /// Attach the officer relation, producing a record the view can show.
    #[must_use]
    pub fn hydrate(self, reporter: Reporter) -> IncidentRecord {
        IncidentRecord {
            row: self,
            reporter,
        }
    }
}

/// A hydrated incident: the stored row plus its reporter relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    #[serde(flatten)]
    pub row: IncidentRow,
    pub reporter: Reporter,
}

impl IncidentRecord {
    #[must_use]
    pub const fn id(&self) -> &IncidentId {
        &self.row.id
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        self.row.status
    }

    #[must_use]
    pub fn order_key(&self) -> OrderKey {
        OrderKey::new(self.row.reported_at, self.row.id.clone())
    }
}

/// Sort key for the view ordering: newest report first, ties by id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey(Reverse<DateTime<Utc>>, IncidentId);

impl OrderKey {
    #[must_use]
    pub const fn new(reported_at: DateTime<Utc>, id: IncidentId) -> Self {
        Self(Reverse(reported_at), id)
    }

    #[must_use]
    pub const fn id(&self) -> &IncidentId {
        &self.1
    }
}

/// Partial update: only the fields that are `Some` are carried.
///
/// `evidence_ref` and `reporter_id` are doubly optional so a patch can clear
/// them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPatch {
    pub category: Option<String>,
    pub severity: Option<u8>,
    pub position: Option<GeoPoint>,
    pub victim_count: Option<u32>,
    pub reported_at: Option<DateTime<Utc>>,
    pub status: Option<Status>,
    pub evidence_ref: Option<Option<String>>,
    pub reporter_id: Option<Option<String>>,
}

impl FieldPatch {
    #[must_use]
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// The patch can change which views hold a row or where it sorts.
    #[must_use]
    pub const fn moves_rows(&self) -> bool {
        self.category.is_some()
            || self.severity.is_some()
            || self.reported_at.is_some()
            || self.status.is_some()
            || self.reporter_id.is_some()
    }

    /// A patch setting every field to `row`'s value. Applied to a stored row,
    /// it yields exactly the fields a re-submission changes.
    #[must_use]
    pub fn replacing(row: &IncidentRow) -> Self {
        Self {
            category: Some(row.category.clone()),
            severity: Some(row.severity),
            position: Some(row.position),
            victim_count: Some(row.victim_count),
            reported_at: Some(row.reported_at),
            status: Some(row.status),
            evidence_ref: Some(row.evidence_ref.clone()),
            reporter_id: Some(row.reporter_id.clone()),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge onto `row`, returning the subset of fields that actually changed.
    pub fn apply(&self, row: &mut IncidentRow) -> Self {
        Self {
            category: merge(self.category.as_ref(), &mut row.category),
            severity: merge(self.severity.as_ref(), &mut row.severity),
            position: merge(self.position.as_ref(), &mut row.position),
            victim_count: merge(self.victim_count.as_ref(), &mut row.victim_count),
            reported_at: merge(self.reported_at.as_ref(), &mut row.reported_at),
            status: merge(self.status.as_ref(), &mut row.status),
            evidence_ref: merge(self.evidence_ref.as_ref(), &mut row.evidence_ref),
            reporter_id: merge(self.reporter_id.as_ref(), &mut row.reporter_id),
        }
    }
}

fn merge<T: Clone + PartialEq>(incoming: Option<&T>, slot: &mut T) -> Option<T> {
    match incoming {
        Some(value) if *value != *slot => {
            slot.clone_from(value);
            Some(value.clone())
        }
        _ => None,
    }
}

/// Convert a microsecond Unix timestamp (the storage format) to UTC.
#[must_use]
pub fn micros_to_utc(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok()?;
    Utc.timestamp_opt(secs, nanos).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str) -> IncidentRow {
        IncidentRow {
            id: IncidentId::new(id),
            category: "Flood".to_string(),
            severity: 3,
            position: GeoPoint::new(6.9271, 79.8612),
            victim_count: 4,
            reported_at: micros_to_utc(1_700_000_000_000_000).expect("valid timestamp"),
            status: Status::Pending,
            evidence_ref: Some("evidence/1.jpg".to_string()),
            reporter_id: Some("off-1".to_string()),
        }
    }

    #[test]
    fn status_parse_accepts_case_and_aliases() {
        assert_eq!("PENDING".parse::<Status>(), Ok(Status::Pending));
        assert_eq!("On-Site".parse::<Status>(), Ok(Status::OnSite));
        assert_eq!(" resolved ".parse::<Status>(), Ok(Status::Resolved));
        assert!("closed".parse::<Status>().is_err());
    }

    #[test]
    fn status_round_trips_through_as_str() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>(), Ok(status));
        }
    }

    #[test]
    fn only_completed_is_archival() {
        let archival: Vec<Status> = Status::ALL.into_iter().filter(|s| s.is_archival()).collect();
        assert_eq!(archival, vec![Status::Completed]);
        assert_eq!(Status::Resolved.next(), Some(Status::Completed));
        assert_eq!(Status::Completed.next(), None);
    }

    #[test]
    fn patch_touches_only_carried_fields() {
        let mut target = row("inc-1");
        let before = target.clone();

        let changed = FieldPatch::status(Status::Dispatched).apply(&mut target);

        assert_eq!(changed, FieldPatch::status(Status::Dispatched));
        assert_eq!(target.status, Status::Dispatched);
        assert_eq!(target.category, before.category);
        assert_eq!(target.evidence_ref, before.evidence_ref);
        assert_eq!(target.reporter_id, before.reporter_id);
    }

    #[test]
    fn patch_reports_no_change_when_values_match() {
        let mut target = row("inc-1");
        let patch = FieldPatch {
            severity: Some(3),
            status: Some(Status::Pending),
            ..FieldPatch::default()
        };
        assert!(patch.apply(&mut target).is_empty());
    }

    #[test]
    fn patch_can_clear_optional_fields() {
        let mut target = row("inc-1");
        let patch = FieldPatch {
            evidence_ref: Some(None),
            ..FieldPatch::default()
        };
        let changed = patch.apply(&mut target);
        assert_eq!(target.evidence_ref, None);
        assert_eq!(changed.evidence_ref, Some(None));
    }

    #[test]
    fn order_key_sorts_newest_first_then_by_id() {
        let t0 = micros_to_utc(1_000_000).expect("valid");
        let t1 = micros_to_utc(2_000_000).expect("valid");
        let mut keys = vec![
            OrderKey::new(t0, IncidentId::new("a")),
            OrderKey::new(t1, IncidentId::new("b")),
            OrderKey::new(t1, IncidentId::new("a")),
        ];
        keys.sort();
        let ids: Vec<&str> = keys.iter().map(|k| k.id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "a"]);
        assert_eq!(keys[0], OrderKey::new(t1, IncidentId::new("a")));
    }

    #[test]
    fn micros_conversion_handles_negative_values() {
        let before_epoch = micros_to_utc(-1).expect("valid");
        assert_eq!(before_epoch.timestamp_micros(), -1);
    }
}
