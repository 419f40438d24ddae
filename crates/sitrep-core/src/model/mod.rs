//! Incident and officer data model.
//!
//! [`IncidentRow`] is the record exactly as the store and the change feed
//! carry it. [`IncidentRecord`] adds the hydrated reporter relation, which only
//! the bulk query (via its join) or the relation backfiller can supply.

pub mod incident;
pub mod officer;

pub use incident::{
    FieldPatch, GeoPoint, IncidentId, IncidentRecord, IncidentRow, OrderKey, PLACEHOLDER_REPORTER,
    ParseEnumError, Reporter, Status, micros_to_utc,
};
pub use officer::{Officer, sort_roster};
