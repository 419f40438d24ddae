//! Capabilities the engine needs from a backing store.
//!
//! The engine depends only on these traits. Any store that can answer a
//! filtered page read, a point lookup, a status write and a change
//! subscription is a [`Backend`].

use anyhow::Result;

use crate::feed::Subscription;
use crate::model::{IncidentId, IncidentRecord, Officer, Reporter, Status};
use crate::query::PageRequest;

/// Collection name the incident feed is subscribed under.
pub const INCIDENTS_COLLECTION: &str = "incident_reports";

pub trait IncidentSource: Send + Sync {
    /// Filtered, ordered page plus the size of the whole filtered set.
    fn fetch_page(&self, request: &PageRequest) -> Result<(Vec<IncidentRecord>, u64)>;

    fn fetch_incident(&self, id: &IncidentId) -> Result<Option<IncidentRecord>>;
}

pub trait OfficerDirectory: Send + Sync {
    /// Point lookup of the reporter relation by officer id.
    fn lookup_officer(&self, officer_id: &str) -> Result<Option<Reporter>>;

    /// Full roster ordered by name.
    fn list_officers(&self) -> Result<Vec<Officer>>;
}

pub trait StatusWriter: Send + Sync {
    fn update_status(&self, id: &IncidentId, status: Status) -> Result<()>;
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, collection: &str) -> Result<Subscription>;
}

/// Everything a view needs.
pub trait Backend: IncidentSource + OfficerDirectory + StatusWriter + ChangeFeed {}

impl<T> Backend for T where T: IncidentSource + OfficerDirectory + StatusWriter + ChangeFeed + ?Sized {}
