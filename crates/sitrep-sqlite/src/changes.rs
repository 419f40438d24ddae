//! Reading the trigger-maintained change log as feed events.

use anyhow::{Context, Result, anyhow, bail};
use rusqlite::{Connection, params};
use serde::Deserialize;

use sitrep_core::feed::FeedEvent;
use sitrep_core::model::{
    FieldPatch, GeoPoint, IncidentId, IncidentRow, Status, micros_to_utc,
};

use crate::schema::mask;

/// One row of `change_log`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub seq: i64,
    pub op: String,
    pub incident_id: String,
    pub changed_mask: i64,
    pub payload: Option<String>,
}

/// Column snapshot the triggers serialize with `json_object`.
#[derive(Debug, Deserialize)]
struct RowPayload {
    incident_id: String,
    category: String,
    severity: u8,
    latitude: f64,
    longitude: f64,
    victim_count: u32,
    reported_at_us: i64,
    status: String,
    evidence_ref: Option<String>,
    reporter_id: Option<String>,
}

impl RowPayload {
    fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("decode change payload")
    }

    fn into_row(self) -> Result<IncidentRow> {
        let reported_at = micros_to_utc(self.reported_at_us)
            .ok_or_else(|| anyhow!("reported_at_us out of range: {}", self.reported_at_us))?;
        let status = self
            .status
            .parse::<Status>()
            .with_context(|| format!("incident {}", self.incident_id))?;
        Ok(IncidentRow {
            id: IncidentId::new(self.incident_id),
            category: self.category,
            severity: self.severity,
            position: GeoPoint::new(self.latitude, self.longitude),
            victim_count: self.victim_count,
            reported_at,
            status,
            evidence_ref: self.evidence_ref,
            reporter_id: self.reporter_id,
        })
    }
}

/// Highest sequence number written so far, or 0 for an empty log.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn latest_change_seq(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(change_seq), 0) FROM change_log",
        [],
        |row| row.get(0),
    )
    .context("read latest change seq")
}

/// Changes recorded after `after_seq`, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn read_changes(conn: &Connection, after_seq: i64) -> Result<Vec<ChangeRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT change_seq, op, incident_id, changed_mask, payload \
             FROM change_log WHERE change_seq > ?1 ORDER BY change_seq ASC",
        )
        .context("prepare change log query")?;
    let rows = stmt
        .query_map(params![after_seq], |row| {
            Ok(ChangeRow {
                seq: row.get(0)?,
                op: row.get(1)?,
                incident_id: row.get(2)?,
                changed_mask: row.get(3)?,
                payload: row.get(4)?,
            })
        })
        .context("execute change log query")?;

    let mut changes = Vec::new();
    for row in rows {
        changes.push(row.context("decode change row")?);
    }
    Ok(changes)
}

impl ChangeRow {
    /// Convert to the event the feed delivers.
    ///
    /// Updates carry only the fields flagged in `changed_mask`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown op or a payload that does not decode.
    pub fn to_event(&self) -> Result<FeedEvent> {
        match self.op.as_str() {
            "insert" => {
                let payload = self.payload_row()?;
                Ok(FeedEvent::Inserted(payload.into_row()?))
            }
            "update" => {
                let row = self.payload_row()?.into_row()?;
                Ok(FeedEvent::Updated {
                    id: row.id.clone(),
                    patch: patch_from_mask(self.changed_mask, row),
                })
            }
            "delete" => Ok(FeedEvent::Removed(IncidentId::new(self.incident_id.clone()))),
            other => bail!("unknown change op '{other}' at seq {}", self.seq),
        }
    }

    fn payload_row(&self) -> Result<RowPayload> {
        let raw = self
            .payload
            .as_deref()
            .ok_or_else(|| anyhow!("change {} has no payload", self.seq))?;
        RowPayload::parse(raw)
    }
}

fn patch_from_mask(bits: i64, row: IncidentRow) -> FieldPatch {
    let has = |bit: i64| bits & bit != 0;
    FieldPatch {
        category: has(mask::CATEGORY).then_some(row.category),
        severity: has(mask::SEVERITY).then_some(row.severity),
        position: has(mask::POSITION).then_some(row.position),
        victim_count: has(mask::VICTIMS).then_some(row.victim_count),
        reported_at: has(mask::REPORTED_AT).then_some(row.reported_at),
        status: has(mask::STATUS).then_some(row.status),
        evidence_ref: has(mask::EVIDENCE).then_some(row.evidence_ref),
        reporter_id: has(mask::REPORTER).then_some(row.reporter_id),
    }
}
