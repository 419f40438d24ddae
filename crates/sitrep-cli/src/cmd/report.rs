//! `sitrep report`: file an incident the way a field officer's submission
//! lands in the store.

use std::path::Path;

use anyhow::{Context as _, Result, bail};
use blake3::Hasher;
use chrono::{DateTime, Utc};
use clap::Args;
use sitrep_core::config::EngineConfig;
use sitrep_core::model::{GeoPoint, IncidentId, IncidentRow, Reporter, Status};
use sitrep_core::ports::OfficerDirectory;

use crate::desk::Desk;
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Incident category, e.g. `flood` or `landslide`.
    #[arg(long)]
    pub category: String,

    /// Severity from 1 (low) to 5 (critical).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    pub severity: u8,

    #[arg(long, default_value = "0")]
    pub victims: u32,

    #[arg(long, default_value = "0.0", allow_negative_numbers = true)]
    pub lat: f64,

    #[arg(long, default_value = "0.0", allow_negative_numbers = true)]
    pub lon: f64,

    /// Reporting officer id. Unknown ids are stored as-is and shown with the
    /// placeholder reporter.
    #[arg(long)]
    pub officer: Option<String>,

    /// Reference to uploaded evidence.
    #[arg(long)]
    pub evidence: Option<String>,

    /// Report time (RFC 3339). Defaults to now.
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,
}

/// Derive an incident id from the submission.
pub fn incident_id(category: &str, officer: Option<&str>, reported_at: DateTime<Utc>) -> IncidentId {
    let mut hasher = Hasher::new();
    hasher.update(b"incident:");
    hasher.update(category.as_bytes());
    hasher.update(b"\0");
    hasher.update(officer.unwrap_or_default().as_bytes());
    hasher.update(b"\0");
    hasher.update(&reported_at.timestamp_micros().to_le_bytes());
    hasher.update(&Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let hex = hasher.finalize().to_hex().to_string();
    IncidentId::new(format!("inc-{}", &hex[..8]))
}

pub fn run_report(
    args: &ReportArgs,
    engine: EngineConfig,
    output: OutputMode,
    project_root: &Path,
) -> Result<()> {
    let category = args.category.trim();
    if category.is_empty() {
        bail!("category must not be empty");
    }
    let desk = Desk::open(project_root, engine, output)?;

    let reported_at = args.at.unwrap_or_else(Utc::now);
    let row = IncidentRow {
        id: incident_id(category, args.officer.as_deref(), reported_at),
        category: category.to_string(),
        severity: args.severity,
        position: GeoPoint::new(args.lat, args.lon),
        victim_count: args.victims,
        reported_at,
        status: Status::Pending,
        evidence_ref: args.evidence.clone(),
        reporter_id: args.officer.clone(),
    };
    desk.backend
        .submit_incident(&row)
        .with_context(|| format!("Failed to store incident {}", row.id))?;

    let reporter = match &row.reporter_id {
        Some(officer) => desk.backend.lookup_officer(officer)?,
        None => None,
    };
    let known_officer = reporter.is_some();
    let record = row.hydrate(
        reporter.unwrap_or_else(|| Reporter::placeholder(&desk.engine.backfill.placeholder_name)),
    );

    render(output, &record, |record, w| {
        writeln!(
            w,
            "✓ Reported {} ({}, severity {})",
            record.row.id, record.row.category, record.row.severity
        )?;
        if !known_officer && record.row.reporter_id.is_some() {
            writeln!(w, "  note: officer not on the roster; shown as {}", record.reporter.name)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incident_ids_are_prefixed_and_short() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).expect("valid");
        let id = incident_id("flood", Some("off-1"), at);
        assert!(id.as_str().starts_with("inc-"));
        assert_eq!(id.as_str().len(), 12);
        assert!(id.as_str()[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_submission_twice_gets_distinct_ids() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).expect("valid");
        let first = incident_id("flood", None, at);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let second = incident_id("flood", None, at);
        assert_ne!(first, second);
    }
}
