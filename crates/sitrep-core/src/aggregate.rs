use serde::Serialize;

use crate::model::IncidentRecord;

/// Dashboard counters derived from the loaded records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total: usize,
    /// Records at or above the critical severity threshold.
    pub critical: usize,
    pub victims: u64,
    /// Records not yet archived.
    pub active: usize,
}

pub fn summarize<'a>(
    records: impl IntoIterator<Item = &'a IncidentRecord>,
    critical_threshold: u8,
) -> DashboardStats {
    records
        .into_iter()
        .fold(DashboardStats::default(), |mut stats, record| {
            stats.total += 1;
            if record.row.severity >= critical_threshold {
                stats.critical += 1;
            }
            stats.victims += u64::from(record.row.victim_count);
            if !record.status().is_archival() {
                stats.active += 1;
            }
            stats
        })
}
