//! `sitrep stats`: dashboard counters for the loaded active page.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use sitrep_core::aggregate::DashboardStats;
use sitrep_core::config::EngineConfig;
use sitrep_core::query::ViewScope;

use crate::cmd::list::ListArgs;
use crate::desk::Desk;
use crate::output::{OutputMode, pretty_kv, pretty_section, render};

#[derive(Debug, Serialize)]
struct StatsOutput {
    #[serde(flatten)]
    stats: DashboardStats,
    /// Matching incidents in the store, loaded or not.
    matching: u64,
    critical_threshold: u8,
}

pub fn run_stats(
    args: &ListArgs,
    engine: EngineConfig,
    output: OutputMode,
    project_root: &Path,
) -> Result<()> {
    let desk = Desk::open(project_root, engine, output)?;
    let view = desk.view(args.request(ViewScope::Active, desk.page_size(args.page_size)))?;

    let out = StatsOutput {
        stats: view.stats(),
        matching: view.total(),
        critical_threshold: desk.engine.stats.critical_threshold,
    };

    render(output, &out, |out, w| {
        if output == OutputMode::Pretty {
            pretty_section(w, "Dashboard")?;
            pretty_kv(w, "Loaded", out.stats.total.to_string())?;
            pretty_kv(w, "Matching", out.matching.to_string())?;
            pretty_kv(
                w,
                "Critical",
                format!("{} (severity >= {})", out.stats.critical, out.critical_threshold),
            )?;
            pretty_kv(w, "Victims", out.stats.victims.to_string())?;
            pretty_kv(w, "Active", out.stats.active.to_string())
        } else {
            writeln!(
                w,
                "loaded={} matching={} critical={} victims={} active={}",
                out.stats.total, out.matching, out.stats.critical, out.stats.victims, out.stats.active
            )
        }
    })
}
