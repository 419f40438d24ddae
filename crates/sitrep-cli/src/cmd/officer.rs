//! `sitrep officer add` and `sitrep officers`: the field roster.

use std::path::Path;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use sitrep_core::config::EngineConfig;
use sitrep_core::model::Officer;
use sitrep_core::ports::OfficerDirectory;

use crate::desk::Desk;
use crate::output::{OutputMode, pretty_section, render};

#[derive(Args, Debug)]
pub struct OfficerArgs {
    #[command(subcommand)]
    pub command: OfficerCommand,
}

#[derive(Subcommand, Debug)]
pub enum OfficerCommand {
    /// Add an officer, or update one already on the roster.
    Add(OfficerAddArgs),
}

#[derive(Args, Debug)]
pub struct OfficerAddArgs {
    /// Officer id referenced by incident reports.
    pub id: String,

    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub phone: Option<String>,

    #[arg(long, default_value = "officer")]
    pub role: String,
}

pub fn run_officer_add(
    args: &OfficerAddArgs,
    engine: EngineConfig,
    output: OutputMode,
    project_root: &Path,
) -> Result<()> {
    if args.id.trim().is_empty() || args.name.trim().is_empty() {
        bail!("officer id and name must not be empty");
    }
    let desk = Desk::open(project_root, engine, output)?;
    let officer = Officer {
        id: args.id.trim().to_string(),
        name: args.name.trim().to_string(),
        phone: args.phone.clone(),
        role: args.role.clone(),
    };
    desk.backend.upsert_officer(&officer)?;

    render(output, &officer, |officer, w| {
        writeln!(w, "✓ {} on the roster as {}", officer.id, officer.name)
    })
}

pub fn run_officers(engine: EngineConfig, output: OutputMode, project_root: &Path) -> Result<()> {
    let desk = Desk::open(project_root, engine, output)?;
    let roster = desk.backend.list_officers()?;

    render(output, &roster, |roster, w| {
        if output == OutputMode::Pretty {
            pretty_section(w, &format!("Roster ({})", roster.len()))?;
        }
        if roster.is_empty() {
            return writeln!(w, "no officers on the roster");
        }
        for officer in roster {
            writeln!(
                w,
                "{:<10} {:<24} {:<10} {}",
                officer.id,
                officer.name,
                officer.role,
                officer.phone.as_deref().unwrap_or("-")
            )?;
        }
        Ok(())
    })
}
