//! `sitrep status`: move an incident to a new status from the desk.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use serde::Serialize;
use sitrep_core::IncidentView;
use sitrep_core::config::EngineConfig;
use sitrep_core::error::ErrorCode;
use sitrep_core::model::{IncidentId, Status};
use sitrep_core::ports::IncidentSource;
use sitrep_core::query::{PageRequest, ViewScope};
use sitrep_core::transition::{TransitionOutcome, parse_target};
use sitrep_sqlite::SqliteBackend;
use tracing::debug;

use crate::desk::Desk;
use crate::output::{CliError, OutputMode, render, render_error};

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub id: String,

    /// Target status: pending, dispatched, on_site, resolved, completed.
    pub status: String,

    /// After resolving, wait out the archive delay and archive the incident.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    id: IncidentId,
    from: Status,
    to: Status,
    archival_scheduled: bool,
    archived: bool,
}

/// Page through an all-scope view until `id` is loaded.
fn locate(view: &mut IncidentView<SqliteBackend>, id: &IncidentId) -> Result<bool> {
    loop {
        if view.get(id).is_some() {
            return Ok(true);
        }
        let request = view.request().clone();
        if request.offset() + u64::from(request.page_size) >= view.total() {
            return Ok(false);
        }
        let next = request.page + 1;
        debug!(%id, page = next, "incident not on page; reading the next one");
        view.set_request(request.with_page(next))
            .map_err(|err| anyhow::anyhow!("{}: {err}", err.code().code()))?;
    }
}

pub fn run_status(
    args: &StatusArgs,
    engine: EngineConfig,
    output: OutputMode,
    project_root: &Path,
) -> Result<()> {
    let desk = Desk::open(project_root, engine, output)?;
    let id = IncidentId::new(args.id.trim());

    let target = match parse_target(&args.status) {
        Ok(target) => target,
        Err(err) => {
            render_error(output, &CliError::from_code(err.code(), err.to_string()))?;
            bail!("{}: {err}", err.code().code());
        }
    };

    let Some(current) = desk.backend.fetch_incident(&id)? else {
        render_error(
            output,
            &CliError::from_code(ErrorCode::IncidentNotFound, format!("incident '{id}' not found")),
        )?;
        bail!("{}: incident '{id}' not found", ErrorCode::IncidentNotFound.code());
    };

    let mut view = desk.view(PageRequest::scoped(ViewScope::All, desk.page_size(None)))?;
    if !locate(&mut view, &id)? {
        debug!(%id, "incident not loaded; writing without an optimistic overlay");
    }

    let TransitionOutcome::Confirmed { archival_scheduled } = view.transition_to(&id, target) else {
        render_error(
            output,
            &CliError::from_code(
                ErrorCode::StoreWriteFailed,
                format!("status write for '{id}' failed"),
            ),
        )?;
        bail!("{}: status write for '{id}' failed", ErrorCode::StoreWriteFailed.code());
    };

    let mut archived = false;
    if args.wait && archival_scheduled {
        std::thread::sleep(desk.engine.archive.delay() + Duration::from_millis(10));
        desk.backend.poll_changes()?;
        view.pump();
        archived = view.tick().contains(&id);
    }

    let out = StatusOutput {
        to: if archived { Status::Completed } else { target },
        id,
        from: current.status(),
        archival_scheduled,
        archived,
    };

    render(output, &out, |out, w| {
        writeln!(w, "✓ {}: {} -> {}", out.id, out.from, out.to)?;
        if out.archived {
            writeln!(w, "  archived after the resolve delay")?;
        } else if out.archival_scheduled {
            writeln!(w, "  will archive once the resolve delay passes on a live desk")?;
        }
        Ok(())
    })
}
