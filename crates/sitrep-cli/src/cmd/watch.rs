//! `sitrep watch`: a live view of the desk.
//!
//! Each poll reads new change-log rows into the feed, drains them into the
//! view and runs due archivals. The page is printed again whenever the view
//! revision or the connection state moves. A dropped feed is re-subscribed
//! and the page re-read once the store answers again.

use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use sitrep_core::IncidentView;
use sitrep_core::config::EngineConfig;
use sitrep_core::feed::ConnectionState;
use sitrep_core::model::{IncidentId, IncidentRecord};
use sitrep_core::query::ViewScope;
use sitrep_sqlite::SqliteBackend;
use tracing::{info, warn};

use crate::cmd::list::ListArgs;
use crate::desk::Desk;
use crate::output::{OutputMode, pretty_kv, pretty_section, render_list_to};

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub list: ListArgs,

    /// Watch the completed list instead of the active one.
    #[arg(long)]
    pub completed: bool,

    /// Milliseconds between polls of the change log.
    #[arg(long, default_value = "500")]
    pub interval_ms: u64,

    /// Stop after this many polls. Runs until interrupted when unset.
    #[arg(long)]
    pub polls: Option<u64>,
}

/// One printed frame. JSON mode emits one of these per line.
#[derive(Debug, Serialize)]
struct Frame<'a> {
    poll: u64,
    revision: u64,
    connection: ConnectionState,
    total: u64,
    archived: &'a [IncidentId],
    records: &'a [IncidentRecord],
}

fn print_frame(frame: &Frame<'_>, output: OutputMode, w: &mut dyn Write) -> io::Result<()> {
    match output {
        OutputMode::Json => {
            serde_json::to_writer(&mut *w, frame).map_err(io::Error::other)?;
            writeln!(w)
        }
        OutputMode::Pretty => {
            writeln!(w)?;
            pretty_section(w, &format!("poll {} (revision {})", frame.poll, frame.revision))?;
            pretty_kv(w, "Feed", frame.connection.as_str())?;
            pretty_kv(w, "Total", frame.total.to_string())?;
            for id in frame.archived {
                pretty_kv(w, "Archived", id.as_str())?;
            }
            render_list_to(frame.records, output, w)
        }
        OutputMode::Text => {
            writeln!(
                w,
                "poll={} revision={} feed={} total={}",
                frame.poll, frame.revision, frame.connection, frame.total
            )?;
            for id in frame.archived {
                writeln!(w, "archived={id}")?;
            }
            render_list_to(frame.records, output, w)
        }
    }
}

/// One poll: feed in, archivals out, reconnect if the feed dropped.
fn poll_once(view: &mut IncidentView<SqliteBackend>, backend: &SqliteBackend) -> Vec<IncidentId> {
    if let Err(err) = backend.poll_changes() {
        warn!(error = %err, "change log poll failed");
    }
    view.pump();
    if view.connection() == ConnectionState::Disconnected {
        info!("feed dropped; reconnecting");
        view.reconnect();
    }
    view.tick()
}

pub fn run_watch(
    args: &WatchArgs,
    engine: EngineConfig,
    output: OutputMode,
    project_root: &Path,
) -> Result<()> {
    let desk = Desk::open(project_root, engine, output)?;
    let scope = if args.completed {
        ViewScope::Completed
    } else {
        ViewScope::Active
    };
    let mut view = desk.view(args.list.request(scope, desk.page_size(args.list.page_size)))?;
    let interval = Duration::from_millis(args.interval_ms);

    let stdout = io::stdout();
    let mut last: Option<(u64, ConnectionState)> = None;
    let mut poll = 0_u64;
    loop {
        let archived = if poll == 0 {
            Vec::new()
        } else {
            poll_once(&mut view, &desk.backend)
        };
        let marker = (view.revision(), view.connection());
        if last != Some(marker) || !archived.is_empty() {
            let records = view.snapshot();
            let frame = Frame {
                poll,
                revision: marker.0,
                connection: marker.1,
                total: view.total(),
                archived: &archived,
                records: &records,
            };
            let mut out = stdout.lock();
            print_frame(&frame, output, &mut out)?;
            out.flush()?;
            last = Some(marker);
        }

        poll += 1;
        if args.polls.is_some_and(|limit| poll >= limit) {
            break;
        }
        std::thread::sleep(interval);
    }
    view.close();
    Ok(())
}
