//! `sitrep list` and `sitrep completed`: one page of the active or the
//! archived incidents.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use sitrep_core::config::EngineConfig;
use sitrep_core::model::IncidentRecord;
use sitrep_core::query::{PageRequest, SeverityBucket, ViewScope};

use crate::desk::Desk;
use crate::output::{OutputMode, pretty_kv, pretty_section, render, render_list_to};

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Case-insensitive match on the category (and the reporter name in the
    /// completed list).
    #[arg(long)]
    pub search: Option<String>,

    /// Severity bucket: all, critical, high, moderate, low.
    #[arg(long, default_value = "all")]
    pub severity: SeverityBucket,

    /// 1-based page number.
    #[arg(long, default_value = "1")]
    pub page: u32,

    /// Override `[view] page_size`.
    #[arg(long)]
    pub page_size: Option<u32>,
}

impl ListArgs {
    pub fn request(&self, scope: ViewScope, page_size: u32) -> PageRequest {
        let mut request = PageRequest::scoped(scope, page_size)
            .with_page(self.page)
            .with_severity(self.severity);
        if let Some(search) = &self.search {
            request = request.with_search(search.clone());
        }
        request
    }
}

#[derive(Debug, Serialize)]
struct ListOutput {
    scope: ViewScope,
    page: u32,
    page_size: u32,
    total: u64,
    degraded: bool,
    records: Vec<IncidentRecord>,
}

pub fn run_list(
    args: &ListArgs,
    scope: ViewScope,
    engine: EngineConfig,
    output: OutputMode,
    project_root: &Path,
) -> Result<()> {
    let desk = Desk::open(project_root, engine, output)?;
    let request = args.request(scope, desk.page_size(args.page_size));
    let view = desk.view(request)?;

    let out = ListOutput {
        scope,
        page: view.request().page,
        page_size: view.request().page_size,
        total: view.total(),
        degraded: view.is_degraded(),
        records: view.snapshot(),
    };

    render(output, &out, |out, w| {
        if output == OutputMode::Pretty {
            pretty_section(w, &format!("{} incidents", out.scope))?;
            pretty_kv(w, "Page", format!("{} ({} per page)", out.page, out.page_size))?;
            pretty_kv(w, "Total", out.total.to_string())?;
            if out.degraded {
                pretty_kv(w, "Store", "unreachable; showing an empty page")?;
            }
            writeln!(w)?;
        } else if out.degraded {
            writeln!(w, "degraded=true")?;
        }
        if out.records.is_empty() {
            return writeln!(w, "no {} incidents", out.scope);
        }
        render_list_to(&out.records, output, w)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_every_filter() {
        let args = ListArgs {
            search: Some("flood".into()),
            severity: SeverityBucket::Critical,
            page: 2,
            page_size: None,
        };
        let request = args.request(ViewScope::Completed, 5);
        assert_eq!(request.scope, ViewScope::Completed);
        assert_eq!(request.page, 2);
        assert_eq!(request.page_size, 5);
        assert_eq!(request.severity, SeverityBucket::Critical);
        assert_eq!(request.search_term(), Some("flood"));
    }

    #[test]
    fn default_args_ask_for_the_first_page() {
        let request = ListArgs {
            page: 1,
            ..ListArgs::default()
        }
        .request(ViewScope::Active, 8);
        assert_eq!(request, PageRequest::scoped(ViewScope::Active, 8));
    }
}
