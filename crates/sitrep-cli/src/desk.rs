//! Opening the local command desk: config plus the SQLite store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use sitrep_core::IncidentView;
use sitrep_core::clock::SystemClock;
use sitrep_core::config::{EngineConfig, SITREP_DIR};
use sitrep_core::error::ErrorCode;
use sitrep_core::query::PageRequest;
use sitrep_sqlite::SqliteBackend;

use crate::output::{CliError, OutputMode, render_error};

/// Store file under the desk directory.
pub const DB_FILE: &str = "sitrep.db";

pub fn desk_dir(root: &Path) -> PathBuf {
    root.join(SITREP_DIR)
}

pub fn db_path(root: &Path) -> PathBuf {
    desk_dir(root).join(DB_FILE)
}

pub struct Desk {
    pub engine: EngineConfig,
    pub backend: Arc<SqliteBackend>,
}

impl Desk {
    /// Open an initialized desk. A missing store is reported with its
    /// error code before failing.
    pub fn open(root: &Path, engine: EngineConfig, output: OutputMode) -> Result<Self> {
        let path = db_path(root);
        if !path.exists() {
            render_error(
                output,
                &CliError::from_code(
                    ErrorCode::NotInitialized,
                    format!("no store at {}", path.display()),
                ),
            )?;
            bail!("{}: {}", ErrorCode::NotInitialized.code(), ErrorCode::NotInitialized.message());
        }
        let backend = SqliteBackend::open(&path)
            .with_context(|| format!("{}: {}", ErrorCode::CorruptStore.code(), path.display()))?;
        Ok(Self {
            engine,
            backend: Arc::new(backend),
        })
    }

    /// Page size from config unless the command overrides it.
    pub fn page_size(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.engine.view.page_size)
    }

    /// Open a live view on the wall clock.
    pub fn view(&self, request: PageRequest) -> Result<IncidentView<SqliteBackend>> {
        IncidentView::open(
            Arc::clone(&self.backend),
            Arc::new(SystemClock),
            request,
            &self.engine,
        )
        .map_err(|err| anyhow::anyhow!("{}: {err}", err.code().code()))
    }
}
