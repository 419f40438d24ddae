use std::path::Path;

use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use sitrep_sqlite::SqliteBackend;

use crate::desk::{db_path, desk_dir};
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Rewrite the config even if `.sitrep/` already exists. Stored
    /// incidents are kept.
    #[arg(long)]
    pub force: bool,
}

const CONFIG_TOML: &str = "[view]\n\
    page_size = 8\n\
    \n\
    [archive]\n\
    delay_ms = 2000\n\
    follow_feed = true\n\
    \n\
    [stats]\n\
    critical_threshold = 4\n\
    \n\
    [backfill]\n\
    placeholder_name = \"Unknown Officer\"\n";

const GITIGNORE: &str = "sitrep.db\nsitrep.db-wal\nsitrep.db-shm\n";

#[derive(Debug, Serialize)]
struct InitOutput {
    desk: String,
    store: String,
    config: String,
}

/// Execute `sitrep init`. Creates the desk skeleton:
///
/// ```text
/// .sitrep/
///   config.toml   (default engine config)
///   sitrep.db     (migrated SQLite store)
///   .gitignore
/// ```
///
/// # Errors
///
/// Returns an error if `.sitrep/` already exists and `--force` is not set,
/// or if any filesystem or migration step fails.
pub fn run_init(args: &InitArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let dir = desk_dir(project_root);
    if dir.exists() && !args.force {
        anyhow::bail!(".sitrep/ already exists. Use `sitrep init --force` to reinitialize.");
    }

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create desk directory: {}", dir.display()))?;

    let config_path = dir.join("config.toml");
    std::fs::write(&config_path, CONFIG_TOML)
        .with_context(|| format!("Failed to write config: {}", config_path.display()))?;

    let gitignore_path = dir.join(".gitignore");
    std::fs::write(&gitignore_path, GITIGNORE)
        .with_context(|| format!("Failed to write .gitignore: {}", gitignore_path.display()))?;

    let store = db_path(project_root);
    SqliteBackend::open(&store)
        .with_context(|| format!("Failed to create store: {}", store.display()))?;

    let out = InitOutput {
        desk: dir.display().to_string(),
        store: store.display().to_string(),
        config: config_path.display().to_string(),
    };
    render(output, &out, |out, w| {
        writeln!(w, "✓ Initialized {}", out.desk)?;
        writeln!(w)?;
        writeln!(w, "  Store:  {}", out.store)?;
        writeln!(w, "  Config: {}", out.config)?;
        writeln!(w)?;
        writeln!(w, "Next steps:")?;
        writeln!(w, "  sitrep officer add off-1 --name \"Asha Perera\"")?;
        writeln!(w, "  sitrep report --category flood --severity 4 --officer off-1")
    })
}
