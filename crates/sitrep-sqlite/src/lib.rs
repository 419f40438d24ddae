//! SQLite backing store for sitrep.
//!
//! [`SqliteBackend`] implements every capability a view needs. Incident writes
//! are recorded by triggers into `change_log`; [`SqliteBackend::poll_changes`]
//! turns new log rows into feed events and fans them out to subscribers.
//! Writes made through this handle poll immediately, so in-process views see
//! them without waiting for the next poll.
//!
//! Runtime pragmas:
//! - `journal_mode = WAL` so a watcher can read while another process writes
//! - `busy_timeout = 5s` to ride out short write locks
//! - `synchronous = NORMAL`

pub mod changes;
pub mod migrations;
pub mod query;
pub mod schema;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, params, params_from_iter, types::ToSql};
use tracing::{debug, info, warn};

use sitrep_core::error::ErrorCode;
use sitrep_core::feed::{ConnectionState, FeedHub, Subscription};
use sitrep_core::model::{FieldPatch, IncidentId, IncidentRecord, IncidentRow, Officer, Reporter, Status};
use sitrep_core::ports::{ChangeFeed, INCIDENTS_COLLECTION, IncidentSource, OfficerDirectory, StatusWriter};
use sitrep_core::query::PageRequest;

/// Busy timeout applied to every connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteBackend {
    conn: Mutex<Connection>,
    hub: FeedHub,
    /// Last change-log sequence already published.
    cursor: Mutex<i64>,
    healthy: AtomicBool,
}

impl SqliteBackend {
    /// Open (or create) the store at `path`, apply pragmas and migrate.
    ///
    /// The feed starts at the current end of the change log: subscribers see
    /// changes made after this call.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, configured or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open store database {}", path.display()))?;
        configure_connection(&conn).context("configure sqlite pragmas")?;
        let backend = Self::from_connection(conn)?;
        info!(path = %path.display(), "opened sqlite store");
        Ok(backend)
    }

    /// # Errors
    ///
    /// Returns an error if migration fails.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migrations::migrate(&mut conn).context("apply store migrations")?;
        query::register_functions(&conn)?;
        let cursor = changes::latest_change_seq(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            hub: FeedHub::new(),
            cursor: Mutex::new(cursor),
            healthy: AtomicBool::new(true),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the underlying connection.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&self.conn())
    }

    #[must_use]
    pub const fn hub(&self) -> &FeedHub {
        &self.hub
    }

    /// Sequence number of the last change published to subscribers.
    #[must_use]
    pub fn cursor(&self) -> i64 {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Change feed
    // -----------------------------------------------------------------------

    /// Publish every change logged since the last poll. Returns how many
    /// events went out.
    ///
    /// A failed read tells subscribers the feed is disconnected; the next
    /// successful poll tells them it is back.
    ///
    /// # Errors
    ///
    /// Returns the change-log read error.
    pub fn poll_changes(&self) -> Result<usize> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = match changes::read_changes(&self.conn(), *cursor) {
            Ok(rows) => rows,
            Err(err) => {
                if self.healthy.swap(false, Ordering::SeqCst) {
                    warn!(code = ErrorCode::FeedUnavailable.code(), error = %err, "change log unreadable");
                    self.hub.broadcast_status(ConnectionState::Disconnected);
                }
                return Err(err);
            }
        };
        if !self.healthy.swap(true, Ordering::SeqCst) {
            info!("change log readable again");
            self.hub.broadcast_status(ConnectionState::Connected);
        }

        let mut published = 0;
        for change in rows {
            *cursor = change.seq;
            match change.to_event() {
                Ok(event) => {
                    self.hub.publish(INCIDENTS_COLLECTION, &event);
                    published += 1;
                }
                Err(err) => {
                    warn!(seq = change.seq, error = %err, "skipping undecodable change");
                }
            }
        }
        if published > 0 {
            debug!(published, cursor = *cursor, "published store changes");
        }
        Ok(published)
    }

    fn publish_after_write(&self) {
        if let Err(err) = self.poll_changes() {
            debug!(error = %err, "post-write poll failed");
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// File an incident, or overwrite the stored one with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the row violates a constraint or the write fails.
    pub fn submit_incident(&self, row: &IncidentRow) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO incidents (incident_id, category, severity, latitude, longitude, \
                 victim_count, reported_at_us, status, evidence_ref, reporter_id, updated_at_us) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(incident_id) DO UPDATE SET \
                 category = excluded.category, severity = excluded.severity, \
                 latitude = excluded.latitude, longitude = excluded.longitude, \
                 victim_count = excluded.victim_count, reported_at_us = excluded.reported_at_us, \
                 status = excluded.status, evidence_ref = excluded.evidence_ref, \
                 reporter_id = excluded.reporter_id, updated_at_us = excluded.updated_at_us",
                params![
                    row.id.as_str(),
                    row.category,
                    row.severity,
                    row.position.latitude,
                    row.position.longitude,
                    row.victim_count,
                    row.reported_at.timestamp_micros(),
                    row.status.as_str(),
                    row.evidence_ref,
                    row.reporter_id,
                    now_micros(),
                ],
            )
            .with_context(|| format!("submit incident {}", row.id))?;
        self.publish_after_write();
        Ok(())
    }

    /// Merge `patch` into the stored incident.
    ///
    /// # Errors
    ///
    /// Fails if the incident does not exist or the update is rejected.
    pub fn apply_patch(&self, id: &IncidentId, patch: &FieldPatch) -> Result<()> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        let mut set = |column: &str, value: Box<dyn ToSql>| {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        };

        if let Some(category) = &patch.category {
            set("category", Box::new(category.clone()));
        }
        if let Some(severity) = patch.severity {
            set("severity", Box::new(severity));
        }
        if let Some(position) = patch.position {
            set("latitude", Box::new(position.latitude));
            set("longitude", Box::new(position.longitude));
        }
        if let Some(victims) = patch.victim_count {
            set("victim_count", Box::new(victims));
        }
        if let Some(at) = patch.reported_at {
            set("reported_at_us", Box::new(at.timestamp_micros()));
        }
        if let Some(status) = patch.status {
            set("status", Box::new(status.as_str()));
        }
        if let Some(evidence) = &patch.evidence_ref {
            set("evidence_ref", Box::new(evidence.clone()));
        }
        if let Some(reporter) = &patch.reporter_id {
            set("reporter_id", Box::new(reporter.clone()));
        }
        set("updated_at_us", Box::new(now_micros()));

        values.push(Box::new(id.as_str().to_string()));
        let sql = format!(
            "UPDATE incidents SET {} WHERE incident_id = ?{}",
            sets.join(", "),
            values.len()
        );
        let params_ref: Vec<&dyn ToSql> = values.iter().map(AsRef::as_ref).collect();
        let updated = self
            .conn()
            .execute(&sql, params_from_iter(params_ref))
            .with_context(|| format!("update incident {id}"))?;
        if updated == 0 {
            bail!("{}: incident {id} not found", ErrorCode::IncidentNotFound.code());
        }
        self.publish_after_write();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove_incident(&self, id: &IncidentId) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM incidents WHERE incident_id = ?1", params![id.as_str()])
            .with_context(|| format!("remove incident {id}"))?;
        self.publish_after_write();
        Ok(removed > 0)
    }

    /// # Errors
    ///
    /// Returns an error if the officer row is rejected.
    pub fn upsert_officer(&self, officer: &Officer) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO officers (officer_id, full_name, phone, role, created_at_us) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(officer_id) DO UPDATE SET \
                 full_name = excluded.full_name, phone = excluded.phone, role = excluded.role",
                params![officer.id, officer.name, officer.phone, officer.role, now_micros()],
            )
            .with_context(|| format!("upsert officer {}", officer.id))?;
        Ok(())
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

impl IncidentSource for SqliteBackend {
    fn fetch_page(&self, request: &PageRequest) -> Result<(Vec<IncidentRecord>, u64)> {
        query::fetch_page(&self.conn(), request)
    }

    fn fetch_incident(&self, id: &IncidentId) -> Result<Option<IncidentRecord>> {
        query::fetch_incident(&self.conn(), id)
    }
}

impl OfficerDirectory for SqliteBackend {
    fn lookup_officer(&self, officer_id: &str) -> Result<Option<Reporter>> {
        query::lookup_officer(&self.conn(), officer_id)
    }

    fn list_officers(&self) -> Result<Vec<Officer>> {
        query::list_officers(&self.conn())
    }
}

impl StatusWriter for SqliteBackend {
    fn update_status(&self, id: &IncidentId, status: Status) -> Result<()> {
        self.apply_patch(id, &FieldPatch::status(status))
    }
}

impl ChangeFeed for SqliteBackend {
    fn subscribe(&self, collection: &str) -> Result<Subscription> {
        Ok(self.hub.open(collection))
    }
}
