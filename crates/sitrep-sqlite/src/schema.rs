//! SQLite schema for the sitrep store.
//!
//! - `officers` is the roster the incident join reads reporter names from
//! - `incidents` holds the latest state of each report; `reporter_id` is a
//!   soft reference so a report can name an officer the roster lacks
//! - `change_log` is appended by triggers on every incident write and is what
//!   the change feed polls
//! - `store_meta` records the schema version

/// Migration v1: roster, incidents and store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS officers (
    officer_id TEXT PRIMARY KEY,
    full_name TEXT NOT NULL CHECK (length(trim(full_name)) > 0),
    phone TEXT,
    role TEXT NOT NULL DEFAULT 'officer',
    created_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS incidents (
    incident_id TEXT PRIMARY KEY,
    category TEXT NOT NULL CHECK (length(trim(category)) > 0),
    severity INTEGER NOT NULL CHECK (severity BETWEEN 1 AND 5),
    latitude REAL NOT NULL CHECK (latitude BETWEEN -90.0 AND 90.0),
    longitude REAL NOT NULL CHECK (longitude BETWEEN -180.0 AND 180.0),
    victim_count INTEGER NOT NULL DEFAULT 0 CHECK (victim_count >= 0),
    reported_at_us INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'dispatched', 'on_site', 'resolved', 'completed')),
    evidence_ref TEXT,
    reporter_id TEXT,
    updated_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (id, schema_version) VALUES (1, 0);
";

/// Migration v2: query indexes, the change log and its triggers.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_incidents_status_reported
    ON incidents(status, reported_at_us DESC, incident_id);
CREATE INDEX IF NOT EXISTS idx_incidents_severity_reported
    ON incidents(severity, reported_at_us DESC);
CREATE INDEX IF NOT EXISTS idx_incidents_reporter ON incidents(reporter_id);
CREATE INDEX IF NOT EXISTS idx_officers_name ON officers(full_name, officer_id);

CREATE TABLE IF NOT EXISTS change_log (
    change_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    op TEXT NOT NULL CHECK (op IN ('insert', 'update', 'delete')),
    incident_id TEXT NOT NULL,
    changed_mask INTEGER NOT NULL DEFAULT 0,
    payload TEXT,
    recorded_at_us INTEGER NOT NULL DEFAULT 0
);

CREATE TRIGGER IF NOT EXISTS trg_incidents_insert
AFTER INSERT ON incidents
BEGIN
    INSERT INTO change_log (op, incident_id, changed_mask, payload, recorded_at_us)
    VALUES (
        'insert',
        NEW.incident_id,
        255,
        json_object(
            'incident_id', NEW.incident_id,
            'category', NEW.category,
            'severity', NEW.severity,
            'latitude', NEW.latitude,
            'longitude', NEW.longitude,
            'victim_count', NEW.victim_count,
            'reported_at_us', NEW.reported_at_us,
            'status', NEW.status,
            'evidence_ref', NEW.evidence_ref,
            'reporter_id', NEW.reporter_id
        ),
        NEW.updated_at_us
    );
END;

CREATE TRIGGER IF NOT EXISTS trg_incidents_update
AFTER UPDATE ON incidents
WHEN NEW.category IS NOT OLD.category
    OR NEW.severity IS NOT OLD.severity
    OR NEW.latitude IS NOT OLD.latitude
    OR NEW.longitude IS NOT OLD.longitude
    OR NEW.victim_count IS NOT OLD.victim_count
    OR NEW.reported_at_us IS NOT OLD.reported_at_us
    OR NEW.status IS NOT OLD.status
    OR NEW.evidence_ref IS NOT OLD.evidence_ref
    OR NEW.reporter_id IS NOT OLD.reporter_id
BEGIN
    INSERT INTO change_log (op, incident_id, changed_mask, payload, recorded_at_us)
    VALUES (
        'update',
        NEW.incident_id,
        (CASE WHEN NEW.category IS NOT OLD.category THEN 1 ELSE 0 END)
        | (CASE WHEN NEW.severity IS NOT OLD.severity THEN 2 ELSE 0 END)
        | (CASE WHEN NEW.latitude IS NOT OLD.latitude
                  OR NEW.longitude IS NOT OLD.longitude THEN 4 ELSE 0 END)
        | (CASE WHEN NEW.victim_count IS NOT OLD.victim_count THEN 8 ELSE 0 END)
        | (CASE WHEN NEW.reported_at_us IS NOT OLD.reported_at_us THEN 16 ELSE 0 END)
        | (CASE WHEN NEW.status IS NOT OLD.status THEN 32 ELSE 0 END)
        | (CASE WHEN NEW.evidence_ref IS NOT OLD.evidence_ref THEN 64 ELSE 0 END)
        | (CASE WHEN NEW.reporter_id IS NOT OLD.reporter_id THEN 128 ELSE 0 END),
        json_object(
            'incident_id', NEW.incident_id,
            'category', NEW.category,
            'severity', NEW.severity,
            'latitude', NEW.latitude,
            'longitude', NEW.longitude,
            'victim_count', NEW.victim_count,
            'reported_at_us', NEW.reported_at_us,
            'status', NEW.status,
            'evidence_ref', NEW.evidence_ref,
            'reporter_id', NEW.reporter_id
        ),
        NEW.updated_at_us
    );
END;

CREATE TRIGGER IF NOT EXISTS trg_incidents_delete
AFTER DELETE ON incidents
BEGIN
    INSERT INTO change_log (op, incident_id, changed_mask, payload, recorded_at_us)
    VALUES ('delete', OLD.incident_id, 0, NULL, OLD.updated_at_us);
END;
";

/// Bits of `change_log.changed_mask`, one per mutable incident column group.
pub mod mask {
    pub const CATEGORY: i64 = 1;
    pub const SEVERITY: i64 = 2;
    pub const POSITION: i64 = 4;
    pub const VICTIMS: i64 = 8;
    pub const REPORTED_AT: i64 = 16;
    pub const STATUS: i64 = 32;
    pub const EVIDENCE: i64 = 64;
    pub const REPORTER: i64 = 128;
}

pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_incidents_status_reported",
    "idx_incidents_severity_reported",
    "idx_incidents_reporter",
    "idx_officers_name",
];

pub const REQUIRED_TRIGGERS: &[&str] = &[
    "trg_incidents_insert",
    "trg_incidents_update",
    "trg_incidents_delete",
];
