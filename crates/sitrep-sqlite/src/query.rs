//! SQL for page reads, point reads and the officer roster.
//!
//! The page query filters, counts and paginates in SQLite so that `total`
//! is the size of the whole filtered set.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter, types::ToSql};

use sitrep_core::model::{
    GeoPoint, IncidentId, IncidentRecord, IncidentRow, Officer, PLACEHOLDER_REPORTER, Reporter,
    Status, micros_to_utc,
};
use sitrep_core::query::{PageRequest, SeverityRange, ViewScope};

const INCIDENT_COLUMNS: &str = "i.incident_id, i.category, i.severity, i.latitude, i.longitude, \
     i.victim_count, i.reported_at_us, i.status, i.evidence_ref, i.reporter_id, \
     o.full_name, o.phone";

const INCIDENT_JOIN: &str = "FROM incidents i LEFT JOIN officers o ON o.officer_id = i.reporter_id";

/// SQL name of the Unicode case fold. SQLite's `lower()` only folds ASCII.
const FOLD_FN: &str = "sitrep_fold";

/// Register the SQL functions the page query relies on.
///
/// # Errors
///
/// Returns an error if SQLite rejects the registration.
pub fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        FOLD_FN,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|text| text.to_lowercase()))
        },
    )
    .with_context(|| format!("register {FOLD_FN}"))
}

/// Escape LIKE wildcards and wrap for a substring match.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for ch in term.to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

/// Build the WHERE clause and its parameters for a page request.
fn where_clause(request: &PageRequest) -> (String, Vec<Box<dyn ToSql>>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();

    match request.scope {
        ViewScope::Active => {
            param_values.push(Box::new(Status::Completed.as_str()));
            conditions.push(format!("i.status <> ?{}", param_values.len()));
        }
        ViewScope::Completed => {
            param_values.push(Box::new(Status::Completed.as_str()));
            conditions.push(format!("i.status = ?{}", param_values.len()));
        }
        ViewScope::All => {}
    }

    match request.severity.range() {
        Some(SeverityRange::AtLeast(min)) => {
            param_values.push(Box::new(min));
            conditions.push(format!("i.severity >= ?{}", param_values.len()));
        }
        Some(SeverityRange::Exactly(value)) => {
            param_values.push(Box::new(value));
            conditions.push(format!("i.severity = ?{}", param_values.len()));
        }
        None => {}
    }

    if let Some(term) = request.search_term() {
        param_values.push(Box::new(like_pattern(term)));
        let pattern_idx = param_values.len();
        let mut condition = format!("({FOLD_FN}(i.category) LIKE ?{pattern_idx} ESCAPE '\\'");
        if request.scope == ViewScope::Completed {
            param_values.push(Box::new(PLACEHOLDER_REPORTER));
            let _ = write!(
                condition,
                " OR {FOLD_FN}(COALESCE(o.full_name, ?{})) LIKE ?{pattern_idx} ESCAPE '\\'",
                param_values.len()
            );
        }
        condition.push(')');
        conditions.push(condition);
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    (clause, param_values)
}

/// Filtered, ordered page plus the filtered total.
///
/// # Errors
///
/// Returns an error if either statement fails or a row cannot be decoded.
pub fn fetch_page(conn: &Connection, request: &PageRequest) -> Result<(Vec<IncidentRecord>, u64)> {
    let (clause, mut param_values) = where_clause(request);

    let count_sql = format!("SELECT COUNT(*) {INCIDENT_JOIN}{clause}");
    let total: i64 = {
        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(AsRef::as_ref).collect();
        conn.query_row(&count_sql, params_from_iter(params_ref), |row| row.get(0))
            .with_context(|| format!("count incidents: {count_sql}"))?
    };

    param_values.push(Box::new(i64::from(request.page_size)));
    let limit_idx = param_values.len();
    param_values.push(Box::new(i64::try_from(request.offset()).unwrap_or(i64::MAX)));
    let offset_idx = param_values.len();

    let sql = format!(
        "SELECT {INCIDENT_COLUMNS} {INCIDENT_JOIN}{clause} \
         ORDER BY i.reported_at_us DESC, i.incident_id ASC \
         LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
    );
    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("prepare page query: {sql}"))?;
    let params_ref: Vec<&dyn ToSql> = param_values.iter().map(AsRef::as_ref).collect();
    let rows = stmt
        .query_map(params_from_iter(params_ref), row_to_record)
        .context("execute page query")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.context("decode incident row")?);
    }
    Ok((records, u64::try_from(total).unwrap_or(0)))
}

/// # Errors
///
/// Returns an error if the query fails or the row cannot be decoded.
pub fn fetch_incident(conn: &Connection, id: &IncidentId) -> Result<Option<IncidentRecord>> {
    let sql = format!("SELECT {INCIDENT_COLUMNS} {INCIDENT_JOIN} WHERE i.incident_id = ?1");
    conn.query_row(&sql, params![id.as_str()], row_to_record)
        .optional()
        .with_context(|| format!("fetch incident {id}"))
}

/// # Errors
///
/// Returns an error if the query fails.
pub fn lookup_officer(conn: &Connection, officer_id: &str) -> Result<Option<Reporter>> {
    conn.query_row(
        "SELECT full_name, phone FROM officers WHERE officer_id = ?1",
        params![officer_id],
        |row| Ok(Reporter::new(row.get::<_, String>(0)?, row.get(1)?)),
    )
    .optional()
    .with_context(|| format!("lookup officer {officer_id}"))
}

/// Roster ordered by name.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_officers(conn: &Connection) -> Result<Vec<Officer>> {
    let mut stmt = conn
        .prepare(
            "SELECT officer_id, full_name, phone, role FROM officers \
             ORDER BY full_name ASC, officer_id ASC",
        )
        .context("prepare roster query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Officer {
                id: row.get(0)?,
                name: row.get(1)?,
                phone: row.get(2)?,
                role: row.get(3)?,
            })
        })
        .context("execute roster query")?;

    let mut officers = Vec::new();
    for row in rows {
        officers.push(row.context("decode officer row")?);
    }
    Ok(officers)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<IncidentRecord> {
    let reported_at_us: i64 = row.get(6)?;
    let reported_at = micros_to_utc(reported_at_us)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, reported_at_us))?;
    let status_raw: String = row.get(7)?;
    let status = status_raw.parse::<Status>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(err))
    })?;

    let reporter = match row.get::<_, Option<String>>(10)? {
        Some(name) => Reporter::new(name, row.get(11)?),
        None => Reporter::placeholder(PLACEHOLDER_REPORTER),
    };

    Ok(IncidentRow {
        id: IncidentId::new(row.get::<_, String>(0)?),
        category: row.get(1)?,
        severity: row.get(2)?,
        position: GeoPoint::new(row.get(3)?, row.get(4)?),
        victim_count: row.get(5)?,
        reported_at,
        status,
        evidence_ref: row.get(8)?,
        reporter_id: row.get(9)?,
    }
    .hydrate(reporter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("Flood"), "%flood%");
        assert_eq!(like_pattern("100%_x\\"), "%100\\%\\_x\\\\%");
    }

    #[test]
    fn active_scope_excludes_completed_in_sql() {
        let (clause, params) = where_clause(&PageRequest::default());
        assert_eq!(clause, " WHERE i.status <> ?1");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn completed_search_also_matches_officer() {
        let request = PageRequest::scoped(ViewScope::Completed, 8).with_search("silva");
        let (clause, params) = where_clause(&request);
        assert!(clause.contains("sitrep_fold(i.category) LIKE ?2"));
        assert!(clause.contains("COALESCE(o.full_name, ?3)) LIKE ?2"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn fold_function_lowercases_beyond_ascii() {
        let conn = Connection::open_in_memory().expect("open");
        register_functions(&conn).expect("register");
        let folded: String = conn
            .query_row("SELECT sitrep_fold('ÉBOULEMENT Ärger')", [], |row| row.get(0))
            .expect("query");
        assert_eq!(folded, "éboulement ärger");
        let null: Option<String> = conn
            .query_row("SELECT sitrep_fold(NULL)", [], |row| row.get(0))
            .expect("query");
        assert_eq!(null, None);
    }

    #[test]
    fn all_scope_without_filters_has_no_where() {
        let (clause, params) = where_clause(&PageRequest::scoped(ViewScope::All, 8));
        assert!(clause.is_empty());
        assert!(params.is_empty());
    }
}
