//! Scan table operations backing the Scan Controller (§4.J, §3).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, Result};
use crate::models::{Scan, ScanStatus};

/// Most recent errors kept per scan; older entries are discarded from the
/// head of the list (§7.1).
const MAX_ERRORS: usize = 1000;

pub fn start_scan(conn: &Connection, scan_type: &str, resume_from_scan_id: Option<i64>) -> Result<i64> {
    let running: Option<i64> = conn
        .query_row("SELECT id FROM scans WHERE status = 'running' LIMIT 1", [], |row| row.get(0))
        .optional()?;
    if let Some(id) = running {
        return Err(EngineError::ScanAlreadyRunning(id));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO scans (started_at, status, scan_type, current_phase, errors, resume_from_scan_id)
         VALUES (?1, 'running', ?2, 'initializing', '[]', ?3)",
        params![now, scan_type, resume_from_scan_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_scan(conn: &Connection, id: i64) -> Result<Option<Scan>> {
    conn.query_row(
        "SELECT id, started_at, completed_at, status, files_scanned, errors, scan_type,
                current_phase, last_processed_path, resume_from_scan_id, deleted_files_count
         FROM scans WHERE id = ?1",
        [id],
        row_to_scan,
    )
    .optional()
    .map_err(Into::into)
}

/// Returns the single `running` scan, if any. Intentionally pure: it does
/// not itself sweep stale scans. The store's open-time crash recovery
/// (§4.C.6) is the one place that transitions a `running` scan to
/// `interrupted`; see DESIGN.md for why this getter doesn't duplicate that
/// sweep (§9 Open Question).
pub fn get_current_scan(conn: &Connection) -> Result<Option<Scan>> {
    conn.query_row(
        "SELECT id, started_at, completed_at, status, files_scanned, errors, scan_type,
                current_phase, last_processed_path, resume_from_scan_id, deleted_files_count
         FROM scans WHERE status = 'running' LIMIT 1",
        [],
        row_to_scan,
    )
    .optional()
    .map_err(Into::into)
}

pub fn update_phase(conn: &Connection, id: i64, phase: &str) -> Result<()> {
    conn.execute(
        "UPDATE scans SET current_phase = ?1 WHERE id = ?2",
        params![phase, id],
    )?;
    Ok(())
}

pub fn checkpoint(conn: &Connection, id: i64, last_processed_path: &str) -> Result<()> {
    conn.execute(
        "UPDATE scans SET last_processed_path = ?1 WHERE id = ?2",
        params![last_processed_path, id],
    )?;
    Ok(())
}

pub fn increment_files_scanned(conn: &Connection, id: i64, delta: i64) -> Result<()> {
    conn.execute(
        "UPDATE scans SET files_scanned = files_scanned + ?1 WHERE id = ?2",
        params![delta, id],
    )?;
    Ok(())
}

/// Appends an error message, keeping only the most recent `MAX_ERRORS`.
pub fn append_error(conn: &Connection, id: i64, message: &str) -> Result<()> {
    let current: String = conn.query_row("SELECT errors FROM scans WHERE id = ?1", [id], |r| r.get(0))?;
    let mut errors: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
    errors.push(message.to_string());
    if errors.len() > MAX_ERRORS {
        let excess = errors.len() - MAX_ERRORS;
        errors.drain(0..excess);
    }
    let serialized = serde_json::to_string(&errors)?;
    conn.execute(
        "UPDATE scans SET errors = ?1 WHERE id = ?2",
        params![serialized, id],
    )?;
    Ok(())
}

pub fn complete(conn: &Connection, id: i64, status: ScanStatus, deleted_files_count: i64) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE scans SET status = ?1, completed_at = ?2, current_phase = 'completing', deleted_files_count = ?3
         WHERE id = ?4",
        params![status.as_str(), now, deleted_files_count, id],
    )?;
    Ok(())
}

fn row_to_scan(row: &rusqlite::Row) -> rusqlite::Result<Scan> {
    let errors_json: String = row.get(5)?;
    let errors: Vec<String> = serde_json::from_str(&errors_json).unwrap_or_default();
    let status_str: String = row.get(3)?;
    Ok(Scan {
        id: row.get(0)?,
        started_at: parse_rfc3339(row.get::<_, String>(1)?),
        completed_at: row
            .get::<_, Option<String>>(2)?
            .map(parse_rfc3339),
        status: crate::models::ScanStatus::parse(&status_str).unwrap_or(ScanStatus::Failed),
        files_scanned: row.get(4)?,
        errors,
        scan_type: row.get(6)?,
        current_phase: row.get(7)?,
        last_processed_path: row.get(8)?,
        resume_from_scan_id: row.get(9)?,
        deleted_files_count: row.get(10)?,
    })
}

fn parse_rfc3339(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
