//! Append-only audit log of destructive actions (§3 AuditLogEntry).

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::AuditAction;

pub fn record(
    conn: &Connection,
    action: AuditAction,
    entity_type: &str,
    entity_id: Option<i64>,
    scan_id: Option<i64>,
    details: Option<&str>,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO audit_log (action, entity_type, entity_id, scan_id, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![action.as_str(), entity_type, entity_id, scan_id, details, now],
    )?;
    Ok(())
}
