//! Forward-only schema migrations (§9 "Schema evolution as an iterative
//! migration sequence"). Each step probes the live schema — via column
//! introspection or, for CHECK-constraint relaxation, by inspecting
//! `sqlite_master.sql` — so re-running the whole sequence on an
//! already-migrated database is a no-op. New columns are additive DDL;
//! CHECK-constraint relaxations rebuild the table with foreign keys
//! toggled off for the duration of the rebuild, matching fspulse's
//! `db/schema/v22_to_v23.rs` style of archived, self-contained migration
//! steps.

use rusqlite::Connection;

use crate::error::{EngineError, Result};

pub fn migrate(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    create_base_tables(&tx)?;
    create_fts(&tx)?;
    tx.commit()?;

    // CHECK-constraint relaxations each manage their own transaction
    // because they toggle `PRAGMA foreign_keys` at the connection level,
    // which SQLite forbids inside an active transaction.
    add_hash_columns(conn)?;
    add_last_verified_column(conn)?;
    add_scan_id_column(conn)?;
    add_deleted_files_count_column(conn)?;
    add_resume_from_scan_id_column(conn)?;
    relax_usage_service_check(conn, &["plex", "sonarr", "radarr", "qbittorrent", "stash", "calibre"])?;
    relax_scan_type_check(conn)?;
    relax_scan_status_check(conn, &["running", "completed", "failed", "interrupted", "completed_with_errors"])?;
    relax_audit_action_check(
        conn,
        &[
            "delete",
            "mark_rescan",
            "config_change",
            "delete_failed",
            "consolidate",
            "hardlink",
            "cleanup",
        ],
    )?;
    add_indexes(conn)?;

    Ok(())
}

fn create_base_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS files (
            id              INTEGER PRIMARY KEY,
            path            TEXT NOT NULL UNIQUE,
            size            INTEGER NOT NULL CHECK (size >= 0),
            inode           INTEGER NOT NULL,
            device_id       INTEGER NOT NULL,
            modified_time   INTEGER NOT NULL,
            scan_id         INTEGER,
            is_orphaned     INTEGER NOT NULL DEFAULT 1,
            extension       TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS scans (
            id                    INTEGER PRIMARY KEY,
            started_at            TEXT NOT NULL,
            completed_at          TEXT,
            status                TEXT NOT NULL CHECK (status IN ('running','completed','failed','interrupted')),
            files_scanned         INTEGER NOT NULL DEFAULT 0,
            errors                TEXT NOT NULL DEFAULT '[]',
            scan_type             TEXT NOT NULL CHECK (scan_type IN ('full','incremental','disk_location','service_update_all','hash_scan','cleanup')),
            current_phase         TEXT NOT NULL DEFAULT 'initializing',
            last_processed_path   TEXT
        );

        CREATE TABLE IF NOT EXISTS usage (
            id              INTEGER PRIMARY KEY,
            file_id         INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            service         TEXT NOT NULL CHECK (service IN ('plex','sonarr','radarr','qbittorrent','stash')),
            reference_path  TEXT NOT NULL,
            metadata        TEXT NOT NULL DEFAULT '{}',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            UNIQUE(file_id, service)
        );

        CREATE TABLE IF NOT EXISTS file_disk_locations (
            id                INTEGER PRIMARY KEY,
            file_id           INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            disk_device_id    INTEGER NOT NULL,
            disk_name         TEXT NOT NULL,
            disk_path         TEXT NOT NULL,
            size              INTEGER NOT NULL,
            inode             INTEGER NOT NULL,
            modified_time     INTEGER NOT NULL,
            UNIQUE(file_id, disk_device_id)
        );

        CREATE TABLE IF NOT EXISTS service_missing_files (
            id            INTEGER PRIMARY KEY,
            scan_id       INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
            service       TEXT NOT NULL,
            path          TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scan_logs (
            id          INTEGER PRIMARY KEY,
            scan_id     INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
            level       TEXT NOT NULL,
            message     TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id           INTEGER PRIMARY KEY,
            action       TEXT NOT NULL CHECK (action IN ('delete','mark_rescan','config_change','delete_failed','consolidate','hardlink')),
            entity_type  TEXT NOT NULL,
            entity_id    INTEGER,
            scan_id      INTEGER,
            details      TEXT,
            created_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS config (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn create_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
            path,
            content='files',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS files_fts_ai AFTER INSERT ON files BEGIN
            INSERT INTO files_fts(rowid, path) VALUES (new.id, new.path);
        END;

        CREATE TRIGGER IF NOT EXISTS files_fts_ad AFTER DELETE ON files BEGIN
            INSERT INTO files_fts(files_fts, rowid, path) VALUES('delete', old.id, old.path);
        END;

        CREATE TRIGGER IF NOT EXISTS files_fts_au AFTER UPDATE ON files BEGIN
            INSERT INTO files_fts(files_fts, rowid, path) VALUES('delete', old.id, old.path);
            INSERT INTO files_fts(rowid, path) VALUES (new.id, new.path);
        END;
        ",
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    if !column_exists(conn, table, column)? {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {ddl}"), [])?;
    }
    Ok(())
}

fn add_hash_columns(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "files", "file_hash", "file_hash TEXT")?;
    add_column_if_missing(conn, "files", "hash_algorithm", "hash_algorithm TEXT")?;
    add_column_if_missing(conn, "files", "hash_type", "hash_type TEXT")?;
    add_column_if_missing(conn, "files", "hash_level", "hash_level INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(
        conn,
        "files",
        "hash_calculated",
        "hash_calculated INTEGER NOT NULL DEFAULT 0",
    )?;
    Ok(())
}

fn add_last_verified_column(conn: &Connection) -> Result<()> {
    add_column_if_missing(
        conn,
        "files",
        "last_verified",
        "last_verified INTEGER NOT NULL DEFAULT 0",
    )
}

fn add_scan_id_column(conn: &Connection) -> Result<()> {
    // Base table already declares scan_id; this guards older databases
    // created before that column existed.
    // Weak reference (§9 "Scan references are weak"): no FK, scan deletion
    // must not invalidate files.
    add_column_if_missing(conn, "files", "scan_id", "scan_id INTEGER")
}

fn add_deleted_files_count_column(conn: &Connection) -> Result<()> {
    add_column_if_missing(
        conn,
        "scans",
        "deleted_files_count",
        "deleted_files_count INTEGER NOT NULL DEFAULT 0",
    )
}

fn add_resume_from_scan_id_column(conn: &Connection) -> Result<()> {
    add_column_if_missing(
        conn,
        "scans",
        "resume_from_scan_id",
        "resume_from_scan_id INTEGER",
    )
}

fn table_sql(conn: &Connection, table: &str) -> Result<String> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )
    .map_err(EngineError::from)
}

/// Rebuilds `table` with `new_create_sql` (same column list, relaxed CHECK),
/// preserving all rows. Runs with foreign keys off for the duration, as the
/// rebuild temporarily breaks referential integrity via the rename dance.
fn rebuild_table_with_check(
    conn: &Connection,
    table: &str,
    columns_csv: &str,
    new_create_sql: &str,
) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    let result = (|| -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        let tmp = format!("{table}__migrating");
        tx.execute(&format!("DROP TABLE IF EXISTS {tmp}"), [])?;
        tx.execute(&new_create_sql.replace(table, &tmp), [])?;
        tx.execute(
            &format!("INSERT INTO {tmp} ({columns_csv}) SELECT {columns_csv} FROM {table}"),
            [],
        )?;
        tx.execute(&format!("DROP TABLE {table}"), [])?;
        tx.execute(&format!("ALTER TABLE {tmp} RENAME TO {table}"), [])?;
        tx.commit()?;
        Ok(())
    })();
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    result
}

fn check_allows(conn: &Connection, table: &str, value: &str) -> Result<bool> {
    let sql = table_sql(conn, table)?;
    Ok(sql.contains(&format!("'{value}'")))
}

fn relax_usage_service_check(conn: &Connection, allowed: &[&str]) -> Result<()> {
    if allowed.iter().all(|v| check_allows(conn, "usage", v).unwrap_or(false)) {
        return Ok(());
    }
    let list = allowed
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(",");
    let new_sql = format!(
        "CREATE TABLE usage (
            id              INTEGER PRIMARY KEY,
            file_id         INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            service         TEXT NOT NULL CHECK (service IN ({list})),
            reference_path  TEXT NOT NULL,
            metadata        TEXT NOT NULL DEFAULT '{{}}',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            UNIQUE(file_id, service)
        )"
    );
    rebuild_table_with_check(
        conn,
        "usage",
        "id, file_id, service, reference_path, metadata, created_at, updated_at",
        &new_sql,
    )
}

/// `scan_type` additionally admits the templated `service_update_<svc>`
/// forms, which a plain `IN (...)` CHECK can't express directly; we widen
/// it to a `GLOB`-based check once any non-listed literal type is needed.
fn relax_scan_type_check(conn: &Connection) -> Result<()> {
    let sql = table_sql(conn, "scans")?;
    if sql.contains("service_update_%") {
        return Ok(());
    }
    let new_sql = "CREATE TABLE scans (
            id                    INTEGER PRIMARY KEY,
            started_at            TEXT NOT NULL,
            completed_at          TEXT,
            status                TEXT NOT NULL CHECK (status IN ('running','completed','failed','interrupted','completed_with_errors')),
            files_scanned         INTEGER NOT NULL DEFAULT 0,
            errors                TEXT NOT NULL DEFAULT '[]',
            scan_type             TEXT NOT NULL CHECK (
                scan_type IN ('full','incremental','disk_location','service_update_all','hash_scan','cleanup','file_rescan')
                OR scan_type GLOB 'service_update_*'
            ),
            current_phase         TEXT NOT NULL DEFAULT 'initializing',
            last_processed_path   TEXT,
            deleted_files_count   INTEGER NOT NULL DEFAULT 0,
            resume_from_scan_id   INTEGER
        )";
    rebuild_table_with_check(
        conn,
        "scans",
        "id, started_at, completed_at, status, files_scanned, errors, scan_type, current_phase, last_processed_path, deleted_files_count, resume_from_scan_id",
        new_sql,
    )
}

fn relax_scan_status_check(conn: &Connection, allowed: &[&str]) -> Result<()> {
    if allowed.iter().all(|v| check_allows(conn, "scans", v).unwrap_or(false)) {
        return Ok(());
    }
    let list = allowed
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(",");
    let new_sql = format!(
        "CREATE TABLE scans (
            id                    INTEGER PRIMARY KEY,
            started_at            TEXT NOT NULL,
            completed_at          TEXT,
            status                TEXT NOT NULL CHECK (status IN ({list})),
            files_scanned         INTEGER NOT NULL DEFAULT 0,
            errors                TEXT NOT NULL DEFAULT '[]',
            scan_type             TEXT NOT NULL CHECK (
                scan_type IN ('full','incremental','disk_location','service_update_all','hash_scan','cleanup','file_rescan')
                OR scan_type GLOB 'service_update_*'
            ),
            current_phase         TEXT NOT NULL DEFAULT 'initializing',
            last_processed_path   TEXT,
            deleted_files_count   INTEGER NOT NULL DEFAULT 0,
            resume_from_scan_id   INTEGER
        )"
    );
    rebuild_table_with_check(
        conn,
        "scans",
        "id, started_at, completed_at, status, files_scanned, errors, scan_type, current_phase, last_processed_path, deleted_files_count, resume_from_scan_id",
        &new_sql,
    )
}

fn relax_audit_action_check(conn: &Connection, allowed: &[&str]) -> Result<()> {
    if allowed.iter().all(|v| check_allows(conn, "audit_log", v).unwrap_or(false)) {
        return Ok(());
    }
    let list = allowed
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(",");
    let new_sql = format!(
        "CREATE TABLE audit_log (
            id           INTEGER PRIMARY KEY,
            action       TEXT NOT NULL CHECK (action IN ({list})),
            entity_type  TEXT NOT NULL,
            entity_id    INTEGER,
            scan_id      INTEGER,
            details      TEXT,
            created_at   TEXT NOT NULL
        )"
    );
    rebuild_table_with_check(
        conn,
        "audit_log",
        "id, action, entity_type, entity_id, scan_id, details, created_at",
        &new_sql,
    )
}

fn add_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_files_device_inode ON files(device_id, inode);
        CREATE INDEX IF NOT EXISTS idx_files_hash ON files(file_hash);
        CREATE INDEX IF NOT EXISTS idx_file_disk_locations_device ON file_disk_locations(disk_device_id);
        CREATE INDEX IF NOT EXISTS idx_usage_service ON usage(service);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = open_memory();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT count(*) FROM sqlite_master WHERE type='table' AND name='files'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn hash_columns_exist_after_migration() {
        let mut conn = open_memory();
        migrate(&mut conn).unwrap();
        assert!(column_exists(&conn, "files", "file_hash").unwrap());
        assert!(column_exists(&conn, "files", "hash_calculated").unwrap());
    }

    #[test]
    fn relaxed_checks_admit_new_enum_values() {
        let mut conn = open_memory();
        migrate(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO scans (id, started_at, status, scan_type) VALUES (1, '2024-01-01', 'completed_with_errors', 'file_rescan')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO scans (id, started_at, status, scan_type) VALUES (2, '2024-01-01', 'running', 'service_update_calibre')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO files (id, path, size, inode, device_id, modified_time) VALUES (1, '/a', 0, 1, 1, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO usage (id, file_id, service, reference_path, created_at, updated_at) VALUES (1, 1, 'calibre', '/a', '2024', '2024')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO audit_log (id, action, entity_type, created_at) VALUES (1, 'cleanup', 'file', '2024')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn foreign_keys_still_enforced_after_rebuilds() {
        let mut conn = open_memory();
        migrate(&mut conn).unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();

        let result = conn.execute(
            "INSERT INTO usage (id, file_id, service, reference_path, created_at, updated_at) VALUES (1, 999, 'plex', '/x', '2024', '2024')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn fts_table_and_triggers_are_created() {
        let mut conn = open_memory();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO files (id, path, size, inode, device_id, modified_time) VALUES (1, '/media/Film.mkv', 0, 1, 1, 0)",
            [],
        )
        .unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM files_fts WHERE files_fts MATCH ?1", ["Film"], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
