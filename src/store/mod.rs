//! Component C: the Index Store. A single embedded SQLite database,
//! exposing typed operations — never raw SQL — to collaborators.
//!
//! Connection management is grounded on `fspulse`'s use of `r2d2` +
//! `r2d2_sqlite` for resource limits (max open/idle connections, connection
//! lifetime); schema setup extends the teacher's `db::connect`/`db::init`
//! (WAL, foreign keys) with the migration sequence in `schema.rs`.

pub mod audit;
pub mod dedup_queries;
pub mod files;
pub mod scans;
mod schema;
pub mod usage;

pub use dedup_queries::{
    cross_disk_duplicate_groups, hardlink_groups, same_disk_duplicate_groups, CrossDiskGroup,
    HardlinkGroup, HardlinkOrder, SameDiskGroup,
};
pub use files::{FileFilter, OrderBy, OrderDirection, ServiceMode};

use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::Result;
use crate::models::ScanStatus;

pub type DbPool = Pool<SqliteConnectionManager>;

pub struct IndexStore {
    pool: DbPool,
}

pub struct StoreLimits {
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Duration,
    pub page_cache_kib: i64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_open_conns: 8,
            max_idle_conns: 2,
            conn_max_lifetime: Duration::from_secs(3600),
            page_cache_kib: 64_000,
        }
    }
}

impl IndexStore {
    /// Opens (creating if missing) the database at `path`, runs the
    /// migration sequence, and performs crash recovery: any `Scan` row
    /// still `running` is transitioned to `interrupted` (§4.C.6).
    pub fn open(path: &Path, limits: StoreLimits) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let page_cache_kib = limits.page_cache_kib;
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA cache_size = -{page_cache_kib};"
            ))?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(limits.max_open_conns)
            .min_idle(Some(limits.max_idle_conns))
            .max_lifetime(Some(limits.conn_max_lifetime))
            .build(manager)
            .map_err(|e| {
                crate::error::EngineError::InvariantViolation(format!(
                    "failed to build connection pool: {e}"
                ))
            })?;

        {
            let mut conn = pool.get().map_err(|e| {
                crate::error::EngineError::InvariantViolation(format!(
                    "failed to acquire connection for migration: {e}"
                ))
            })?;
            schema::migrate(&mut conn)?;
            recover_interrupted_scans(&conn)?;
        }

        info!("index store opened at {}", path.display());

        Ok(Self { pool })
    }

    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .expect("in-memory pool");
        let mut conn = pool.get().expect("in-memory connection");
        schema::migrate(&mut conn)?;
        Ok(Self { pool })
    }

    pub(crate) fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            crate::error::EngineError::InvariantViolation(format!(
                "failed to acquire pooled connection: {e}"
            ))
        })
    }
}

fn recover_interrupted_scans(conn: &Connection) -> Result<()> {
    let ids: Vec<i64> = {
        let mut stmt = conn.prepare("SELECT id FROM scans WHERE status = 'running'")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for id in &ids {
        warn!("recovering scan {id}: was running at last shutdown, marking interrupted");
        conn.execute(
            "UPDATE scans SET status = ?1, errors = json_insert(errors, '$[#]', ?2)
             WHERE id = ?3",
            rusqlite::params![
                ScanStatus::Interrupted.as_str(),
                "process restarted while scan was running",
                id
            ],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_recovery_marks_running_scans_interrupted() {
        let store = IndexStore::open_in_memory().unwrap();
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO scans (id, started_at, status, scan_type) VALUES (1, '2024-01-01', 'running', 'full')",
                [],
            )
            .unwrap();
        }
        // Re-run recovery directly (simulating the check performed at open).
        {
            let conn = store.conn().unwrap();
            recover_interrupted_scans(&conn).unwrap();
            let status: String = conn
                .query_row("SELECT status FROM scans WHERE id = 1", [], |r| r.get(0))
                .unwrap();
            assert_eq!(status, "interrupted");
        }
    }
}
