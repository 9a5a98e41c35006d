//! File table operations: atomic batch upsert, multi-axis filtering, and
//! FTS-accelerated search (§4.C).

use rusqlite::{params_from_iter, Connection, OptionalExtension, ToSql};

use crate::error::Result;
use crate::models::{File, Service};

/// Binds roughly 9 columns per file; keeping batches at 100 files keeps the
/// parameter count comfortably under SQLite's default bind limit (§4.C.1).
pub const BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    Path,
    Size,
    ModifiedTime,
    LastVerified,
    Id,
}

impl OrderBy {
    /// Any value outside the allow-list defaults to `Path` (§4.C.4).
    pub fn parse(s: &str) -> Self {
        match s {
            "size" => OrderBy::Size,
            "modified_time" => OrderBy::ModifiedTime,
            "last_verified" => OrderBy::LastVerified,
            "id" => OrderBy::Id,
            _ => OrderBy::Path,
        }
    }

    fn column(self) -> &'static str {
        match self {
            OrderBy::Path => "path",
            OrderBy::Size => "size",
            OrderBy::ModifiedTime => "modified_time",
            OrderBy::LastVerified => "last_verified",
            OrderBy::Id => "id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "desc" => OrderDirection::Desc,
            _ => OrderDirection::Asc,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Any,
    All,
    Exact,
}

#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub orphaned: Option<bool>,
    pub services: Vec<Service>,
    pub service_mode: Option<ServiceMode>,
    pub hardlinks_only: bool,
    pub extensions: Vec<String>,
    pub disk_device_ids: Vec<i64>,
    pub limit: i64,
    pub offset: i64,
    pub order_by: OrderBy,
    pub order_direction: OrderDirection,
}

impl FileFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            order_by: OrderBy::Path,
            order_direction: OrderDirection::Asc,
            ..Default::default()
        }
    }
}

/// Idempotent batch upsert keyed on `path`. On conflict, all mutable
/// columns are overwritten but `id` is preserved. Returns the (possibly
/// newly assigned) id for each input file, in input order.
pub fn upsert_batch(conn: &Connection, files: &[File]) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(files.len());
    let mut stmt = conn.prepare_cached(
        "INSERT INTO files (
            path, size, inode, device_id, modified_time, scan_id,
            last_verified, is_orphaned, extension
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(path) DO UPDATE SET
            size = excluded.size,
            inode = excluded.inode,
            device_id = excluded.device_id,
            modified_time = excluded.modified_time,
            scan_id = excluded.scan_id,
            last_verified = excluded.last_verified,
            is_orphaned = excluded.is_orphaned,
            extension = excluded.extension
         RETURNING id",
    )?;

    for file in files {
        let id: i64 = stmt.query_row(
            rusqlite::params![
                file.path,
                file.size,
                file.inode,
                file.device_id,
                file.modified_time,
                file.scan_id,
                file.last_verified,
                file.is_orphaned as i64,
                file.extension,
            ],
            |row| row.get(0),
        )?;
        ids.push(id);
    }

    Ok(ids)
}

/// Refresh only `last_verified` and `scan_id` for an unchanged incremental
/// hit (§4.E step 2) — never touches `is_orphaned` or hash fields.
pub fn touch(conn: &Connection, file_id: i64, last_verified: i64, scan_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE files SET last_verified = ?1, scan_id = ?2 WHERE id = ?3",
        rusqlite::params![last_verified, scan_id, file_id],
    )?;
    Ok(())
}

pub fn find_by_path(conn: &Connection, path: &str) -> Result<Option<File>> {
    conn.query_row(
        "SELECT id, path, size, inode, device_id, modified_time, scan_id, last_verified,
                is_orphaned, extension, file_hash, hash_algorithm, hash_type, hash_level, hash_calculated
         FROM files WHERE path = ?1",
        [path],
        row_to_file,
    )
    .optional()
    .map_err(Into::into)
}

/// Chunked lookup of files by canonical path, keyed for O(1) access by the
/// caller (Service Reconciler batch-matches translated paths, §4.F).
pub fn find_by_paths(conn: &Connection, paths: &[String]) -> Result<Vec<File>> {
    let mut out = Vec::new();
    for chunk in paths.chunks(BATCH_SIZE) {
        let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, path, size, inode, device_id, modified_time, scan_id, last_verified,
                    is_orphaned, extension, file_hash, hash_algorithm, hash_type, hash_level, hash_calculated
             FROM files WHERE path IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), row_to_file)?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

pub fn recompute_orphan_status(conn: &Connection) -> Result<u64> {
    let updated = conn.execute(
        "UPDATE files SET is_orphaned = (NOT EXISTS (SELECT 1 FROM usage WHERE usage.file_id = files.id))",
        [],
    )?;
    Ok(updated as u64)
}

/// Deletes files whose `scan_id` doesn't match `scan_id` once a full scan
/// completes — they were not re-touched, meaning they no longer exist
/// on disk (§3 File lifecycle). Cascades to `usage` via FK.
pub fn delete_untouched_by_scan(conn: &Connection, scan_id: i64) -> Result<u64> {
    let deleted = conn.execute(
        "DELETE FROM files WHERE scan_id IS NULL OR scan_id != ?1",
        [scan_id],
    )?;
    Ok(deleted as u64)
}

pub fn delete_by_id(conn: &Connection, file_id: i64) -> Result<()> {
    conn.execute("DELETE FROM files WHERE id = ?1", [file_id])?;
    Ok(())
}

/// After a same-disk hardlink swap, the path's backing identity changes to
/// the kept file's inode (§4.I "Execute - same-disk hardlink", step 5).
pub fn update_disk_identity(conn: &Connection, file_id: i64, device_id: i64, inode: i64) -> Result<()> {
    conn.execute(
        "UPDATE files SET device_id = ?1, inode = ?2 WHERE id = ?3",
        rusqlite::params![device_id, inode, file_id],
    )?;
    Ok(())
}

pub fn update_hash(
    conn: &Connection,
    file_id: i64,
    file_hash: &str,
    hash_algorithm: &str,
    hash_type: &str,
    hash_level: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE files SET file_hash = ?1, hash_algorithm = ?2, hash_type = ?3, hash_level = ?4,
                hash_calculated = 1
         WHERE id = ?5",
        rusqlite::params![file_hash, hash_algorithm, hash_type, hash_level, file_id],
    )?;
    Ok(())
}

/// Candidates for the Progressive Hasher: unhashed files within an
/// optional size range, in caller-chosen order (§4.G). `order_by_sql` is a
/// fixed literal picked by the caller from a closed set of orderings, never
/// user input, so it is safe to interpolate directly.
pub fn hash_candidates(
    conn: &Connection,
    min_size: Option<i64>,
    max_size: Option<i64>,
    order_by_sql: &str,
    limit: i64,
) -> Result<Vec<File>> {
    let sql = format!(
        "SELECT id, path, size, inode, device_id, modified_time, scan_id, last_verified,
                is_orphaned, extension, file_hash, hash_algorithm, hash_type, hash_level, hash_calculated
         FROM files
         WHERE hash_calculated = 0
           AND (?1 IS NULL OR size >= ?1)
           AND (?2 IS NULL OR size <= ?2)
         ORDER BY {order_by_sql}
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params![min_size, max_size, limit], row_to_file)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Files still colliding at `level`, used by progressive verification to
/// decide which pairs are worth re-hashing at `level + 1` (§4.G).
pub fn files_with_hash_duplicates_at_level(conn: &Connection, level: i64) -> Result<Vec<File>> {
    let sql = "SELECT id, path, size, inode, device_id, modified_time, scan_id, last_verified,
                      is_orphaned, extension, file_hash, hash_algorithm, hash_type, hash_level, hash_calculated
               FROM files
               WHERE hash_calculated = 1 AND hash_level = ?1
                 AND file_hash IN (
                     SELECT file_hash FROM files
                     WHERE hash_calculated = 1 AND hash_level = ?1
                     GROUP BY file_hash, hash_algorithm
                     HAVING COUNT(*) > 1
                 )";
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([level], row_to_file)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub(super) fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<File> {
    Ok(File {
        id: row.get(0)?,
        path: row.get(1)?,
        size: row.get(2)?,
        inode: row.get(3)?,
        device_id: row.get(4)?,
        modified_time: row.get(5)?,
        scan_id: row.get(6)?,
        last_verified: row.get(7)?,
        is_orphaned: row.get::<_, i64>(8)? != 0,
        extension: row.get(9)?,
        file_hash: row.get(10)?,
        hash_algorithm: row.get(11)?,
        hash_type: row.get(12)?,
        hash_level: row.get(13)?,
        hash_calculated: row.get::<_, i64>(14)? != 0,
    })
}

struct FilterClauses {
    sql: String,
    binds: Vec<Box<dyn ToSql>>,
}

fn build_filter_clause(filter: &FileFilter) -> FilterClauses {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(orphaned) = filter.orphaned {
        clauses.push("is_orphaned = ?".to_string());
        binds.push(Box::new(orphaned as i64));
    }

    if !filter.services.is_empty() {
        let placeholders = filter
            .services
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let n = filter.services.len() as i64;
        match filter.service_mode.unwrap_or(ServiceMode::Any) {
            ServiceMode::Any => {
                clauses.push(format!(
                    "EXISTS (SELECT 1 FROM usage WHERE usage.file_id = files.id AND usage.service IN ({placeholders}))"
                ));
                for svc in &filter.services {
                    binds.push(Box::new(svc.as_str().to_string()));
                }
            }
            ServiceMode::All => {
                clauses.push(format!(
                    "(SELECT COUNT(DISTINCT usage.service) FROM usage WHERE usage.file_id = files.id AND usage.service IN ({placeholders})) = ?"
                ));
                for svc in &filter.services {
                    binds.push(Box::new(svc.as_str().to_string()));
                }
                binds.push(Box::new(n));
            }
            ServiceMode::Exact => {
                clauses.push(format!(
                    "(SELECT COUNT(DISTINCT usage.service) FROM usage WHERE usage.file_id = files.id AND usage.service IN ({placeholders})) = ? \
                     AND (SELECT COUNT(DISTINCT usage.service) FROM usage WHERE usage.file_id = files.id) = ?"
                ));
                for svc in &filter.services {
                    binds.push(Box::new(svc.as_str().to_string()));
                }
                binds.push(Box::new(n));
                binds.push(Box::new(n));
            }
        }
    }

    if filter.hardlinks_only {
        clauses.push(
            "(SELECT COUNT(*) FROM files f2 WHERE f2.device_id = files.device_id AND f2.inode = files.inode) > 1"
                .to_string(),
        );
    }

    if !filter.extensions.is_empty() {
        let placeholders = filter
            .extensions
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        clauses.push(format!("extension IN ({placeholders})"));
        for ext in &filter.extensions {
            binds.push(Box::new(ext.clone()));
        }
    }

    if !filter.disk_device_ids.is_empty() {
        let placeholders = filter
            .disk_device_ids
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        clauses.push(format!("device_id IN ({placeholders})"));
        for id in &filter.disk_device_ids {
            binds.push(Box::new(*id));
        }
    }

    let sql = if clauses.is_empty() {
        "1=1".to_string()
    } else {
        clauses.join(" AND ")
    };

    FilterClauses { sql, binds }
}

pub fn files_where(conn: &Connection, filter: &FileFilter) -> Result<Vec<File>> {
    let clause = build_filter_clause(filter);
    let sql = format!(
        "SELECT id, path, size, inode, device_id, modified_time, scan_id, last_verified,
                is_orphaned, extension, file_hash, hash_algorithm, hash_type, hash_level, hash_calculated
         FROM files WHERE {}
         ORDER BY {} {}
         LIMIT ? OFFSET ?",
        clause.sql,
        filter.order_by.column(),
        filter.order_direction.sql(),
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut binds: Vec<&dyn ToSql> = clause.binds.iter().map(|b| b.as_ref()).collect();
    binds.push(&filter.limit);
    binds.push(&filter.offset);

    let rows = stmt.query_map(params_from_iter(binds), row_to_file)?;
    rows.map(|r| r.map_err(Into::into)).collect()
}

/// Wraps user search text as a phrase literal when it contains
/// path-typical punctuation, so FTS5's query syntax never raises a
/// matcher-syntax error on a path fragment like `S01E02.mkv` (§4.C.3, §8).
fn fts_phrase(text: &str) -> String {
    let needs_phrase = text.chars().any(|c| !c.is_alphanumeric() && c != ' ');
    if needs_phrase {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

pub fn search_files(conn: &Connection, text: &str, filter: &FileFilter) -> Result<Vec<File>> {
    let clause = build_filter_clause(filter);
    let query = fts_phrase(text);
    let sql = format!(
        "SELECT f.id, f.path, f.size, f.inode, f.device_id, f.modified_time, f.scan_id, f.last_verified,
                f.is_orphaned, f.extension, f.file_hash, f.hash_algorithm, f.hash_type, f.hash_level, f.hash_calculated
         FROM files_fts
         JOIN files f ON f.id = files_fts.rowid
         WHERE files_fts MATCH ? AND {}
         ORDER BY {} {}
         LIMIT ? OFFSET ?",
        clause.sql,
        filter.order_by.column(),
        filter.order_direction.sql(),
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut binds: Vec<&dyn ToSql> = vec![&query];
    binds.extend(clause.binds.iter().map(|b| b.as_ref()));
    binds.push(&filter.limit);
    binds.push(&filter.offset);

    let rows = stmt.query_map(params_from_iter(binds), row_to_file)?;
    rows.map(|r| r.map_err(Into::into)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexStore;

    fn sample_file(path: &str, size: i64, device_id: i64, inode: i64) -> File {
        File {
            id: 0,
            path: path.to_string(),
            size,
            inode,
            device_id,
            modified_time: 1000,
            scan_id: Some(1),
            last_verified: 1000,
            is_orphaned: true,
            extension: ".mkv".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_is_idempotent_and_preserves_id() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();

        let file = sample_file("/media/a.mkv", 100, 1, 42);
        let ids1 = upsert_batch(&conn, &[file.clone()]).unwrap();
        let ids2 = upsert_batch(&conn, &[file]).unwrap();
        assert_eq!(ids1, ids2);

        let found = find_by_path(&conn, "/media/a.mkv").unwrap().unwrap();
        assert_eq!(found.id, ids1[0]);
        assert_eq!(found.size, 100);
    }

    #[test]
    fn upsert_overwrites_mutable_columns() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();

        let mut file = sample_file("/media/a.mkv", 100, 1, 42);
        upsert_batch(&conn, &[file.clone()]).unwrap();
        file.size = 200;
        upsert_batch(&conn, &[file]).unwrap();

        let found = find_by_path(&conn, "/media/a.mkv").unwrap().unwrap();
        assert_eq!(found.size, 200);
    }

    #[test]
    fn hardlinks_only_filters_by_shared_device_and_inode() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();

        upsert_batch(
            &conn,
            &[
                sample_file("/media/a.mkv", 100, 1, 42),
                sample_file("/media/b.mkv", 100, 1, 42),
                sample_file("/media/c.mkv", 100, 1, 99),
            ],
        )
        .unwrap();

        let mut filter = FileFilter::new();
        filter.hardlinks_only = true;
        filter.limit = 100;
        let results = files_where(&conn, &filter).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn search_files_matches_substring_and_does_not_error_on_punctuation() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();

        upsert_batch(
            &conn,
            &[sample_file("/media/Show.S01E02.mkv", 100, 1, 1)],
        )
        .unwrap();

        let filter = FileFilter::new();
        let results = search_files(&conn, "S01E02.mkv", &filter).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn order_by_and_direction_default_safely_for_unknown_input() {
        assert_eq!(OrderBy::parse("droptable"), OrderBy::Path);
        assert_eq!(OrderDirection::parse("sideways"), OrderDirection::Asc);
        assert_eq!(OrderBy::parse("size"), OrderBy::Size);
    }
}
