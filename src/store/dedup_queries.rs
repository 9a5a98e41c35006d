//! Structured duplicate-group queries backing the Duplicate Grouper
//! (§4.C "Query patterns", §4.H). These return raw grouped rows; clustering
//! hardlinked siblings within a same-disk group is the caller's job
//! (`dedup.rs`), per spec's split between store queries and grouper logic.

use rusqlite::Connection;

use crate::error::Result;
use crate::models::File;

use super::files::row_to_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardlinkOrder {
    LinkCount,
    SpaceSaved,
    FirstPath,
}

impl HardlinkOrder {
    pub fn parse(s: &str) -> Self {
        match s {
            "space_saved" => HardlinkOrder::SpaceSaved,
            "first_path" => HardlinkOrder::FirstPath,
            _ => HardlinkOrder::LinkCount,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HardlinkGroup {
    pub device_id: i64,
    pub inode: i64,
    pub size: i64,
    pub link_count: i64,
    pub space_saved: i64,
    pub files: Vec<File>,
}

/// Groups by `(device_id, inode)`, paginated over groups (not rows), via a
/// CTE computing `space_saved = max(size) * (count - 1)` (§4.C).
pub fn hardlink_groups(
    conn: &Connection,
    search: Option<&str>,
    order: HardlinkOrder,
    direction: super::files::OrderDirection,
    limit: i64,
    offset: i64,
) -> Result<Vec<HardlinkGroup>> {
    let order_col = match order {
        HardlinkOrder::LinkCount => "link_count",
        HardlinkOrder::SpaceSaved => "space_saved",
        HardlinkOrder::FirstPath => "first_path",
    };
    let dir = match direction {
        super::files::OrderDirection::Asc => "ASC",
        super::files::OrderDirection::Desc => "DESC",
    };

    let search_clause = if search.is_some() {
        "AND path LIKE '%' || ?1 || '%'"
    } else {
        ""
    };

    let sql = format!(
        "WITH groups AS (
            SELECT device_id, inode, MAX(size) AS size, COUNT(*) AS link_count,
                   MAX(size) * (COUNT(*) - 1) AS space_saved, MIN(path) AS first_path
            FROM files
            WHERE 1=1 {search_clause}
            GROUP BY device_id, inode
            HAVING COUNT(*) > 1
         )
         SELECT device_id, inode, size, link_count, space_saved
         FROM groups
         ORDER BY {order_col} {dir}
         LIMIT ?{n} OFFSET ?{n2}",
        n = if search.is_some() { 2 } else { 1 },
        n2 = if search.is_some() { 3 } else { 2 },
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(i64, i64, i64, i64, i64)> = if let Some(text) = search {
        stmt.query_map(rusqlite::params![text, limit, offset], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(rusqlite::params![limit, offset], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut groups = Vec::with_capacity(rows.len());
    for (device_id, inode, size, link_count, space_saved) in rows {
        let mut member_stmt = conn.prepare(
            "SELECT id, path, size, inode, device_id, modified_time, scan_id, last_verified,
                    is_orphaned, extension, file_hash, hash_algorithm, hash_type, hash_level, hash_calculated
             FROM files WHERE device_id = ?1 AND inode = ?2 ORDER BY path",
        )?;
        let files = member_stmt
            .query_map(rusqlite::params![device_id, inode], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        groups.push(HardlinkGroup {
            device_id,
            inode,
            size,
            link_count,
            space_saved,
            files,
        });
    }
    Ok(groups)
}

#[derive(Debug, Clone)]
pub struct SameDiskGroup {
    pub file_hash: String,
    pub hash_algorithm: String,
    pub hash_type: String,
    pub device_id: i64,
    pub files: Vec<File>,
}

/// `GROUP BY file_hash, hash_algorithm, hash_type, device_id HAVING
/// count(*) > 1` (§4.H). Clustering by `(device_id, inode)` to detect
/// already-hardlinked siblings happens in `dedup.rs`.
pub fn same_disk_duplicate_groups(conn: &Connection, limit: i64) -> Result<Vec<SameDiskGroup>> {
    let mut stmt = conn.prepare(
        "SELECT file_hash, hash_algorithm, hash_type, device_id
         FROM files
         WHERE hash_calculated = 1
         GROUP BY file_hash, hash_algorithm, hash_type, device_id
         HAVING COUNT(*) > 1
         LIMIT ?1",
    )?;
    let keys: Vec<(String, String, String, i64)> = stmt
        .query_map([limit], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut groups = Vec::with_capacity(keys.len());
    for (hash, algo, htype, device_id) in keys {
        let mut member_stmt = conn.prepare(
            "SELECT id, path, size, inode, device_id, modified_time, scan_id, last_verified,
                    is_orphaned, extension, file_hash, hash_algorithm, hash_type, hash_level, hash_calculated
             FROM files
             WHERE file_hash = ?1 AND hash_algorithm = ?2 AND hash_type = ?3 AND device_id = ?4
             ORDER BY path",
        )?;
        let files = member_stmt
            .query_map(rusqlite::params![hash, algo, htype, device_id], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        groups.push(SameDiskGroup {
            file_hash: hash,
            hash_algorithm: algo,
            hash_type: htype,
            device_id,
            files,
        });
    }
    Ok(groups)
}

#[derive(Debug, Clone)]
pub struct CrossDiskGroup {
    pub file_hash: String,
    pub hash_algorithm: String,
    pub hash_type: String,
    pub files: Vec<File>,
}

/// `GROUP BY file_hash, hash_algorithm, hash_type HAVING count(distinct
/// device_id) > 1`, ordered by descending `size * (copies - 1)` (§4.H).
pub fn cross_disk_duplicate_groups(conn: &Connection, limit: i64) -> Result<Vec<CrossDiskGroup>> {
    let mut stmt = conn.prepare(
        "SELECT file_hash, hash_algorithm, hash_type
         FROM files
         WHERE hash_calculated = 1
         GROUP BY file_hash, hash_algorithm, hash_type
         HAVING COUNT(DISTINCT device_id) > 1
         ORDER BY MAX(size) * (COUNT(*) - 1) DESC
         LIMIT ?1",
    )?;
    let keys: Vec<(String, String, String)> = stmt
        .query_map([limit], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut groups = Vec::with_capacity(keys.len());
    for (hash, algo, htype) in keys {
        let mut member_stmt = conn.prepare(
            "SELECT id, path, size, inode, device_id, modified_time, scan_id, last_verified,
                    is_orphaned, extension, file_hash, hash_algorithm, hash_type, hash_level, hash_calculated
             FROM files
             WHERE file_hash = ?1 AND hash_algorithm = ?2 AND hash_type = ?3
             ORDER BY path",
        )?;
        let files = member_stmt
            .query_map(rusqlite::params![hash, algo, htype], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        groups.push(CrossDiskGroup {
            file_hash: hash,
            hash_algorithm: algo,
            hash_type: htype,
            files,
        });
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{files, IndexStore};
    use crate::models::File;

    fn hashed_file(path: &str, device_id: i64, inode: i64, size: i64, hash: &str) -> File {
        File {
            path: path.to_string(),
            size,
            inode,
            device_id,
            file_hash: Some(hash.to_string()),
            hash_algorithm: Some("blake3".to_string()),
            hash_type: Some("full".to_string()),
            hash_level: 6,
            hash_calculated: true,
            ..Default::default()
        }
    }

    #[test]
    fn cross_disk_group_requires_distinct_devices() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        files::upsert_batch(
            &conn,
            &[
                hashed_file("/disk1/a.mkv", 1, 10, 1_000, "h1"),
                hashed_file("/disk2/a.mkv", 2, 20, 1_000, "h1"),
            ],
        )
        .unwrap();

        let groups = cross_disk_duplicate_groups(&conn, 10).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].files.len(), 2);
    }

    #[test]
    fn same_disk_group_excludes_cross_disk_duplicates() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        files::upsert_batch(
            &conn,
            &[
                hashed_file("/disk1/a.mkv", 1, 10, 1_000, "h1"),
                hashed_file("/disk1/b.mkv", 1, 11, 1_000, "h1"),
                hashed_file("/disk2/c.mkv", 2, 20, 1_000, "h1"),
            ],
        )
        .unwrap();

        let groups = same_disk_duplicate_groups(&conn, 10).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].device_id, 1);
        assert_eq!(groups[0].files.len(), 2);
    }

    #[test]
    fn hardlink_groups_computes_space_saved() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        files::upsert_batch(
            &conn,
            &[
                File { path: "/disk1/a.mkv".into(), size: 500, inode: 7, device_id: 1, ..Default::default() },
                File { path: "/disk1/b.mkv".into(), size: 500, inode: 7, device_id: 1, ..Default::default() },
            ],
        )
        .unwrap();

        let groups = hardlink_groups(
            &conn,
            None,
            HardlinkOrder::LinkCount,
            super::super::files::OrderDirection::Desc,
            10,
            0,
        )
        .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].link_count, 2);
        assert_eq!(groups[0].space_saved, 500);
    }
}
