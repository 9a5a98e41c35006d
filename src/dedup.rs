//! Component H: the Duplicate Grouper. A thin orchestration layer over the
//! Index Store's structured duplicate queries (`store::dedup_queries`),
//! adding the clustering and savings math the store doesn't own (§4.H).

use std::collections::HashMap;

use rusqlite::Connection;

use crate::error::Result;
use crate::models::File;
use crate::store::dedup_queries::{self, CrossDiskGroup, SameDiskGroup};

/// A maximal set of `File` rows sharing `(device_id, inode)` within one
/// same-disk duplicate group — a "hardlink cluster" in the glossary sense.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub device_id: i64,
    pub inode: i64,
    pub files: Vec<File>,
}

impl Cluster {
    /// `already_linked = cluster.count > 1` (§4.H).
    pub fn already_linked(&self) -> bool {
        self.files.len() > 1
    }
}

#[derive(Debug, Clone)]
pub struct SameDiskDuplicate {
    pub file_hash: String,
    pub hash_algorithm: String,
    pub hash_type: String,
    pub device_id: i64,
    pub clusters: Vec<Cluster>,
    /// `(unique_clusters - 1) * max_size` (§4.H, §8 "Same-disk savings").
    pub potential_savings: i64,
}

#[derive(Debug, Clone)]
pub struct CrossDiskDuplicate {
    pub file_hash: String,
    pub hash_algorithm: String,
    pub hash_type: String,
    pub files: Vec<File>,
    /// `(copies - 1) * size` (§4.H, §8 "Cross-disk savings").
    pub wasted_bytes: i64,
}

/// Clusters hardlinked siblings within each same-disk duplicate group so
/// they count once toward savings, per §4.H and §8's "same-disk savings"
/// property (`= 0` when all files in a group already share an inode).
pub fn same_disk_duplicates(conn: &Connection, limit: i64) -> Result<Vec<SameDiskDuplicate>> {
    let groups = dedup_queries::same_disk_duplicate_groups(conn, limit)?;
    Ok(groups.into_iter().map(cluster_same_disk_group).collect())
}

fn cluster_same_disk_group(group: SameDiskGroup) -> SameDiskDuplicate {
    let mut by_inode: HashMap<(i64, i64), Vec<File>> = HashMap::new();
    let mut max_size = 0i64;
    for file in group.files {
        max_size = max_size.max(file.size);
        by_inode
            .entry((file.device_id, file.inode))
            .or_default()
            .push(file);
    }

    let clusters: Vec<Cluster> = by_inode
        .into_iter()
        .map(|((device_id, inode), files)| Cluster {
            device_id,
            inode,
            files,
        })
        .collect();

    let unique_clusters = clusters.len() as i64;
    let potential_savings = (unique_clusters - 1).max(0) * max_size;

    SameDiskDuplicate {
        file_hash: group.file_hash,
        hash_algorithm: group.hash_algorithm,
        hash_type: group.hash_type,
        device_id: group.device_id,
        clusters,
        potential_savings,
    }
}

/// §4.H cross-disk groups: `wasted = (copies - 1) * size` (§8).
pub fn cross_disk_duplicates(conn: &Connection, limit: i64) -> Result<Vec<CrossDiskDuplicate>> {
    let groups = dedup_queries::cross_disk_duplicate_groups(conn, limit)?;
    Ok(groups.into_iter().map(annotate_cross_disk_group).collect())
}

fn annotate_cross_disk_group(group: CrossDiskGroup) -> CrossDiskDuplicate {
    let size = group.files.iter().map(|f| f.size).max().unwrap_or(0);
    let copies = group.files.len() as i64;
    let wasted_bytes = (copies - 1).max(0) * size;

    CrossDiskDuplicate {
        file_hash: group.file_hash,
        hash_algorithm: group.hash_algorithm,
        hash_type: group.hash_type,
        files: group.files,
        wasted_bytes,
    }
}

pub use dedup_queries::{hardlink_groups, HardlinkGroup, HardlinkOrder};
pub use crate::store::files::OrderDirection;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::File;
    use crate::store::{files, IndexStore};

    fn hashed(path: &str, device_id: i64, inode: i64, size: i64) -> File {
        File {
            path: path.to_string(),
            size,
            inode,
            device_id,
            file_hash: Some("h1".to_string()),
            hash_algorithm: Some("blake3".to_string()),
            hash_type: Some("full".to_string()),
            hash_level: 6,
            hash_calculated: true,
            ..Default::default()
        }
    }

    #[test]
    fn already_linked_pair_contributes_one_cluster() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        files::upsert_batch(
            &conn,
            &[
                hashed("/d1/a.mkv", 1, 10, 1_000_000_000),
                hashed("/d1/b.mkv", 1, 10, 1_000_000_000),
                hashed("/d1/c.mkv", 1, 11, 1_000_000_000),
                hashed("/d1/d.mkv", 1, 12, 1_000_000_000),
            ],
        )
        .unwrap();

        let groups = same_disk_duplicates(&conn, 10).unwrap();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.clusters.len(), 3);
        assert_eq!(group.potential_savings, 2 * 1_000_000_000);
        let linked: Vec<_> = group.clusters.iter().filter(|c| c.already_linked()).collect();
        assert_eq!(linked.len(), 1);
    }

    #[test]
    fn fully_hardlinked_group_has_zero_savings() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        files::upsert_batch(
            &conn,
            &[hashed("/d1/a.mkv", 1, 10, 500), hashed("/d1/b.mkv", 1, 10, 500)],
        )
        .unwrap();

        let groups = same_disk_duplicates(&conn, 10).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].potential_savings, 0);
    }

    #[test]
    fn cross_disk_wasted_space_matches_copies_minus_one() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        files::upsert_batch(
            &conn,
            &[
                hashed("/d1/a.mkv", 1, 10, 2_000),
                hashed("/d2/a.mkv", 2, 20, 2_000),
            ],
        )
        .unwrap();

        let groups = cross_disk_duplicates(&conn, 10).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].wasted_bytes, 2_000);
    }
}
