//! Component I: the Consolidator. Plans and executes the two destructive
//! operations the engine performs: cross-disk delete and same-disk atomic
//! hardlink (§4.I). Every execution path appends an audit record; failures
//! are per-file and never abort the rest of the plan (§7.4).

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::warn;
use rusqlite::Connection;

use crate::dedup::{Cluster, CrossDiskDuplicate, SameDiskDuplicate};
use crate::disk_resolver::DiskResolver;
use crate::error::Result;
use crate::hasher::full_hash;
use crate::models::{AuditAction, File, HashAlgorithm};
use crate::store::{audit, files, usage};

#[derive(Debug, Clone)]
pub struct ConsolidationPlan {
    pub group_key: String,
    pub keep_file: File,
    pub delete_files: Vec<File>,
    pub keep_disk: Option<i64>,
    pub delete_disks: Vec<i64>,
    pub reason: String,
    pub savings: i64,
}

/// Cross-disk policy: keep the copy on the least-full physical disk among
/// the group's members; ties go to whichever was encountered first (§4.I).
pub fn plan_cross_disk(group: &CrossDiskDuplicate, disks: &DiskResolver) -> Option<ConsolidationPlan> {
    let mut best: Option<(&File, f64)> = None;
    for file in &group.files {
        let used_percent = disks.get(file.device_id).map(|d| d.used_percent).unwrap_or(f64::MAX);
        match &best {
            Some((_, current)) if used_percent >= *current => {}
            _ => best = Some((file, used_percent)),
        }
    }
    let (keep_file, used_percent) = best?;
    let keep_file = keep_file.clone();
    let delete_files: Vec<File> = group
        .files
        .iter()
        .filter(|f| f.id != keep_file.id)
        .cloned()
        .collect();
    if delete_files.is_empty() {
        return None;
    }
    let delete_disks = delete_files.iter().map(|f| f.device_id).collect();

    Some(ConsolidationPlan {
        group_key: group.file_hash.clone(),
        keep_disk: Some(keep_file.device_id),
        delete_disks,
        reason: format!("kept copy on least-full disk (used {used_percent:.1}%)"),
        savings: group.wasted_bytes,
        delete_files,
        keep_file,
    })
}

/// Same-disk policy: keep the cluster already referenced by >= 1 service
/// usage; otherwise the oldest by `modified_time` (§4.I).
pub fn plan_same_disk_hardlink(
    conn: &Connection,
    group: &SameDiskDuplicate,
) -> Result<Option<ConsolidationPlan>> {
    if group.clusters.len() < 2 {
        return Ok(None);
    }

    let mut keep_index = None;
    for (idx, cluster) in group.clusters.iter().enumerate() {
        if cluster_has_usage(conn, cluster)? {
            keep_index = Some(idx);
            break;
        }
    }
    let keep_index = keep_index.unwrap_or_else(|| {
        group
            .clusters
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.files.iter().map(|f| f.modified_time).min().unwrap_or(i64::MAX))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    });

    let keep_cluster = &group.clusters[keep_index];
    let keep_file = keep_cluster.files[0].clone();
    let delete_files: Vec<File> = group
        .clusters
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != keep_index)
        .flat_map(|(_, c)| c.files.clone())
        .collect();
    if delete_files.is_empty() {
        return Ok(None);
    }

    Ok(Some(ConsolidationPlan {
        group_key: group.file_hash.clone(),
        keep_disk: Some(keep_file.device_id),
        delete_disks: Vec::new(),
        reason: if cluster_has_usage(conn, keep_cluster)? {
            "kept copy already claimed by a service".to_string()
        } else {
            "kept oldest copy by modified_time".to_string()
        },
        savings: group.potential_savings,
        delete_files,
        keep_file,
    }))
}

fn cluster_has_usage(conn: &Connection, cluster: &Cluster) -> Result<bool> {
    for file in &cluster.files {
        if !usage::services_for_file(conn, file.id)?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone, Copy)]
pub struct PreflightOptions {
    pub strict_verify: bool,
    pub hash_algorithm: HashAlgorithm,
    pub hash_buffer_size: usize,
}

/// Idempotent, side-effect-free checks run before executing a plan (§4.I
/// "Preflight"). A sentinel temp file proves the parent directory is
/// writable without actually mutating anything durable.
pub fn preflight(plan: &ConsolidationPlan, options: &PreflightOptions) -> Result<()> {
    let keep_path = Path::new(&plan.keep_file.path);
    let meta = std::fs::metadata(keep_path).map_err(|e| {
        crate::error::EngineError::InvariantViolation(format!(
            "keep target '{}' does not exist: {e}",
            plan.keep_file.path
        ))
    })?;
    if !meta.is_file() {
        return Err(crate::error::EngineError::InvariantViolation(format!(
            "keep target '{}' is not a regular file",
            plan.keep_file.path
        )));
    }

    for delete_file in &plan.delete_files {
        if let Some(parent) = Path::new(&delete_file.path).parent() {
            assert_writable(parent)?;
        }
    }

    if options.strict_verify {
        let keep_size = meta.len();
        let keep_hash = full_hash(
            &plan.keep_file.path,
            keep_size,
            options.hash_algorithm,
            options.hash_buffer_size,
        )
        .map_err(|e| crate::error::EngineError::InvariantViolation(e.to_string()))?;

        for delete_file in &plan.delete_files {
            let size = delete_file.size.max(0) as u64;
            let digest = full_hash(&delete_file.path, size, options.hash_algorithm, options.hash_buffer_size)
                .map_err(|e| crate::error::EngineError::InvariantViolation(e.to_string()))?;
            if digest != keep_hash {
                return Err(crate::error::EngineError::InvariantViolation(format!(
                    "strict-verify hash mismatch: '{}' does not match keep file",
                    delete_file.path
                )));
            }
        }
    }

    Ok(())
}

fn assert_writable(dir: &Path) -> Result<()> {
    let sentinel = dir.join(format!(".unionscan-writable-check-{}", std::process::id()));
    std::fs::write(&sentinel, b"").map_err(|e| {
        crate::error::EngineError::InvariantViolation(format!(
            "parent directory '{}' is not writable: {e}",
            dir.display()
        ))
    })?;
    let _ = std::fs::remove_file(&sentinel);
    Ok(())
}

/// Cross-disk execution: `unlink` each delete file, then drop its `File`
/// row (cascades to `usage`). Best-effort across files by design — not
/// atomic (§4.I).
pub fn execute_cross_disk(conn: &Connection, plan: &ConsolidationPlan) -> Result<u64> {
    let mut deleted = 0u64;
    for delete_file in &plan.delete_files {
        match std::fs::remove_file(&delete_file.path) {
            Ok(()) => {
                files::delete_by_id(conn, delete_file.id)?;
                audit::record(
                    conn,
                    AuditAction::Delete,
                    "file",
                    Some(delete_file.id),
                    None,
                    Some(&plan.reason),
                )?;
                deleted += 1;
            }
            Err(err) => {
                warn!("failed to delete '{}': {err}", delete_file.path);
                audit::record(
                    conn,
                    AuditAction::DeleteFailed,
                    "file",
                    Some(delete_file.id),
                    None,
                    Some(&err.to_string()),
                )?;
            }
        }
    }
    Ok(deleted)
}

/// Same-disk execution: hardlink each delete path onto the keep file's
/// inode via a same-directory temp file and an atomic rename (§4.I).
pub fn execute_same_disk_hardlink(conn: &Connection, plan: &ConsolidationPlan) -> Result<u64> {
    let keep_meta = std::fs::metadata(&plan.keep_file.path)?;
    let keep_inode = keep_meta.ino() as i64;
    let keep_device = keep_meta.dev() as i64;

    let mut linked = 0u64;
    for delete_file in &plan.delete_files {
        if delete_file.inode == keep_inode && delete_file.device_id == keep_device {
            continue;
        }
        match hardlink_one(conn, plan, delete_file, keep_inode, keep_device) {
            Ok(()) => linked += 1,
            Err(err) => warn!("hardlink of '{}' failed: {err}", delete_file.path),
        }
    }
    Ok(linked)
}

fn hardlink_one(
    conn: &Connection,
    plan: &ConsolidationPlan,
    delete_file: &File,
    keep_inode: i64,
    keep_device: i64,
) -> Result<()> {
    let delete_path = Path::new(&delete_file.path);
    let parent = delete_path.parent().unwrap_or_else(|| Path::new("/"));
    let temp_path: PathBuf = parent.join(format!(".hardlink-temp-{}", std::process::id()));

    let result = (|| -> Result<()> {
        std::fs::hard_link(&plan.keep_file.path, &temp_path)?;
        std::fs::rename(&temp_path, delete_path)?;

        let verify = std::fs::metadata(delete_path)?;
        if verify.ino() as i64 != keep_inode {
            return Err(crate::error::EngineError::InvariantViolation(format!(
                "post-hardlink inode mismatch for '{}'",
                delete_file.path
            )));
        }

        files::update_disk_identity(conn, delete_file.id, keep_device, keep_inode)?;
        audit::record(
            conn,
            AuditAction::Hardlink,
            "file",
            Some(delete_file.id),
            None,
            Some(&plan.reason),
        )?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use crate::dedup::{cross_disk_duplicates, same_disk_duplicates};
    use crate::store::{files as store_files, IndexStore};
    use tempfile::tempdir;

    fn hashed(path: &str, device_id: i64, inode: i64, size: i64, mtime: i64) -> File {
        File {
            path: path.to_string(),
            size,
            inode,
            device_id,
            modified_time: mtime,
            file_hash: Some("h1".to_string()),
            hash_algorithm: Some("blake3".to_string()),
            hash_type: Some("full".to_string()),
            hash_level: 6,
            hash_calculated: true,
            ..Default::default()
        }
    }

    #[test]
    fn same_disk_hardlink_plan_prefers_claimed_cluster() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        store_files::upsert_batch(
            &conn,
            &[
                hashed("/d1/a.mkv", 1, 10, 100, 1000),
                hashed("/d1/b.mkv", 1, 11, 100, 2000),
            ],
        )
        .unwrap();
        let file_a = store_files::find_by_path(&conn, "/d1/a.mkv").unwrap().unwrap();
        usage::upsert_batch(
            &conn,
            &[usage::UsageWrite {
                file_id: file_a.id,
                service: crate::models::Service::Plex,
                reference_path: "/d1/a.mkv".to_string(),
                metadata: serde_json::Value::Null,
            }],
        )
        .unwrap();

        let groups = same_disk_duplicates(&conn, 10).unwrap();
        let plan = plan_same_disk_hardlink(&conn, &groups[0]).unwrap().unwrap();
        assert_eq!(plan.keep_file.path, "/d1/a.mkv");
        assert_eq!(plan.delete_files.len(), 1);
        assert_eq!(plan.delete_files[0].path, "/d1/b.mkv");
    }

    #[test]
    fn cross_disk_plan_keeps_least_full_disk() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let disks = DiskResolver::new(&[
            DiskConfig { name: "a".to_string(), mount_path: dir_a.path().to_string_lossy().to_string() },
            DiskConfig { name: "b".to_string(), mount_path: dir_b.path().to_string_lossy().to_string() },
        ]);
        let ids = disks.all_device_ids();

        let group = CrossDiskDuplicate {
            file_hash: "h1".to_string(),
            hash_algorithm: "blake3".to_string(),
            hash_type: "full".to_string(),
            files: vec![
                hashed("/d1/a.mkv", ids[0], 1, 1000, 0),
                hashed("/d2/a.mkv", ids[1], 2, 1000, 0),
            ],
            wasted_bytes: 1000,
        };

        let plan = plan_cross_disk(&group, &disks).unwrap();
        assert_eq!(plan.delete_files.len(), 1);
        assert_ne!(plan.keep_file.path, plan.delete_files[0].path);
    }

    #[test]
    fn execute_cross_disk_deletes_file_and_audits() {
        let dir = tempdir().unwrap();
        let keep_path = dir.path().join("keep.mkv");
        let delete_path = dir.path().join("delete.mkv");
        std::fs::write(&keep_path, b"content").unwrap();
        std::fs::write(&delete_path, b"content").unwrap();

        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        let ids = store_files::upsert_batch(
            &conn,
            &[
                File { path: keep_path.to_string_lossy().to_string(), size: 7, inode: 1, device_id: 1, ..Default::default() },
                File { path: delete_path.to_string_lossy().to_string(), size: 7, inode: 2, device_id: 1, ..Default::default() },
            ],
        )
        .unwrap();

        let keep_file = store_files::find_by_path(&conn, &keep_path.to_string_lossy()).unwrap().unwrap();
        let delete_file = store_files::find_by_path(&conn, &delete_path.to_string_lossy()).unwrap().unwrap();
        let plan = ConsolidationPlan {
            group_key: "h1".to_string(),
            keep_file,
            delete_files: vec![delete_file],
            keep_disk: Some(1),
            delete_disks: vec![1],
            reason: "test".to_string(),
            savings: 7,
        };

        let deleted = execute_cross_disk(&conn, &plan).unwrap();
        assert_eq!(deleted, 1);
        assert!(!delete_path.exists());
        assert!(store_files::find_by_path(&conn, &plan.delete_files[0].path).unwrap().is_none());
        let _ = ids;
    }
}
