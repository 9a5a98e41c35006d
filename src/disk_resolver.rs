//! Component B: maps device IDs (and union-FS paths) to named physical
//! disks plus free space. Statfs pattern grounded on `sysinfo`'s
//! `src/unix/linux/disk.rs::load_statvfs_values`.

use std::collections::HashMap;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::RwLock;

use chrono::Utc;
use log::warn;

use crate::config::DiskConfig;
use crate::models::DiskInfo;

/// Best-effort statvfs read. Returns `None` on any failure (missing mount,
/// unsupported filesystem, EINTR loop exhausted) rather than propagating an
/// error — a single bad mount must not abort scanning (spec.md §4.B).
fn statvfs_bytes(mount_point: &Path) -> Option<(u64, u64)> {
    let cpath = CString::new(mount_point.as_os_str().as_encoded_bytes()).ok()?;
    unsafe {
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        let rc = loop {
            let rc = libc::statvfs(cpath.as_ptr(), stat.as_mut_ptr());
            if rc == -1 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
            {
                continue;
            }
            break rc;
        };
        if rc != 0 {
            return None;
        }
        let stat = stat.assume_init();
        let bsize = stat.f_frsize.max(stat.f_bsize) as u64;
        let blocks = stat.f_blocks as u64;
        let bavail = stat.f_bavail as u64;
        let total = bsize.saturating_mul(blocks);
        if total == 0 {
            return None;
        }
        let free = bsize.saturating_mul(bavail);
        Some((total, free))
    }
}

fn device_id_of(mount_point: &Path) -> Option<i64> {
    std::fs::metadata(mount_point).ok().map(|m| m.dev() as i64)
}

/// The FUSE/union device id is not configured; it's learned the first time
/// the walker emits a `FileInfo` whose `device_id` matches none of the
/// configured physical disks.
const UNION_DEVICE_SENTINEL: i64 = i64::MIN;

pub struct DiskResolver {
    // device_id -> DiskInfo, plus one slot for the learned union device.
    inner: RwLock<HashMap<i64, DiskInfo>>,
    union_device_id: RwLock<Option<i64>>,
}

impl DiskResolver {
    /// Stats each configured mount point to obtain its device id and free
    /// space. Missing mounts are warned about and excluded, never fatal.
    pub fn new(disks: &[DiskConfig]) -> Self {
        let mut map = HashMap::new();
        for disk in disks {
            let mount_path = Path::new(&disk.mount_path);
            let Some(device_id) = device_id_of(mount_path) else {
                warn!(
                    "disk '{}' at '{}' is not mounted, excluding from resolver",
                    disk.name, disk.mount_path
                );
                continue;
            };
            let (total, free) = statvfs_bytes(mount_path).unwrap_or((0, 0));
            let used = total.saturating_sub(free);
            let used_percent = if total > 0 {
                (used as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            map.insert(
                device_id,
                DiskInfo {
                    name: disk.name.clone(),
                    mount_path: disk.mount_path.clone(),
                    device_id,
                    total_bytes: total,
                    free_bytes: free,
                    used_bytes: used,
                    used_percent,
                    last_updated: Utc::now(),
                },
            );
        }
        Self {
            inner: RwLock::new(map),
            union_device_id: RwLock::new(None),
        }
    }

    /// Refresh free-space stats for all currently known physical disks.
    /// Swapped in wholesale (§5 "Disk resolver map": read-write lock,
    /// swapped wholesale on detection refresh).
    pub fn refresh(&self) {
        let mut map = self.inner.write().unwrap();
        for disk in map.values_mut() {
            if let Some((total, free)) = statvfs_bytes(Path::new(&disk.mount_path)) {
                disk.total_bytes = total;
                disk.free_bytes = free;
                disk.used_bytes = total.saturating_sub(free);
                disk.used_percent = if total > 0 {
                    (disk.used_bytes as f64 / total as f64) * 100.0
                } else {
                    0.0
                };
                disk.last_updated = Utc::now();
            }
        }
    }

    /// Learn the FUSE/union device id the first time a walked file's
    /// `device_id` doesn't match any configured physical disk.
    pub fn observe_device(&self, device_id: i64) {
        if self.is_physical(device_id) {
            return;
        }
        let mut union = self.union_device_id.write().unwrap();
        if union.is_none() {
            *union = Some(device_id);
        }
    }

    pub fn name_of(&self, device_id: i64) -> String {
        let map = self.inner.read().unwrap();
        if let Some(disk) = map.get(&device_id) {
            return disk.name.clone();
        }
        if *self.union_device_id.read().unwrap() == Some(device_id) {
            return "FUSE".to_string();
        }
        "Unknown".to_string()
    }

    /// Opaque UI hint; stable per device id, no semantic meaning here.
    pub fn color_class(&self, device_id: i64) -> String {
        if self.is_union(device_id) {
            return "disk-union".to_string();
        }
        if self.is_physical(device_id) {
            return format!("disk-{}", (device_id.unsigned_abs() % 12));
        }
        "disk-unknown".to_string()
    }

    pub fn all_device_ids(&self) -> Vec<i64> {
        self.inner.read().unwrap().keys().copied().collect()
    }

    pub fn is_physical(&self, device_id: i64) -> bool {
        self.inner.read().unwrap().contains_key(&device_id)
    }

    pub fn is_union(&self, device_id: i64) -> bool {
        *self.union_device_id.read().unwrap() == Some(device_id)
            && device_id != UNION_DEVICE_SENTINEL
    }

    pub fn least_full(&self) -> Option<DiskInfo> {
        self.inner
            .read()
            .unwrap()
            .values()
            .min_by(|a, b| a.used_percent.partial_cmp(&b.used_percent).unwrap())
            .cloned()
    }

    pub fn most_full(&self) -> Option<DiskInfo> {
        self.inner
            .read()
            .unwrap()
            .values()
            .max_by(|a, b| a.used_percent.partial_cmp(&b.used_percent).unwrap())
            .cloned()
    }

    pub fn get(&self, device_id: i64) -> Option<DiskInfo> {
        self.inner.read().unwrap().get(&device_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_mount_is_excluded_not_fatal() {
        let disks = vec![DiskConfig {
            name: "ghost".to_string(),
            mount_path: "/this/path/does/not/exist/ever".to_string(),
        }];
        let resolver = DiskResolver::new(&disks);
        assert!(resolver.all_device_ids().is_empty());
    }

    #[test]
    fn union_device_is_learned_once() {
        let resolver = DiskResolver::new(&[]);
        resolver.observe_device(42);
        resolver.observe_device(99);
        assert!(resolver.is_union(42));
        assert!(!resolver.is_union(99));
        assert_eq!(resolver.name_of(42), "FUSE");
        assert_eq!(resolver.name_of(7), "Unknown");
    }

    #[test]
    fn real_mount_resolves_name_and_stats() {
        let disks = vec![DiskConfig {
            name: "root".to_string(),
            mount_path: "/".to_string(),
        }];
        let resolver = DiskResolver::new(&disks);
        let ids = resolver.all_device_ids();
        assert_eq!(ids.len(), 1);
        assert_eq!(resolver.name_of(ids[0]), "root");
        assert!(resolver.is_physical(ids[0]));
    }
}
