//! Shared row types for the index store and the components that query it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A service that can claim a file. The CHECK constraint in the store
/// accepts exactly these, plus whatever a future migration adds (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Plex,
    Sonarr,
    Radarr,
    Qbittorrent,
    Stash,
    Calibre,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Plex => "plex",
            Service::Sonarr => "sonarr",
            Service::Radarr => "radarr",
            Service::Qbittorrent => "qbittorrent",
            Service::Stash => "stash",
            Service::Calibre => "calibre",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "plex" => Service::Plex,
            "sonarr" => Service::Sonarr,
            "radarr" => Service::Radarr,
            "qbittorrent" => Service::Qbittorrent,
            "stash" => Service::Stash,
            "calibre" => Service::Calibre,
            _ => return None,
        })
    }

    pub const ALL: [Service; 6] = [
        Service::Plex,
        Service::Sonarr,
        Service::Radarr,
        Service::Qbittorrent,
        Service::Stash,
        Service::Calibre,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sha256" => HashAlgorithm::Sha256,
            "blake3" => HashAlgorithm::Blake3,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    Quick,
    Partial,
    Full,
}

impl HashType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashType::Quick => "quick",
            HashType::Partial => "partial",
            HashType::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "quick" => HashType::Quick,
            "partial" => HashType::Partial,
            "full" => HashType::Full,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
    CompletedWithErrors,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Interrupted => "interrupted",
            ScanStatus::CompletedWithErrors => "completed_with_errors",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => ScanStatus::Running,
            "completed" => ScanStatus::Completed,
            "failed" => ScanStatus::Failed,
            "interrupted" => ScanStatus::Interrupted,
            "completed_with_errors" => ScanStatus::CompletedWithErrors,
            _ => return None,
        })
    }

    /// Terminal states can't transition further (§3 Scan invariants).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanStatus::Running)
    }
}

/// `scan_type` is an open-ended enum: the fixed variants plus
/// `service_update_<svc>` which is templated per service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanType {
    Full,
    Incremental,
    DiskLocation,
    ServiceUpdateAll,
    ServiceUpdate(Service),
    HashScan,
    Cleanup,
    FileRescan,
}

impl ScanType {
    pub fn as_string(&self) -> String {
        match self {
            ScanType::Full => "full".to_string(),
            ScanType::Incremental => "incremental".to_string(),
            ScanType::DiskLocation => "disk_location".to_string(),
            ScanType::ServiceUpdateAll => "service_update_all".to_string(),
            ScanType::ServiceUpdate(svc) => format!("service_update_{}", svc.as_str()),
            ScanType::HashScan => "hash_scan".to_string(),
            ScanType::Cleanup => "cleanup".to_string(),
            ScanType::FileRescan => "file_rescan".to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "full" => ScanType::Full,
            "incremental" => ScanType::Incremental,
            "disk_location" => ScanType::DiskLocation,
            "service_update_all" => ScanType::ServiceUpdateAll,
            "hash_scan" => ScanType::HashScan,
            "cleanup" => ScanType::Cleanup,
            "file_rescan" => ScanType::FileRescan,
            other => {
                let svc = other.strip_prefix("service_update_")?;
                ScanType::ServiceUpdate(Service::parse(svc)?)
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Delete,
    MarkRescan,
    ConfigChange,
    DeleteFailed,
    Consolidate,
    Hardlink,
    Cleanup,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Delete => "delete",
            AuditAction::MarkRescan => "mark_rescan",
            AuditAction::ConfigChange => "config_change",
            AuditAction::DeleteFailed => "delete_failed",
            AuditAction::Consolidate => "consolidate",
            AuditAction::Hardlink => "hardlink",
            AuditAction::Cleanup => "cleanup",
        }
    }
}

/// One row per canonical path observed on the union filesystem.
#[derive(Debug, Clone, Default)]
pub struct File {
    pub id: i64,
    pub path: String,
    pub size: i64,
    pub inode: i64,
    pub device_id: i64,
    pub modified_time: i64,
    pub scan_id: Option<i64>,
    pub last_verified: i64,
    pub is_orphaned: bool,
    pub extension: String,
    pub file_hash: Option<String>,
    pub hash_algorithm: Option<String>,
    pub hash_type: Option<String>,
    pub hash_level: i64,
    pub hash_calculated: bool,
}

#[derive(Debug, Clone)]
pub struct Usage {
    pub id: i64,
    pub file_id: i64,
    pub service: Service,
    pub reference_path: String,
    pub metadata: Json,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Scan {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ScanStatus,
    pub files_scanned: i64,
    pub errors: Vec<String>,
    pub scan_type: String,
    pub current_phase: String,
    pub last_processed_path: Option<String>,
    pub resume_from_scan_id: Option<i64>,
    pub deleted_files_count: i64,
}

#[derive(Debug, Clone)]
pub struct FileDiskLocation {
    pub id: i64,
    pub file_id: i64,
    pub disk_device_id: i64,
    pub disk_name: String,
    pub disk_path: String,
    pub size: i64,
    pub inode: i64,
    pub modified_time: i64,
}

#[derive(Debug, Clone)]
pub struct DiskInfo {
    pub name: String,
    pub mount_path: String,
    pub device_id: i64,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub used_percent: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<i64>,
    pub scan_id: Option<i64>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Raw record emitted by the Filesystem Walker, one per regular file.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size: i64,
    pub modified_time: i64,
    pub inode: i64,
    pub device_id: i64,
}
