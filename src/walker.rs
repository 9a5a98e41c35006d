//! Component D: parallel directory traversal producing a bounded stream of
//! file records. Grounded on the teacher's use of `walkdir::WalkDir`
//! (`main.rs::find_src_files`), generalized to many roots fanned out in
//! parallel and a cooperative cancellation token, per `dux-core`'s
//! `scanner/walker.rs::CancellationToken`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use log::warn;
use walkdir::WalkDir;

use crate::error::{EngineError, Result};
use crate::models::FileInfo;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Validates that `path` is a usable absolute path: non-empty, no NUL
/// bytes, no relative components.
pub fn validate_absolute_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(EngineError::InvalidPath("empty path".to_string()));
    }
    if path.contains('\0') {
        return Err(EngineError::InvalidPath(format!(
            "path contains NUL byte: {path}"
        )));
    }
    if !Path::new(path).is_absolute() {
        return Err(EngineError::InvalidPath(format!(
            "path is not absolute: {path}"
        )));
    }
    if path.split('/').any(|part| part == "..") {
        return Err(EngineError::InvalidPath(format!(
            "path contains '..': {path}"
        )));
    }
    Ok(())
}

/// One walk error recorded as a non-fatal warning (spec.md §4.D, §7.1).
#[derive(Debug, Clone)]
pub struct WalkWarning {
    pub path: String,
    pub message: String,
}

pub struct WalkOutcome {
    pub warnings: Vec<WalkWarning>,
    pub files_emitted: u64,
}

/// Walks `roots` in parallel (one rayon task per root), emitting
/// `FileInfo` for every regular file into `sender`. Directories and
/// symlinks are not emitted. If `resume_checkpoint` is set, entries whose
/// path sorts lexicographically before it are skipped (scan resume, §4.J).
///
/// Blocks on `sender.send` (bounded channel, no drops, §4.D). Cooperative
/// cancellation is polled before descending into or emitting each entry.
pub fn walk_roots(
    roots: &[PathBuf],
    sender: Sender<FileInfo>,
    cancel: CancellationToken,
    resume_checkpoint: Option<String>,
) -> WalkOutcome {
    let warnings: std::sync::Mutex<Vec<WalkWarning>> = std::sync::Mutex::new(Vec::new());
    let emitted = std::sync::atomic::AtomicU64::new(0);

    rayon::scope(|scope| {
        for root in roots {
            let sender = sender.clone();
            let cancel = cancel.clone();
            let resume_checkpoint = resume_checkpoint.clone();
            let warnings = &warnings;
            let emitted = &emitted;
            scope.spawn(move |_| {
                walk_one_root(root, &sender, &cancel, resume_checkpoint.as_deref(), warnings, emitted);
            });
        }
    });

    WalkOutcome {
        warnings: warnings.into_inner().unwrap(),
        files_emitted: emitted.load(Ordering::Relaxed),
    }
}

fn walk_one_root(
    root: &Path,
    sender: &Sender<FileInfo>,
    cancel: &CancellationToken,
    resume_checkpoint: Option<&str>,
    warnings: &std::sync::Mutex<Vec<WalkWarning>>,
    emitted: &std::sync::atomic::AtomicU64,
) {
    for entry in WalkDir::new(root).into_iter() {
        if cancel.is_cancelled() {
            return;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                warn!("walk error at '{path}': {err}");
                warnings.lock().unwrap().push(WalkWarning {
                    path,
                    message: err.to_string(),
                });
                continue;
            }
        };

        // Symlinks are intentionally skipped; their target is visited
        // through its own canonical path.
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }

        let path_str = entry.path().to_string_lossy().to_string();
        if let Some(checkpoint) = resume_checkpoint {
            if path_str.as_str() < checkpoint {
                continue;
            }
        }

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                warn!("failed to stat '{path_str}': {err}");
                warnings.lock().unwrap().push(WalkWarning {
                    path: path_str,
                    message: err.to_string(),
                });
                continue;
            }
        };

        if cancel.is_cancelled() {
            return;
        }

        let info = FileInfo {
            path: path_str,
            size: meta.len() as i64,
            modified_time: file_mtime(&meta),
            inode: file_inode(&meta),
            device_id: file_device_id(&meta),
        };

        if sender.send(info).is_err() {
            // Receiver dropped; nothing left to do.
            return;
        }
        emitted.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(unix)]
fn file_mtime(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
}

#[cfg(not(unix))]
fn file_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_inode(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino() as i64
}

#[cfg(not(unix))]
fn file_inode(_meta: &std::fs::Metadata) -> i64 {
    0
}

#[cfg(unix)]
fn file_device_id(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.dev() as i64
}

#[cfg(not(unix))]
fn file_device_id(_meta: &std::fs::Metadata) -> i64 {
    0
}

/// Receiver half returned to callers who want to spawn the walk in the
/// background and consume results on the calling thread/pool.
pub fn bounded_channel(capacity: usize) -> (Sender<FileInfo>, Receiver<FileInfo>) {
    crossbeam_channel::bounded(capacity)
}
