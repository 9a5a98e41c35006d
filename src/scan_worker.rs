//! Component E: the Scan Worker Pool. Consumes the walker's channel,
//! batches upserts into the Index Store, and honors cancellation (§4.E).
//! Extension extraction itself lives in `extension.rs`.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use crossbeam_channel::Receiver;
use log::warn;

use crate::error::Result;
use crate::extension::extract_extension;
use crate::models::{File, FileInfo};
use crate::store::{files, IndexStore};
use crate::walker::CancellationToken;

/// Protects the shared upsert buffer; add and flush are mutually exclusive
/// and flush only returns once its transaction commits (§5 "Batch
/// accumulator").
pub struct BatchAccumulator {
    buffer: Mutex<Vec<File>>,
    batch_size: usize,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size,
        }
    }

    /// Adds `file`, flushing if the buffer has reached capacity.
    fn add(&self, store: &IndexStore, file: File) -> Result<()> {
        let should_flush = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push(file);
            buffer.len() >= self.batch_size
        };
        if should_flush {
            self.flush(store)?;
        }
        Ok(())
    }

    /// Flushes whatever is buffered, even a partial batch. Safe to call
    /// repeatedly; a no-op when empty.
    pub fn flush(&self, store: &IndexStore) -> Result<()> {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap();
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return Ok(());
        }
        let conn = store.conn()?;
        files::upsert_batch(&conn, &batch)?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct WorkerOutcome {
    pub files_upserted: u64,
    pub files_touched: u64,
    pub errors: Vec<String>,
}

/// A fixed pool of `worker_count` threads draining `receiver`, each doing
/// the per-file decision described in §4.E steps 1-4. `incremental_index`,
/// when set, is the in-memory path→row map preloaded for incremental scans
/// (step 1); its absence means full-scan mode, which looks each path up in
/// the store directly.
pub fn run_workers(
    store: &IndexStore,
    receiver: Receiver<FileInfo>,
    scan_id: i64,
    incremental_index: Option<&HashMap<String, File>>,
    batch_size: usize,
    worker_count: usize,
    cancel: &CancellationToken,
) -> Result<WorkerOutcome> {
    let accumulator = BatchAccumulator::new(batch_size);
    let upserted = std::sync::atomic::AtomicU64::new(0);
    let touched = std::sync::atomic::AtomicU64::new(0);
    let errors: Mutex<Vec<String>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let accumulator = &accumulator;
            let upserted = &upserted;
            let touched = &touched;
            let errors = &errors;
            scope.spawn(move || {
                let conn_result = store.conn();
                let conn = match conn_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        errors.lock().unwrap().push(err.to_string());
                        return;
                    }
                };

                for info in receiver.iter() {
                    if cancel.is_cancelled() {
                        // Drain nothing further; finish the file in hand
                        // only (there is none, we haven't started one).
                        break;
                    }

                    let existing = match incremental_index {
                        Some(index) => index.get(&info.path).cloned(),
                        None => match files::find_by_path(&conn, &info.path) {
                            Ok(found) => found,
                            Err(err) => {
                                errors.lock().unwrap().push(err.to_string());
                                continue;
                            }
                        },
                    };

                    let now = Utc::now().timestamp();

                    match existing {
                        Some(existing) if incremental_index.is_some() && existing.modified_time == info.modified_time => {
                            if let Err(err) = files::touch(&conn, existing.id, now, scan_id) {
                                warn!("failed to touch '{}': {err}", info.path);
                                errors.lock().unwrap().push(err.to_string());
                            } else {
                                touched.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                        }
                        existing => {
                            let file = File {
                                id: existing.map(|f| f.id).unwrap_or_default(),
                                path: info.path.clone(),
                                size: info.size,
                                inode: info.inode,
                                device_id: info.device_id,
                                modified_time: info.modified_time,
                                scan_id: Some(scan_id),
                                last_verified: now,
                                is_orphaned: true,
                                extension: extract_extension(&info.path),
                                ..Default::default()
                            };
                            if let Err(err) = accumulator.add(store, file) {
                                warn!("failed to enqueue '{}': {err}", info.path);
                                errors.lock().unwrap().push(err.to_string());
                            } else {
                                upserted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                        }
                    }
                }
            });
        }
    });

    // Graceful and immediate shutdown both flush what was accumulated; no
    // silent data loss (§4.E "Shutdown order").
    accumulator.flush(store)?;

    Ok(WorkerOutcome {
        files_upserted: upserted.load(std::sync::atomic::Ordering::Relaxed),
        files_touched: touched.load(std::sync::atomic::Ordering::Relaxed),
        errors: errors.into_inner().unwrap(),
    })
}

/// Preloads the full path→row map for an incremental scan (§4.E step 1).
pub fn preload_incremental_index(store: &IndexStore) -> Result<HashMap<String, File>> {
    let conn = store.conn()?;
    // SQLite treats a negative LIMIT as unbounded; we want every row.
    let filter = files::FileFilter {
        limit: -1,
        ..Default::default()
    };
    let rows = files::files_where(&conn, &filter)?;
    Ok(rows.into_iter().map(|f| (f.path.clone(), f)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::scans;
    use crate::walker;

    #[test]
    fn new_files_are_upserted_as_orphaned() {
        let store = IndexStore::open_in_memory().unwrap();
        let scan_id = {
            let conn = store.conn().unwrap();
            scans::start_scan(&conn, "full", None).unwrap()
        };

        let (tx, rx) = walker::bounded_channel(4);
        tx.send(FileInfo {
            path: "/media/a.mkv".to_string(),
            size: 100,
            modified_time: 1000,
            inode: 1,
            device_id: 1,
        })
        .unwrap();
        drop(tx);

        let outcome = run_workers(&store, rx, scan_id, None, 10, 2, &CancellationToken::new()).unwrap();
        assert_eq!(outcome.files_upserted, 1);
        assert!(outcome.errors.is_empty());

        let conn = store.conn().unwrap();
        let file = files::find_by_path(&conn, "/media/a.mkv").unwrap().unwrap();
        assert!(file.is_orphaned);
        assert_eq!(file.extension, ".mkv");
    }

    #[test]
    fn unchanged_incremental_file_is_only_touched() {
        let store = IndexStore::open_in_memory().unwrap();
        let scan_id = {
            let conn = store.conn().unwrap();
            let first_scan = scans::start_scan(&conn, "full", None).unwrap();
            files::upsert_batch(
                &conn,
                &[File {
                    path: "/media/a.mkv".to_string(),
                    size: 100,
                    inode: 1,
                    device_id: 1,
                    modified_time: 1000,
                    scan_id: Some(first_scan),
                    ..Default::default()
                }],
            )
            .unwrap();
            scans::complete(&conn, first_scan, crate::models::ScanStatus::Completed, 0).unwrap();
            scans::start_scan(&conn, "incremental", None).unwrap()
        };

        let index = preload_incremental_index(&store).unwrap();
        let (tx, rx) = walker::bounded_channel(4);
        tx.send(FileInfo {
            path: "/media/a.mkv".to_string(),
            size: 100,
            modified_time: 1000,
            inode: 1,
            device_id: 1,
        })
        .unwrap();
        drop(tx);

        let outcome = run_workers(&store, rx, scan_id, Some(&index), 10, 1, &CancellationToken::new()).unwrap();
        assert_eq!(outcome.files_touched, 1);
        assert_eq!(outcome.files_upserted, 0);
    }
}
