//! Component J: the Scan Controller. Drives the finite state machine
//! described in §4.J — `Initializing -> CountingFiles -> ScanningFilesystem
//! -> (per-service phases) -> RecomputingOrphans -> Completing -> Terminal`
//! — wiring D (walker) -> E (scan worker pool) -> C (store) for the
//! filesystem pass, then F (reconciler) per configured service, and
//! separately G (hasher) -> C and H (dedup) -> I (consolidate) for their
//! own independent passes.

use std::collections::HashMap;
use std::path::PathBuf;

use log::warn;

use crate::consolidate::{self, ConsolidationPlan, PreflightOptions};
use crate::dedup::{self, CrossDiskDuplicate, SameDiskDuplicate};
use crate::disk_resolver::DiskResolver;
use crate::error::Result;
use crate::hasher::{self, HashSummary, HasherConfig};
use crate::models::{AuditAction, File, Scan, ScanStatus, Service};
use crate::path_translator::PathTranslator;
use crate::progress::{LogBus, ProgressTracker};
use crate::reconciler::{self, ServiceEntry};
use crate::scan_worker;
use crate::store::{audit, files, scans, IndexStore};
use crate::walker::{self, CancellationToken, WalkWarning};

/// How many walked entries pass through the forwarder before it persists a
/// fresh `last_processed_path` checkpoint (§4.J).
const CHECKPOINT_INTERVAL: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    CountingFiles,
    ScanningFilesystem,
    ServiceUpdate(Service),
    RecomputingOrphans,
    Completing,
}

impl Phase {
    fn as_string(&self) -> String {
        match self {
            Phase::Initializing => "initializing".to_string(),
            Phase::CountingFiles => "counting_files".to_string(),
            Phase::ScanningFilesystem => "scanning_filesystem".to_string(),
            Phase::ServiceUpdate(svc) => format!("service_update_{}", svc.as_str()),
            Phase::RecomputingOrphans => "recomputing_orphans".to_string(),
            Phase::Completing => "completing".to_string(),
        }
    }
}

struct FilesystemScanOutcome {
    walk_warnings: Vec<WalkWarning>,
    files_touched: u64,
}

pub struct ScanController<'a> {
    store: &'a IndexStore,
    translator: &'a PathTranslator,
    disks: &'a DiskResolver,
    scan_paths: Vec<PathBuf>,
    buffer_size: usize,
    workers: usize,
    batch_size: usize,
    cancel: CancellationToken,
    progress: ProgressTracker,
    log_bus: LogBus,
}

impl<'a> ScanController<'a> {
    pub fn new(
        store: &'a IndexStore,
        translator: &'a PathTranslator,
        disks: &'a DiskResolver,
        scan_paths: Vec<PathBuf>,
        buffer_size: usize,
        workers: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            translator,
            disks,
            scan_paths,
            buffer_size,
            workers,
            batch_size,
            cancel: CancellationToken::new(),
            progress: ProgressTracker::new(),
            log_bus: LogBus::new(),
        }
    }

    /// A clone of the root cancellation token, to wire into signal handling
    /// (§5 "Cancellation"). Cloning an `Arc`-backed token, not spawning a
    /// new one, so calling `.cancel()` on the clone also stops this
    /// controller's in-flight work.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Live counters for whatever this controller is currently driving
    /// (§5 "Progress tracker") — a future HTTP layer polls this directly.
    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Subscribe to this controller's broadcast log lines (§5). Returns the
    /// receiving half of a bounded channel; a slow subscriber is reaped on
    /// the next publish rather than blocking the scan.
    pub fn subscribe_logs(&self, buffer: usize) -> crossbeam_channel::Receiver<String> {
        self.log_bus.subscribe(buffer)
    }

    fn set_phase(&self, scan_id: i64, phase: Phase) -> Result<()> {
        let conn = self.store.conn()?;
        scans::update_phase(&conn, scan_id, &phase.as_string())?;
        self.log_bus.publish(format!("scan {scan_id}: {}", phase.as_string()));
        Ok(())
    }

    /// Runs the filesystem-scan + per-service-reconcile + recompute
    /// sequence of §4.J end to end, enforcing the single-running-scan
    /// invariant (delegated to `scans::start_scan`). `services` supplies one
    /// fetch closure per service to reconcile; fetching the records
    /// themselves is the collaborator's job (§4.F).
    pub fn run_full_scan(
        &self,
        scan_type: &str,
        resume_from_scan_id: Option<i64>,
        services: &[(Service, &dyn Fn() -> Result<Vec<ServiceEntry>>)],
    ) -> Result<i64> {
        let resume_checkpoint = match resume_from_scan_id {
            Some(parent_id) => {
                let conn = self.store.conn()?;
                scans::get_scan(&conn, parent_id)?.and_then(|s| s.last_processed_path)
            }
            None => None,
        };

        let scan_id = {
            let conn = self.store.conn()?;
            scans::start_scan(&conn, scan_type, resume_from_scan_id)?
        };

        match self.drive_full_scan(scan_id, scan_type, resume_checkpoint, services) {
            Ok(()) => Ok(scan_id),
            Err(err) => {
                let conn = self.store.conn()?;
                let _ = scans::append_error(&conn, scan_id, &err.to_string());
                let _ = scans::complete(&conn, scan_id, ScanStatus::Failed, 0);
                Err(err)
            }
        }
    }

    fn drive_full_scan(
        &self,
        scan_id: i64,
        scan_type: &str,
        resume_checkpoint: Option<String>,
        services: &[(Service, &dyn Fn() -> Result<Vec<ServiceEntry>>)],
    ) -> Result<()> {
        self.set_phase(scan_id, Phase::Initializing)?;

        // Counting a terabyte-scale tree up front would cost a second full
        // walk; the phase still exists for parity with the FSM, but its
        // denominator is filled in incrementally as the scan proceeds
        // rather than by a dedicated pre-pass.
        self.set_phase(scan_id, Phase::CountingFiles)?;

        self.set_phase(scan_id, Phase::ScanningFilesystem)?;
        let incremental = scan_type == "incremental";
        let incremental_index = if incremental {
            Some(scan_worker::preload_incremental_index(self.store)?)
        } else {
            None
        };
        let fs_outcome =
            self.scan_filesystem(scan_id, incremental_index.as_ref(), resume_checkpoint)?;

        let mut had_errors = !fs_outcome.walk_warnings.is_empty();
        self.progress.record_scanned(fs_outcome.files_touched);
        {
            let conn = self.store.conn()?;
            scans::increment_files_scanned(&conn, scan_id, fs_outcome.files_touched as i64)?;
            for warning in &fs_outcome.walk_warnings {
                scans::append_error(&conn, scan_id, &format!("{}: {}", warning.path, warning.message))?;
            }
        }
        if !fs_outcome.walk_warnings.is_empty() {
            self.progress.record_errors(fs_outcome.walk_warnings.len() as u64);
        }

        for (service, fetch) in services {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_phase(scan_id, Phase::ServiceUpdate(*service))?;
            match fetch() {
                Ok(records) => {
                    let conn = self.store.conn()?;
                    match reconciler::reconcile_service(&conn, self.translator, scan_id, *service, &records) {
                        Ok(_) => {}
                        Err(err) => {
                            warn!("reconcile for {} failed: {err}", service.as_str());
                            scans::append_error(&conn, scan_id, &err.to_string())?;
                            had_errors = true;
                            self.progress.record_errors(1);
                        }
                    }
                }
                Err(err) => {
                    // Service degradation (§7.2): skip, warn, leave its
                    // prior usage rows untouched, keep scanning.
                    warn!("fetching records for {} failed: {err}", service.as_str());
                    let conn = self.store.conn()?;
                    scans::append_error(&conn, scan_id, &format!("{}: {err}", service.as_str()))?;
                    had_errors = true;
                    self.progress.record_errors(1);
                }
            }
        }

        self.set_phase(scan_id, Phase::RecomputingOrphans)?;
        let conn = self.store.conn()?;
        files::recompute_orphan_status(&conn)?;

        let deleted = if scan_type == "full" && !self.cancel.is_cancelled() {
            files::delete_untouched_by_scan(&conn, scan_id)?
        } else {
            0
        };

        self.set_phase(scan_id, Phase::Completing)?;
        let status = if self.cancel.is_cancelled() {
            ScanStatus::Interrupted
        } else if had_errors {
            ScanStatus::CompletedWithErrors
        } else {
            ScanStatus::Completed
        };
        scans::complete(&conn, scan_id, status, deleted as i64)?;
        Ok(())
    }

    /// Wires D -> E -> C: a walker thread feeds a checkpointing forwarder,
    /// which feeds the worker pool. The forwarder is the sole writer of
    /// `last_processed_path`, persisted every `CHECKPOINT_INTERVAL` entries
    /// so resume never has to replay the whole tree (§4.J).
    fn scan_filesystem(
        &self,
        scan_id: i64,
        incremental_index: Option<&HashMap<String, File>>,
        resume_checkpoint: Option<String>,
    ) -> Result<FilesystemScanOutcome> {
        let (walk_tx, walk_rx) = walker::bounded_channel(self.buffer_size);
        let (work_tx, work_rx) = walker::bounded_channel(self.buffer_size);
        let roots = self.scan_paths.clone();
        let walk_cancel = self.cancel.clone();

        let mut walk_warnings = Vec::new();
        let mut worker_outcome = None;

        std::thread::scope(|scope| -> Result<()> {
            let walk_handle = scope.spawn(move || walker::walk_roots(&roots, walk_tx, walk_cancel, resume_checkpoint));

            let store = self.store;
            let forward_handle = scope.spawn(move || -> Result<()> {
                let conn = store.conn()?;
                let mut since_checkpoint = 0u32;
                for info in walk_rx.iter() {
                    since_checkpoint += 1;
                    if since_checkpoint >= CHECKPOINT_INTERVAL {
                        scans::checkpoint(&conn, scan_id, &info.path)?;
                        since_checkpoint = 0;
                    }
                    if work_tx.send(info).is_err() {
                        break;
                    }
                }
                Ok(())
            });

            worker_outcome = Some(scan_worker::run_workers(
                self.store,
                work_rx,
                scan_id,
                incremental_index,
                self.batch_size,
                self.workers,
                &self.cancel,
            )?);

            let walk_outcome = walk_handle.join().map_err(|_| {
                crate::error::EngineError::InvariantViolation("walker thread panicked".to_string())
            })?;
            forward_handle
                .join()
                .map_err(|_| crate::error::EngineError::InvariantViolation("checkpoint forwarder panicked".to_string()))??;
            walk_warnings = walk_outcome.warnings;
            Ok(())
        })?;

        let worker_outcome = worker_outcome.expect("worker outcome always set before scope exits");
        Ok(FilesystemScanOutcome {
            walk_warnings,
            files_touched: worker_outcome.files_upserted + worker_outcome.files_touched,
        })
    }

    pub fn current_scan(&self) -> Result<Option<Scan>> {
        let conn = self.store.conn()?;
        scans::get_current_scan(&conn)
    }

    /// Component G's independent pass: hash whatever candidates the store
    /// selects, honoring this controller's cancellation token (§4.J "driven
    /// independently").
    pub fn run_hash_phase(
        &self,
        config: &HasherConfig,
        limit: i64,
        on_progress: impl Fn(&File, &HashSummary) + Sync,
    ) -> Result<HashSummary> {
        let conn = self.store.conn()?;
        let summary = hasher::run(&conn, config, &self.cancel, limit, on_progress)?;
        self.progress.record_hashed(summary.files_hashed, summary.bytes_read);
        self.progress.record_errors(summary.errors);
        self.log_bus.publish(format!(
            "hash phase: {} hashed, {} bytes, {} errors",
            summary.files_hashed, summary.bytes_read, summary.errors
        ));
        Ok(summary)
    }

    pub fn find_duplicates(
        &self,
        limit: i64,
    ) -> Result<(Vec<SameDiskDuplicate>, Vec<CrossDiskDuplicate>)> {
        let conn = self.store.conn()?;
        let same_disk = dedup::same_disk_duplicates(&conn, limit)?;
        let cross_disk = dedup::cross_disk_duplicates(&conn, limit)?;
        Ok((same_disk, cross_disk))
    }

    /// Component I's independent pass over one cross-disk duplicate group:
    /// plan, preflight, and (if `execute` is set) perform the delete.
    pub fn consolidate_cross_disk(
        &self,
        group: &CrossDiskDuplicate,
        options: &PreflightOptions,
        execute: bool,
    ) -> Result<Option<ConsolidationPlan>> {
        let Some(plan) = consolidate::plan_cross_disk(group, self.disks) else {
            return Ok(None);
        };
        let conn = self.store.conn()?;
        if let Err(err) = consolidate::preflight(&plan, options) {
            record_preflight_failure(&conn, &err)?;
            return Err(err);
        }
        if execute {
            consolidate::execute_cross_disk(&conn, &plan)?;
        }
        Ok(Some(plan))
    }

    /// Component I's independent pass over one same-disk duplicate group:
    /// hardlink siblings onto the kept cluster.
    pub fn consolidate_same_disk(
        &self,
        group: &SameDiskDuplicate,
        options: &PreflightOptions,
        execute: bool,
    ) -> Result<Option<ConsolidationPlan>> {
        let conn = self.store.conn()?;
        let Some(plan) = consolidate::plan_same_disk_hardlink(&conn, group)? else {
            return Ok(None);
        };
        if let Err(err) = consolidate::preflight(&plan, options) {
            record_preflight_failure(&conn, &err)?;
            return Err(err);
        }
        if execute {
            consolidate::execute_same_disk_hardlink(&conn, &plan)?;
        }
        Ok(Some(plan))
    }
}

/// A preflight failure (strict-verify mismatch, missing keep target,
/// non-writable parent) never touches the filesystem, but still counts as
/// a failed delete for audit purposes (§4.I, spec.md scenario 6).
fn record_preflight_failure(conn: &rusqlite::Connection, err: &crate::error::EngineError) -> Result<()> {
    audit::record(conn, AuditAction::DeleteFailed, "file", None, None, Some(&err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use std::fs;

    fn harness(
        dir: &tempfile::TempDir,
    ) -> (IndexStore, PathTranslator, DiskResolver) {
        let store = IndexStore::open_in_memory().unwrap();
        let translator = PathTranslator::new(Default::default(), Default::default(), 16).unwrap();
        let disks = DiskResolver::new(&[DiskConfig {
            name: "root".to_string(),
            mount_path: dir.path().to_string_lossy().to_string(),
        }]);
        (store, translator, disks)
    }

    #[test]
    fn full_scan_indexes_files_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mkv"), b"hello").unwrap();
        fs::write(dir.path().join("b.mkv"), b"world").unwrap();
        let (store, translator, disks) = harness(&dir);

        let controller = ScanController::new(
            &store,
            &translator,
            &disks,
            vec![dir.path().to_path_buf()],
            16,
            2,
            10,
        );

        let scan_id = controller.run_full_scan("full", None, &[]).unwrap();
        let conn = store.conn().unwrap();
        let scan = scans::get_scan(&conn, scan_id).unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Completed);
        assert_eq!(scan.current_phase, "completing");

        let mut filter = files::FileFilter::new();
        filter.limit = 100;
        let rows = files::files_where(&conn, &filter).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn second_scan_while_running_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, translator, disks) = harness(&dir);
        {
            let conn = store.conn().unwrap();
            scans::start_scan(&conn, "full", None).unwrap();
        }

        let controller = ScanController::new(
            &store,
            &translator,
            &disks,
            vec![dir.path().to_path_buf()],
            16,
            1,
            10,
        );
        let result = controller.run_full_scan("full", None, &[]);
        assert!(matches!(result, Err(crate::error::EngineError::ScanAlreadyRunning(_))));
    }

    #[test]
    fn resume_skips_entries_before_parent_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        fs::write(dir.path().join("m.txt"), b"x").unwrap();
        fs::write(dir.path().join("z.txt"), b"x").unwrap();
        let (store, translator, disks) = harness(&dir);

        let checkpoint = dir.path().join("m.txt").to_string_lossy().to_string();
        let parent_id = {
            let conn = store.conn().unwrap();
            let id = scans::start_scan(&conn, "full", None).unwrap();
            scans::checkpoint(&conn, id, &checkpoint).unwrap();
            scans::complete(&conn, id, ScanStatus::Interrupted, 0).unwrap();
            id
        };

        let controller = ScanController::new(
            &store,
            &translator,
            &disks,
            vec![dir.path().to_path_buf()],
            16,
            1,
            10,
        );
        controller.run_full_scan("full", Some(parent_id), &[]).unwrap();

        let conn = store.conn().unwrap();
        let mut filter = files::FileFilter::new();
        filter.limit = 100;
        let rows = files::files_where(&conn, &filter).unwrap();
        let mut paths: Vec<_> = rows.iter().map(|f| f.path.clone()).collect();
        paths.sort();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("m.txt"));
        assert!(paths[1].ends_with("z.txt"));
    }

    #[test]
    fn full_scan_updates_progress_counters() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mkv"), b"hello").unwrap();
        let (store, translator, disks) = harness(&dir);

        let controller = ScanController::new(&store, &translator, &disks, vec![dir.path().to_path_buf()], 16, 1, 10);
        controller.run_full_scan("full", None, &[]).unwrap();

        assert_eq!(controller.progress().snapshot().files_scanned, 1);
    }

    #[test]
    fn preflight_failure_records_delete_failed_audit() {
        use crate::dedup::CrossDiskDuplicate;

        let dir = tempfile::tempdir().unwrap();
        let (store, translator, disks) = harness(&dir);
        let controller = ScanController::new(&store, &translator, &disks, vec![dir.path().to_path_buf()], 16, 1, 10);

        // Neither file exists on disk, so preflight fails at the keep-target
        // metadata check before anything is touched.
        let group = CrossDiskDuplicate {
            file_hash: "deadbeef".to_string(),
            hash_algorithm: "blake3".to_string(),
            hash_type: "full".to_string(),
            files: vec![
                File { id: 1, path: dir.path().join("missing-a.mkv").to_string_lossy().to_string(), size: 5, device_id: 1, ..Default::default() },
                File { id: 2, path: dir.path().join("missing-b.mkv").to_string_lossy().to_string(), size: 5, device_id: 2, ..Default::default() },
            ],
            wasted_bytes: 5,
        };
        let options = PreflightOptions {
            strict_verify: false,
            hash_algorithm: crate::models::HashAlgorithm::Blake3,
            hash_buffer_size: 4096,
        };

        let result = controller.consolidate_cross_disk(&group, &options, false);
        assert!(result.is_err());

        let conn = store.conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM audit_log WHERE action = 'delete_failed'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
