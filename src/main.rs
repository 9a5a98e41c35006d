use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use argh::FromArgs;

use unionscan::config::EngineConfig;
use unionscan::controller::ScanController;
use unionscan::disk_resolver::DiskResolver;
use unionscan::hasher::HasherConfig;
use unionscan::models::{HashAlgorithm, Service};
use unionscan::path_translator::PathTranslator;
use unionscan::reconciler::ServiceEntry;
use unionscan::store::{scans, IndexStore, StoreLimits};

/// unionscan - indexes a union filesystem across multiple disks, finding
/// orphaned files and duplicates, and safely consolidating them.
///
/// Loading `--config` as JSON is a placeholder for the real configuration
/// loader (YAML parsing is an external collaborator's concern, not this
/// engine's — see the config module docs).
#[derive(FromArgs, Debug)]
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Scan(ScanArgs),
    Resume(ResumeArgs),
    Hash(HashArgs),
    Dedupe(DedupeArgs),
    Consolidate(ConsolidateArgs),
    Reconcile(ReconcileArgs),
}

/// run a full or incremental filesystem scan
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "scan")]
struct ScanArgs {
    /// path to the JSON-encoded engine configuration
    #[argh(option, short = 'c')]
    config: PathBuf,

    /// scan only files changed since the prior scan
    #[argh(switch)]
    incremental: bool,
}

/// resume a previously interrupted scan
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "resume")]
struct ResumeArgs {
    #[argh(option, short = 'c')]
    config: PathBuf,

    /// id of the interrupted scan to resume from
    #[argh(option)]
    from_scan_id: i64,
}

/// progressively hash unhashed files
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "hash")]
struct HashArgs {
    #[argh(option, short = 'c')]
    config: PathBuf,

    /// maximum number of candidates to hash in this invocation
    #[argh(option, default = "10_000")]
    limit: i64,

    /// sha256 or blake3 (default blake3)
    #[argh(option, default = "String::from(\"blake3\")")]
    algorithm: String,

    /// target hash level 0-6 (default 6, full hash)
    #[argh(option, default = "6")]
    level: u8,
}

/// list same-disk and cross-disk duplicate groups
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "dedupe")]
struct DedupeArgs {
    #[argh(option, short = 'c')]
    config: PathBuf,

    #[argh(option, default = "1_000")]
    limit: i64,
}

/// plan and optionally execute consolidation of duplicate groups
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "consolidate")]
struct ConsolidateArgs {
    #[argh(option, short = 'c')]
    config: PathBuf,

    /// re-hash both files before deleting/linking
    #[argh(switch)]
    strict_verify: bool,

    /// actually perform the plan rather than just printing it
    #[argh(switch)]
    execute: bool,

    #[argh(option, default = "1_000")]
    limit: i64,
}

/// reconcile one service's claimed files against the index
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "reconcile")]
struct ReconcileArgs {
    #[argh(option, short = 'c')]
    config: PathBuf,

    /// service name: plex, sonarr, radarr, qbittorrent, stash, calibre
    #[argh(option)]
    service: String,

    /// path to a JSON array of {"path": ..., "metadata": ...} records
    #[argh(option)]
    records_file: PathBuf,
}

fn load_config(path: &PathBuf) -> Result<EngineConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&raw).context("failed to parse config JSON")?;
    config.validate()?;
    Ok(config)
}

fn open_store(config: &EngineConfig) -> Result<IndexStore> {
    let limits = StoreLimits {
        max_open_conns: config.db_max_open_conns,
        max_idle_conns: config.db_max_idle_conns,
        conn_max_lifetime: config.db_conn_max_lifetime,
        ..StoreLimits::default()
    };
    IndexStore::open(&config.database_path, limits).context("failed to open index store")
}

fn build_translator(config: &EngineConfig) -> Result<PathTranslator> {
    PathTranslator::new(
        config.local_path_mappings.clone(),
        config.service_path_mappings.clone(),
        4096,
    )
    .context("failed to build path translator")
}

fn build_controller<'a>(
    config: &EngineConfig,
    store: &'a IndexStore,
    translator: &'a PathTranslator,
    disks: &'a DiskResolver,
) -> ScanController<'a> {
    ScanController::new(
        store,
        translator,
        disks,
        config.scan_paths.clone(),
        config.scan_buffer_size,
        config.scan_workers,
        unionscan::store::files::BATCH_SIZE,
    )
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    let time = Instant::now();

    match args.command {
        Command::Scan(cmd) => {
            let config = load_config(&cmd.config)?;
            let store = open_store(&config)?;
            let translator = build_translator(&config)?;
            let disks = DiskResolver::new(&config.disks);
            let controller = build_controller(&config, &store, &translator, &disks);

            let scan_type = if cmd.incremental { "incremental" } else { "full" };
            let scan_id = controller.run_full_scan(scan_type, None, &[])?;
            log::info!("scan {scan_id} finished in {:.2}s", time.elapsed().as_secs_f32());
        }
        Command::Resume(cmd) => {
            let config = load_config(&cmd.config)?;
            let store = open_store(&config)?;
            let translator = build_translator(&config)?;
            let disks = DiskResolver::new(&config.disks);
            let controller = build_controller(&config, &store, &translator, &disks);

            let conn = store.conn()?;
            let parent = scans::get_scan(&conn, cmd.from_scan_id)?
                .ok_or(unionscan::error::EngineError::ScanNotFound(cmd.from_scan_id))?;
            drop(conn);

            let scan_id = controller.run_full_scan(&parent.scan_type, Some(cmd.from_scan_id), &[])?;
            log::info!("resumed scan {scan_id} finished in {:.2}s", time.elapsed().as_secs_f32());
        }
        Command::Hash(cmd) => {
            let config = load_config(&cmd.config)?;
            let store = open_store(&config)?;
            let translator = build_translator(&config)?;
            let disks = DiskResolver::new(&config.disks);
            let controller = build_controller(&config, &store, &translator, &disks);

            let algorithm = HashAlgorithm::parse(&cmd.algorithm)
                .ok_or_else(|| anyhow::anyhow!("unknown hash algorithm '{}'", cmd.algorithm))?;
            let hasher_config = HasherConfig {
                algorithm,
                target_level: cmd.level,
                workers: config.scan_workers,
                ..HasherConfig::default()
            };
            let summary = controller.run_hash_phase(&hasher_config, cmd.limit, |file, _| {
                log::debug!("hashed {}", file.path);
            })?;
            log::info!(
                "hashed {} files ({} bytes read, {} errors) in {:.2}s",
                summary.files_hashed,
                summary.bytes_read,
                summary.errors,
                time.elapsed().as_secs_f32()
            );
        }
        Command::Dedupe(cmd) => {
            let config = load_config(&cmd.config)?;
            let store = open_store(&config)?;
            let translator = build_translator(&config)?;
            let disks = DiskResolver::new(&config.disks);
            let controller = build_controller(&config, &store, &translator, &disks);

            let (same_disk, cross_disk) = controller.find_duplicates(cmd.limit)?;
            for group in &same_disk {
                println!(
                    "[same-disk] {} clusters, potential savings {} bytes",
                    group.clusters.len(),
                    group.potential_savings
                );
            }
            for group in &cross_disk {
                println!(
                    "[cross-disk] {} copies, wasted {} bytes",
                    group.files.len(),
                    group.wasted_bytes
                );
            }
        }
        Command::Consolidate(cmd) => {
            let config = load_config(&cmd.config)?;
            let store = open_store(&config)?;
            let translator = build_translator(&config)?;
            let disks = DiskResolver::new(&config.disks);
            let controller = build_controller(&config, &store, &translator, &disks);

            let options = unionscan::consolidate::PreflightOptions {
                strict_verify: cmd.strict_verify,
                hash_algorithm: HashAlgorithm::Blake3,
                hash_buffer_size: 4 * 1024 * 1024,
            };

            let (same_disk, cross_disk) = controller.find_duplicates(cmd.limit)?;
            for group in &same_disk {
                match controller.consolidate_same_disk(group, &options, cmd.execute) {
                    Ok(Some(plan)) => println!(
                        "[same-disk] keep '{}', link {} file(s): {}",
                        plan.keep_file.path,
                        plan.delete_files.len(),
                        plan.reason
                    ),
                    Ok(None) => {}
                    Err(err) => log::warn!("same-disk plan failed: {err}"),
                }
            }
            for group in &cross_disk {
                match controller.consolidate_cross_disk(group, &options, cmd.execute) {
                    Ok(Some(plan)) => println!(
                        "[cross-disk] keep '{}', delete {} file(s): {}",
                        plan.keep_file.path,
                        plan.delete_files.len(),
                        plan.reason
                    ),
                    Ok(None) => {}
                    Err(err) => log::warn!("cross-disk plan failed: {err}"),
                }
            }
        }
        Command::Reconcile(cmd) => {
            let config = load_config(&cmd.config)?;
            let store = open_store(&config)?;
            let translator = build_translator(&config)?;

            let service = Service::parse(&cmd.service)
                .ok_or_else(|| anyhow::anyhow!("unknown service '{}'", cmd.service))?;
            let raw = fs::read_to_string(&cmd.records_file)
                .with_context(|| format!("failed to read records file '{}'", cmd.records_file.display()))?;
            let records: Vec<ServiceEntry> =
                serde_json::from_str(&raw).context("failed to parse records JSON")?;

            let scan_type = format!("service_update_{}", service.as_str());
            let conn = store.conn()?;
            let scan_id = scans::start_scan(&conn, &scan_type, None)?;
            match unionscan::reconciler::reconcile_service(&conn, &translator, scan_id, service, &records) {
                Ok(outcome) => {
                    unionscan::store::files::recompute_orphan_status(&conn)?;
                    scans::complete(&conn, scan_id, unionscan::models::ScanStatus::Completed, 0)?;
                    log::info!(
                        "reconciled {}: {} matched, {} missing",
                        service.as_str(),
                        outcome.matched,
                        outcome.missing
                    );
                }
                Err(err) => {
                    scans::append_error(&conn, scan_id, &err.to_string())?;
                    scans::complete(&conn, scan_id, unionscan::models::ScanStatus::Failed, 0)?;
                    return Err(err.into());
                }
            }
        }
    }

    Ok(())
}
