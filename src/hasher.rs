//! Component G: the Progressive Hasher. Escalates digest cost only as far
//! as needed, amortizing the cost of hashing a terabyte-scale library
//! (§4.G). Streaming-hash pattern grounded on the teacher's
//! `worker.rs::compute_hash` (`fs::File` + fixed buffer + `blake3::Hasher`),
//! generalized to multiple byte budgets, two algorithms, and a rate limiter.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use rayon::prelude::*;
use rusqlite::Connection;

use crate::error::Result;
use crate::models::{File, HashAlgorithm, HashType};
use crate::store::files;
use crate::walker::CancellationToken;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Byte budget for levels 1..5; level 6 always reads the whole file and
/// level 0 reads nothing (§4.G).
fn budget_bytes(level: u8) -> u64 {
    match level {
        0 => 0,
        1 => MIB,
        2 => 10 * MIB,
        3 => 100 * MIB,
        4 => GIB,
        5 => 10 * GIB,
        _ => u64::MAX,
    }
}

/// Clamps a requested level down to the highest level (at least 1) whose
/// budget is strictly less than the file's size — reading past the file's
/// actual size buys nothing. Level 6 always runs in full; level 0 never
/// hashes at all (§4.G).
pub fn effective_level(requested: u8, size: u64) -> u8 {
    if requested == 0 {
        return 0;
    }
    if requested >= 6 {
        return 6;
    }
    let mut effective = 1u8;
    for level in 1..=requested {
        if budget_bytes(level) < size {
            effective = level;
        }
    }
    effective
}

enum StreamingHasher {
    Blake3(blake3::Hasher),
    Sha256(sha2::Sha256),
}

impl StreamingHasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => StreamingHasher::Blake3(blake3::Hasher::new()),
            HashAlgorithm::Sha256 => StreamingHasher::Sha256(sha2::Sha256::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            StreamingHasher::Blake3(h) => {
                h.update(bytes);
            }
            StreamingHasher::Sha256(h) => {
                use sha2::Digest;
                h.update(bytes);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Blake3(h) => h.finalize().to_hex().to_string(),
            StreamingHasher::Sha256(h) => {
                use sha2::Digest;
                format!("{:x}", h.finalize())
            }
        }
    }
}

#[cfg(unix)]
fn advise_sequential(file: &std::fs::File) {
    use std::os::unix::io::AsRawFd;
    let _ = nix::fcntl::posix_fadvise(
        file.as_raw_fd(),
        0,
        0,
        nix::fcntl::PosixFadviseAdvice::POSIX_FADV_SEQUENTIAL,
    );
}
#[cfg(not(unix))]
fn advise_sequential(_file: &std::fs::File) {}

#[cfg(unix)]
fn advise_drop_cache(file: &std::fs::File) {
    use std::os::unix::io::AsRawFd;
    let _ = nix::fcntl::posix_fadvise(
        file.as_raw_fd(),
        0,
        0,
        nix::fcntl::PosixFadviseAdvice::POSIX_FADV_DONTNEED,
    );
}
#[cfg(not(unix))]
fn advise_drop_cache(_file: &std::fs::File) {}

/// Reads up to `budget` bytes of `path` (or the whole file when `budget` is
/// `u64::MAX`) through `algorithm`, with `size` folded in first so
/// same-content different-size files never collide (§4.G).
fn hash_with_budget(
    path: &str,
    size: u64,
    budget: u64,
    algorithm: HashAlgorithm,
    buffer_size: usize,
) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    advise_sequential(&file);

    let mut hasher = StreamingHasher::new(algorithm);
    hasher.update(&size.to_le_bytes());

    let mut remaining = budget;
    let mut buffer = vec![0u8; buffer_size.max(1)];
    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);
        let n = file.read(&mut buffer[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }

    if size > GIB {
        advise_drop_cache(&file);
    }
    drop(file);
    Ok(hasher.finalize_hex())
}

/// `hash_type = quick, hash_level = 1`: `size || first_1MiB || last_1MiB`.
/// Two files of different sizes never share a quick hash (§4.G, §8).
pub fn quick_hash(path: &str, size: u64, algorithm: HashAlgorithm) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    advise_sequential(&file);

    let mut hasher = StreamingHasher::new(algorithm);
    hasher.update(&size.to_le_bytes());

    let mut head = vec![0u8; MIB.min(size) as usize];
    file.read_exact(&mut head)?;
    hasher.update(&head);

    if size > MIB {
        let tail_len = MIB.min(size);
        file.seek(SeekFrom::End(-(tail_len as i64)))?;
        let mut tail = vec![0u8; tail_len as usize];
        file.read_exact(&mut tail)?;
        hasher.update(&tail);
    }

    Ok(hasher.finalize_hex())
}

/// `hash_type = full, hash_level = 6`.
pub fn full_hash(
    path: &str,
    size: u64,
    algorithm: HashAlgorithm,
    buffer_size: usize,
) -> std::io::Result<String> {
    hash_with_budget(path, size, u64::MAX, algorithm, buffer_size)
}

/// `hash_type = partial` at the given effective level.
pub fn progressive_hash(
    path: &str,
    size: u64,
    level: u8,
    algorithm: HashAlgorithm,
    buffer_size: usize,
) -> std::io::Result<String> {
    if level >= 6 {
        return full_hash(path, size, algorithm, buffer_size);
    }
    hash_with_budget(path, size, budget_bytes(level), algorithm, buffer_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingStrategy {
    SmallestFirst,
    LargestFirst,
    Random,
    ByPath,
    BySizeThenPath,
    ByMtimeDesc,
    ByMtimeAsc,
    DbOrder,
}

impl OrderingStrategy {
    /// Unknown values default to `DbOrder` (§4.C.4's allow-list pattern
    /// applied to the hasher's own candidate selection).
    pub fn parse(s: &str) -> Self {
        match s {
            "smallest_first" => OrderingStrategy::SmallestFirst,
            "largest_first" => OrderingStrategy::LargestFirst,
            "random" => OrderingStrategy::Random,
            "by_path" => OrderingStrategy::ByPath,
            "by_size_then_path" => OrderingStrategy::BySizeThenPath,
            "by_mtime_desc" => OrderingStrategy::ByMtimeDesc,
            "by_mtime_asc" => OrderingStrategy::ByMtimeAsc,
            _ => OrderingStrategy::DbOrder,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            OrderingStrategy::SmallestFirst => "size ASC",
            OrderingStrategy::LargestFirst => "size DESC",
            OrderingStrategy::Random => "RANDOM()",
            OrderingStrategy::ByPath => "path ASC",
            OrderingStrategy::BySizeThenPath => "size ASC, path ASC",
            OrderingStrategy::ByMtimeDesc => "modified_time DESC",
            OrderingStrategy::ByMtimeAsc => "modified_time ASC",
            OrderingStrategy::DbOrder => "id ASC",
        }
    }
}

/// Shared ceiling on aggregate read throughput across all hasher workers,
/// expressed in MiB/s. Briefly released across its own sleep so one
/// throttled worker does not starve its siblings (§9 "Rate-limited
/// sleeping under mutex").
pub struct RateLimiter {
    ceiling_bytes_per_sec: u64,
    window: Mutex<(Instant, u64)>,
}

impl RateLimiter {
    pub fn new(mib_per_sec: u64) -> Self {
        Self {
            ceiling_bytes_per_sec: mib_per_sec.saturating_mul(MIB).max(1),
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Call before reading `bytes`. May block the calling thread, but the
    /// internal mutex is not held across that block.
    fn throttle(&self, bytes: u64) {
        let sleep_for = {
            let mut window = self.window.lock().unwrap();
            let now = Instant::now();
            if now.duration_since(window.0) >= Duration::from_secs(1) {
                window.0 = now;
                window.1 = 0;
            }
            window.1 += bytes;
            if window.1 > self.ceiling_bytes_per_sec {
                let overflow = window.1 - self.ceiling_bytes_per_sec;
                Duration::from_secs_f64(overflow as f64 / self.ceiling_bytes_per_sec as f64)
            } else {
                Duration::ZERO
            }
        };
        if !sleep_for.is_zero() {
            std::thread::sleep(sleep_for);
        }
    }
}

pub struct HasherConfig {
    pub algorithm: HashAlgorithm,
    pub buffer_size: usize,
    pub rate_limit_mib_per_sec: Option<u64>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub ordering: OrderingStrategy,
    pub workers: usize,
    pub target_level: u8,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Blake3,
            buffer_size: 4 * MIB as usize,
            rate_limit_mib_per_sec: None,
            min_size: None,
            max_size: None,
            ordering: OrderingStrategy::DbOrder,
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            target_level: 6,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HashSummary {
    pub files_hashed: u64,
    pub bytes_read: u64,
    pub errors: u64,
}

/// Runs the worker pool over candidates selected by the store (§4.G
/// "Worker loop"). `on_progress` is called after each file; it's the
/// caller's hook into the progress tracker / log bus (component-adjacent
/// to J, see `progress.rs`).
pub fn run(
    conn: &Connection,
    config: &HasherConfig,
    cancel: &CancellationToken,
    limit: i64,
    on_progress: impl Fn(&File, &HashSummary) + Sync,
) -> Result<HashSummary> {
    let candidates = files::hash_candidates(
        conn,
        config.min_size,
        config.max_size,
        config.ordering.sql(),
        limit,
    )?;

    let rate_limiter = config.rate_limit_mib_per_sec.map(RateLimiter::new);
    let hashed = AtomicU64::new(0);
    let bytes_read = AtomicU64::new(0);
    let errors = AtomicU64::new(0);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers.max(1))
        .build()
        .map_err(|e| crate::error::EngineError::InvariantViolation(e.to_string()))?;

    let results: Mutex<Vec<(i64, String)>> = Mutex::new(Vec::new());

    pool.install(|| {
        candidates.par_iter().for_each(|file| {
            if cancel.is_cancelled() {
                return;
            }
            let size = file.size.max(0) as u64;
            let level = effective_level(config.target_level, size);
            if level == 0 {
                // L0: no hashing requested, `hash_calculated` stays false (§4.G).
                return;
            }
            if let Some(limiter) = &rate_limiter {
                limiter.throttle(budget_for(level, size));
            }

            let outcome = if level >= 6 {
                full_hash(&file.path, size, config.algorithm, config.buffer_size)
            } else {
                progressive_hash(&file.path, size, level, config.algorithm, config.buffer_size)
            };

            match outcome {
                Ok(digest) => {
                    results.lock().unwrap().push((file.id, digest));
                    hashed.fetch_add(1, Ordering::Relaxed);
                    bytes_read.fetch_add(budget_for(level, size), Ordering::Relaxed);
                }
                Err(err) => {
                    warn!("hashing '{}' failed: {err}", file.path);
                    errors.fetch_add(1, Ordering::Relaxed);
                }
            }

            let snapshot = HashSummary {
                files_hashed: hashed.load(Ordering::Relaxed),
                bytes_read: bytes_read.load(Ordering::Relaxed),
                errors: errors.load(Ordering::Relaxed),
            };
            on_progress(file, &snapshot);
        });
    });

    let hash_type = if config.target_level >= 6 {
        HashType::Full
    } else {
        HashType::Partial
    };
    for (file_id, digest) in results.into_inner().unwrap() {
        let level = candidates
            .iter()
            .find(|f| f.id == file_id)
            .map(|f| effective_level(config.target_level, f.size.max(0) as u64))
            .unwrap_or(config.target_level);
        files::update_hash(
            conn,
            file_id,
            &digest,
            config.algorithm.as_str(),
            hash_type.as_str(),
            level as i64,
        )?;
    }

    Ok(HashSummary {
        files_hashed: hashed.load(Ordering::Relaxed),
        bytes_read: bytes_read.load(Ordering::Relaxed),
        errors: errors.load(Ordering::Relaxed),
    })
}

fn budget_for(level: u8, size: u64) -> u64 {
    budget_bytes(level).min(size)
}

/// Iterates levels 2..=6, each time re-hashing only files still colliding
/// at the previous level, stopping early once no collisions remain (§4.G
/// "Progressive verification", §8 "Progressive monotonicity").
pub fn verify_duplicates_progressive(
    conn: &Connection,
    algorithm: HashAlgorithm,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut total_rehashed = 0u64;
    for level in 2..=6u8 {
        if cancel.is_cancelled() {
            break;
        }
        let colliders = files::files_with_hash_duplicates_at_level(conn, (level - 1) as i64)?;
        if colliders.is_empty() {
            break;
        }
        for file in &colliders {
            if cancel.is_cancelled() {
                break;
            }
            let size = file.size.max(0) as u64;
            let effective = effective_level(level, size);
            match progressive_hash(&file.path, size, effective, algorithm, buffer_size) {
                Ok(digest) => {
                    let hash_type = if effective >= 6 { HashType::Full } else { HashType::Partial };
                    files::update_hash(
                        conn,
                        file.id,
                        &digest,
                        algorithm.as_str(),
                        hash_type.as_str(),
                        effective as i64,
                    )?;
                    total_rehashed += 1;
                }
                Err(err) => warn!("progressive re-hash of '{}' failed: {err}", file.path),
            }
        }
    }
    Ok(total_rehashed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_level_clamps_small_files_to_l1() {
        assert_eq!(effective_level(5, 1024), 1);
    }

    #[test]
    fn effective_level_escalates_for_large_files() {
        assert_eq!(effective_level(5, 50 * MIB), 2);
        assert_eq!(effective_level(3, 50 * MIB), 2);
    }

    #[test]
    fn level_six_always_runs_full_regardless_of_size() {
        assert_eq!(effective_level(6, 10), 6);
    }

    #[test]
    fn level_zero_never_escalates() {
        assert_eq!(effective_level(0, 10), 0);
        assert_eq!(effective_level(0, 50 * MIB), 0);
    }

    #[test]
    fn quick_hash_differs_for_different_sizes_same_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, vec![1u8; 100]).unwrap();
        std::fs::write(&b, vec![1u8; 200]).unwrap();

        let ha = quick_hash(a.to_str().unwrap(), 100, HashAlgorithm::Blake3).unwrap();
        let hb = quick_hash(b.to_str().unwrap(), 200, HashAlgorithm::Blake3).unwrap();
        assert_ne!(ha, hb);
    }

    #[test]
    fn full_hash_is_stable_for_same_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"identical content").unwrap();
        let h1 = full_hash(path.to_str().unwrap(), 17, HashAlgorithm::Blake3, 4096).unwrap();
        let h2 = full_hash(path.to_str().unwrap(), 17, HashAlgorithm::Blake3, 4096).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn rate_limiter_does_not_deadlock_across_many_calls() {
        let limiter = RateLimiter::new(1_000_000);
        for _ in 0..5 {
            limiter.throttle(1024);
        }
    }
}
