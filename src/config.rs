//! Typed settings accepted by the engine. Loading a YAML file into this
//! struct is an external collaborator's job (out of scope, §1/§6); this
//! module only defines the shape and validates it, the way the teacher's
//! `main()` validates its `Args` with `anyhow::ensure!`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMapping {
    pub from_prefix: String,
    pub to_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database_path: PathBuf,

    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,

    #[serde(default = "default_scan_buffer_size")]
    pub scan_buffer_size: usize,

    #[serde(default = "default_api_timeout", with = "humantime_secs")]
    pub api_timeout: Duration,

    #[serde(default = "default_cors_origin")]
    pub cors_allowed_origin: String,

    #[serde(default = "default_stats_cache_ttl", with = "humantime_secs")]
    pub stats_cache_ttl: Duration,

    #[serde(default = "default_db_max_open_conns")]
    pub db_max_open_conns: u32,

    #[serde(default)]
    pub db_max_idle_conns: u32,

    #[serde(default = "default_db_conn_max_lifetime", with = "humantime_secs")]
    pub db_conn_max_lifetime: Duration,

    #[serde(default)]
    pub local_path_mappings: Vec<PathMapping>,

    #[serde(default)]
    pub service_path_mappings: HashMap<String, Vec<PathMapping>>,

    pub scan_paths: Vec<PathBuf>,

    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,

    #[serde(default)]
    pub disks: Vec<DiskConfig>,
}

fn default_scan_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_scan_buffer_size() -> usize {
    1024
}
fn default_api_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_cors_origin() -> String {
    "*".to_string()
}
fn default_stats_cache_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_db_max_open_conns() -> u32 {
    8
}
fn default_db_conn_max_lifetime() -> Duration {
    Duration::from_secs(3600)
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

impl EngineConfig {
    /// Validate the recognized keys listed in spec.md §6.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.scan_workers >= 1, "scan_workers must be >= 1");
        ensure!(self.scan_buffer_size >= 1, "scan_buffer_size must be >= 1");
        ensure!(
            self.api_timeout.as_secs() >= 1,
            "api_timeout must be >= 1s"
        );
        ensure!(
            self.cors_allowed_origin == "*"
                || self.cors_allowed_origin.starts_with("http://")
                || self.cors_allowed_origin.starts_with("https://"),
            "cors_allowed_origin must be '*' or start with http(s)://",
        );
        ensure!(
            self.db_max_open_conns >= 1,
            "db_max_open_conns must be >= 1"
        );
        ensure!(!self.scan_paths.is_empty(), "scan_paths must be non-empty");

        for mapping in &self.local_path_mappings {
            validate_prefix(&mapping.from_prefix)?;
            validate_prefix(&mapping.to_prefix)?;
        }
        for mappings in self.service_path_mappings.values() {
            for mapping in mappings {
                validate_prefix(&mapping.from_prefix)?;
                validate_prefix(&mapping.to_prefix)?;
            }
        }

        Ok(())
    }
}

fn validate_prefix(prefix: &str) -> Result<()> {
    ensure!(
        prefix.starts_with('/'),
        "path mapping prefix '{prefix}' must be absolute",
    );
    ensure!(
        !prefix.split('/').any(|part| part == ".."),
        "path mapping prefix '{prefix}' must not contain '..'",
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> EngineConfig {
        EngineConfig {
            database_path: "/tmp/test.db".into(),
            scan_workers: 4,
            scan_buffer_size: 1024,
            api_timeout: Duration::from_secs(30),
            cors_allowed_origin: "*".to_string(),
            stats_cache_ttl: Duration::from_secs(60),
            db_max_open_conns: 8,
            db_max_idle_conns: 2,
            db_conn_max_lifetime: Duration::from_secs(3600),
            local_path_mappings: vec![],
            service_path_mappings: HashMap::new(),
            scan_paths: vec!["/media".into()],
            services: HashMap::new(),
            disks: vec![],
        }
    }

    #[test]
    fn rejects_empty_scan_paths() {
        let mut config = base_config();
        config.scan_paths.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_relative_prefix() {
        let mut config = base_config();
        config.local_path_mappings.push(PathMapping {
            from_prefix: "media".into(),
            to_prefix: "/mnt/media".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_dotdot_prefix() {
        let mut config = base_config();
        config.local_path_mappings.push(PathMapping {
            from_prefix: "/media/../etc".into(),
            to_prefix: "/mnt/media".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_cors_origin() {
        let mut config = base_config();
        config.cors_allowed_origin = "ftp://x".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_valid_config() {
        assert!(base_config().validate().is_ok());
    }
}
