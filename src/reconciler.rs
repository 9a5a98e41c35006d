//! Component F: the Service Reconciler. Ingests `(path, metadata)` tuples
//! reported by a media service, translates them to canonical paths, and
//! rewrites that service's `Usage` rows (§4.F).
//!
//! Acquiring the remote tuple list is a collaborator's job (§1); this module
//! starts from an already-fetched slice of records satisfying the
//! capability set `{get_path, get_metadata}` the design notes call for
//! (§9 "Polymorphism over services") rather than any service-specific type.

use log::warn;
use rusqlite::Connection;
use serde_json::Value as Json;

use crate::error::Result;
use crate::models::Service;
use crate::path_translator::PathTranslator;
use crate::store::usage::{self, UsageWrite};
use crate::store::files;

/// The capability set a concrete service adapter must supply. No
/// inheritance; any type reporting a path and a metadata blob qualifies.
pub trait ServiceRecord {
    fn get_path(&self) -> &str;
    fn get_metadata(&self) -> Json;
}

/// A plain record satisfying `ServiceRecord`, for adapters that have
/// nothing richer to offer.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub path: String,
    pub metadata: Json,
}

impl ServiceRecord for ServiceEntry {
    fn get_path(&self) -> &str {
        &self.path
    }

    fn get_metadata(&self) -> Json {
        self.metadata.clone()
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReconcileOutcome {
    pub matched: u64,
    pub missing: u64,
}

/// Reconciles one service's claim list against the index (§4.F steps 2-5).
/// Step 1 (fetching the tuple list) and step 6 (recomputing `is_orphaned`
/// across all services) are the caller's responsibility; a service failure
/// here must not abort the scan, so callers should log and continue on
/// `Err`, per §7.2.
pub fn reconcile_service<R: ServiceRecord>(
    conn: &Connection,
    translator: &PathTranslator,
    scan_id: i64,
    service: Service,
    records: &[R],
) -> Result<ReconcileOutcome> {
    let translated: Vec<(String, &R)> = records
        .iter()
        .map(|r| (translator.to_canonical(service.as_str(), r.get_path()), r))
        .collect();

    usage::delete_all_for_service(conn, service)?;

    let paths: Vec<String> = translated.iter().map(|(p, _)| p.clone()).collect();
    let found = files::find_by_paths(conn, &paths)?;
    let mut by_path = std::collections::HashMap::with_capacity(found.len());
    for file in found {
        by_path.insert(file.path.clone(), file.id);
    }

    let mut writes = Vec::with_capacity(translated.len());
    let mut missing = 0u64;
    for (canonical, record) in &translated {
        match by_path.get(canonical) {
            Some(&file_id) => writes.push(UsageWrite {
                file_id,
                service,
                reference_path: record.get_path().to_string(),
                metadata: record.get_metadata(),
            }),
            None => {
                warn!("{} claims missing file '{canonical}'", service.as_str());
                usage::record_missing_file(conn, scan_id, service, canonical)?;
                missing += 1;
            }
        }
    }

    let matched = writes.len() as u64;
    usage::upsert_batch(conn, &writes)?;

    Ok(ReconcileOutcome { matched, missing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{files as store_files, scans, IndexStore};
    use crate::models::File;

    #[test]
    fn matches_translated_paths_and_records_missing() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        let translator =
            PathTranslator::new(Default::default(), Default::default(), 16).unwrap();

        store_files::upsert_batch(
            &conn,
            &[File {
                path: "/media/tv/Show/ep1.mkv".to_string(),
                size: 1,
                inode: 1,
                device_id: 1,
                ..Default::default()
            }],
        )
        .unwrap();
        let scan_id = scans::start_scan(&conn, "service_update_sonarr", None).unwrap();

        let records = vec![
            ServiceEntry {
                path: "/media/tv/Show/ep1.mkv".to_string(),
                metadata: serde_json::json!({"title": "ep1"}),
            },
            ServiceEntry {
                path: "/media/tv/Show/ep2.mkv".to_string(),
                metadata: serde_json::json!({"title": "ep2"}),
            },
        ];

        let outcome =
            reconcile_service(&conn, &translator, scan_id, Service::Sonarr, &records).unwrap();
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.missing, 1);

        let services = usage::services_for_file(
            &conn,
            store_files::find_by_path(&conn, "/media/tv/Show/ep1.mkv")
                .unwrap()
                .unwrap()
                .id,
        )
        .unwrap();
        assert_eq!(services, vec![Service::Sonarr]);
    }

    #[test]
    fn re_reconciling_clears_prior_usage_rows() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();
        let translator =
            PathTranslator::new(Default::default(), Default::default(), 16).unwrap();
        store_files::upsert_batch(
            &conn,
            &[File {
                path: "/media/a.mkv".to_string(),
                size: 1,
                inode: 1,
                device_id: 1,
                ..Default::default()
            }],
        )
        .unwrap();
        let scan_id = scans::start_scan(&conn, "service_update_plex", None).unwrap();

        let first = vec![ServiceEntry {
            path: "/media/a.mkv".to_string(),
            metadata: Json::Null,
        }];
        reconcile_service(&conn, &translator, scan_id, Service::Plex, &first).unwrap();

        let second: Vec<ServiceEntry> = vec![];
        let outcome =
            reconcile_service(&conn, &translator, scan_id, Service::Plex, &second).unwrap();
        assert_eq!(outcome.matched, 0);

        let file_id = store_files::find_by_path(&conn, "/media/a.mkv")
            .unwrap()
            .unwrap()
            .id;
        assert!(usage::services_for_file(&conn, file_id).unwrap().is_empty());
    }
}
