//! Usage table operations backing the Service Reconciler (§4.F).

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value as Json;

use crate::error::Result;
use crate::models::Service;

pub struct UsageWrite {
    pub file_id: i64,
    pub service: Service,
    pub reference_path: String,
    pub metadata: Json,
}

pub fn delete_all_for_service(conn: &Connection, service: Service) -> Result<u64> {
    let deleted = conn.execute("DELETE FROM usage WHERE service = ?1", [service.as_str()])?;
    Ok(deleted as u64)
}

pub fn upsert_batch(conn: &Connection, writes: &[UsageWrite]) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO usage (file_id, service, reference_path, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(file_id, service) DO UPDATE SET
            reference_path = excluded.reference_path,
            metadata = excluded.metadata,
            updated_at = excluded.updated_at",
    )?;
    for write in writes {
        stmt.execute(params![
            write.file_id,
            write.service.as_str(),
            write.reference_path,
            write.metadata.to_string(),
            now,
        ])?;
    }
    Ok(())
}

pub fn record_missing_file(conn: &Connection, scan_id: i64, service: Service, path: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO service_missing_files (scan_id, service, path, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![scan_id, service.as_str(), path, now],
    )?;
    Ok(())
}

pub fn services_for_file(conn: &Connection, file_id: i64) -> Result<Vec<Service>> {
    let mut stmt = conn.prepare("SELECT service FROM usage WHERE file_id = ?1")?;
    let rows = stmt.query_map([file_id], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        if let Some(svc) = Service::parse(&row?) {
            out.push(svc);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{files, IndexStore};
    use crate::models::File;

    #[test]
    fn reconciliation_clears_and_rewrites_service_usage() {
        let store = IndexStore::open_in_memory().unwrap();
        let conn = store.conn().unwrap();

        let ids = files::upsert_batch(
            &conn,
            &[File {
                path: "/media/movie.mkv".to_string(),
                size: 1,
                inode: 1,
                device_id: 1,
                ..Default::default()
            }],
        )
        .unwrap();

        upsert_batch(
            &conn,
            &[UsageWrite {
                file_id: ids[0],
                service: Service::Plex,
                reference_path: "/movies/movie.mkv".to_string(),
                metadata: serde_json::json!({"rating": 8}),
            }],
        )
        .unwrap();
        assert_eq!(services_for_file(&conn, ids[0]).unwrap(), vec![Service::Plex]);

        delete_all_for_service(&conn, Service::Plex).unwrap();
        assert!(services_for_file(&conn, ids[0]).unwrap().is_empty());
    }
}
