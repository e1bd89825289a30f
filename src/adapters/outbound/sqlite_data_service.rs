//! SQLite Data Service
//!
//! Implements DataService on the `stores` table of a SQLite database.
//! Every query opens its own connection on the blocking pool, so a slow
//! database stalls only the caller that asked.

use crate::domain::ports::DataService;
use crate::domain::value_objects::{PresenceStatus, TenantId};
use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    store_code TEXT NOT NULL UNIQUE,
    auth_code TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    status TEXT,
    status_changed_at TEXT
)";

/// SQLite-backed store directory.
pub struct SqliteDataService {
    db_path: PathBuf,
}

impl SqliteDataService {
    /// Open (and if needed create) the store database.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;
        conn.execute(SCHEMA, [])?;
        Ok(Self { db_path })
    }

    /// Insert or update a store's credentials. Used for provisioning and tests.
    pub fn upsert_store(&self, code: &str, auth_code: &str, name: &str) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO stores (store_code, auth_code, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(store_code) DO UPDATE SET auth_code = excluded.auth_code, name = excluded.name",
            params![code, auth_code, name],
        )?;
        Ok(())
    }

    /// Last persisted status of a store.
    pub fn stored_status(&self, tenant: &TenantId) -> Result<Option<String>> {
        let conn = Connection::open(&self.db_path)?;
        let status = conn
            .query_row(
                "SELECT status FROM stores WHERE store_code = ?1 LIMIT 1",
                params![tenant.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(status.flatten())
    }

    /// Run a query on the blocking pool against a fresh connection.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        let value = tokio::task::spawn_blocking(move || -> Result<T> {
            let conn = Connection::open(&db_path)?;
            Ok(f(&conn)?)
        })
        .await??;
        Ok(value)
    }
}

#[async_trait]
impl DataService for SqliteDataService {
    async fn authenticate_tenant(&self, tenant: &TenantId, auth_code: &str) -> Result<bool> {
        let code = tenant.as_str().to_string();
        let auth_code = auth_code.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT id FROM stores WHERE store_code = ?1 AND auth_code = ?2 LIMIT 1",
                params![code, auth_code],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|row| row.is_some())
        })
        .await
    }

    async fn tenant_display_name(&self, tenant: &TenantId) -> Result<Option<String>> {
        let code = tenant.as_str().to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT name FROM stores WHERE store_code = ?1 LIMIT 1",
                params![code],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
    }

    async fn persist_status(&self, tenant: &TenantId, status: PresenceStatus) -> Result<()> {
        let code = tenant.as_str().to_string();
        let updated = self
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE stores SET status = ?1, status_changed_at = CURRENT_TIMESTAMP
                     WHERE store_code = ?2",
                    params![status.as_str(), code],
                )
            })
            .await?;
        if updated == 0 {
            tracing::debug!("status update for unknown store {}", tenant);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> (TempDir, SqliteDataService) {
        let dir = TempDir::new().unwrap();
        let svc = SqliteDataService::open(dir.path().join("stores.db")).unwrap();
        svc.upsert_store("S1", "secret", "Store One").unwrap();
        (dir, svc)
    }

    #[tokio::test]
    async fn test_authenticate_valid_and_invalid() {
        let (_dir, svc) = service();

        assert!(svc.authenticate_tenant(&"S1".into(), "secret").await.unwrap());
        assert!(!svc.authenticate_tenant(&"S1".into(), "wrong").await.unwrap());
        assert!(!svc.authenticate_tenant(&"S2".into(), "secret").await.unwrap());
    }

    #[tokio::test]
    async fn test_display_name() {
        let (_dir, svc) = service();
        assert_eq!(
            svc.tenant_display_name(&"S1".into()).await.unwrap().as_deref(),
            Some("Store One")
        );
        assert_eq!(svc.tenant_display_name(&"S2".into()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persist_status() {
        let (_dir, svc) = service();

        svc.persist_status(&"S1".into(), PresenceStatus::Offline)
            .await
            .unwrap();
        assert_eq!(
            svc.stored_status(&"S1".into()).unwrap().as_deref(),
            Some("offline")
        );

        // unknown stores are not an error
        svc.persist_status(&"S2".into(), PresenceStatus::Online)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_rotates_auth_code() {
        let (_dir, svc) = service();
        svc.upsert_store("S1", "rotated", "Store One").unwrap();

        assert!(!svc.authenticate_tenant(&"S1".into(), "secret").await.unwrap());
        assert!(svc.authenticate_tenant(&"S1".into(), "rotated").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_database_is_an_error() {
        let dir = TempDir::new().unwrap();
        let svc = SqliteDataService::open(dir.path().join("stores.db")).unwrap();
        // a directory where the database file should be
        let broken = SqliteDataService {
            db_path: dir.path().to_path_buf(),
        };

        assert!(broken.authenticate_tenant(&"S1".into(), "x").await.is_err());
        assert!(!svc.authenticate_tenant(&"S1".into(), "x").await.unwrap());
    }
}
