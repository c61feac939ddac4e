//! Persistent device registry.
//!
//! Maps device-id to its provisioning secret and status. Backed by SQLite so
//! registrations survive restarts; every operation is serialized through a
//! single connection mutex.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::OperationFailed(e.to_string())
    }
}

/// One registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub secret: String,
    pub model: String,
    /// Unix timestamp of first registration.
    pub registered_at: i64,
    /// Cleared to deny further authentications; the secret itself is
    /// immutable.
    pub active: bool,
}

/// SQLite-backed device registry.
pub struct DeviceRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl DeviceRegistry {
    /// Open (or create) the registry database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory registry for tests.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), RegistryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (
                device_id     TEXT PRIMARY KEY,
                secret        TEXT NOT NULL,
                model         TEXT NOT NULL,
                registered_at INTEGER NOT NULL,
                active        INTEGER NOT NULL DEFAULT 1
            );",
        )?;
        Ok(())
    }

    /// Register a new device. Returns `false` if the device-id is taken.
    pub async fn register(
        &self,
        device_id: &str,
        secret: &str,
        model: &str,
    ) -> Result<bool, RegistryError> {
        let conn = self.conn.lock().await;
        let now = chrono::Utc::now().timestamp();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO devices (device_id, secret, model, registered_at, active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![device_id, secret, model, now],
        )?;
        Ok(inserted == 1)
    }

    /// Authenticate a device-id/secret pair.
    ///
    /// Succeeds iff the record exists, is active, and the secret matches by
    /// constant-time comparison. Lookups are case-sensitive exact match.
    pub async fn authenticate(&self, device_id: &str, secret: &str) -> Result<bool, RegistryError> {
        let record = self.get(device_id).await?;
        let Some(record) = record else {
            return Ok(false);
        };
        if !record.active {
            return Ok(false);
        }
        Ok(record.secret.as_bytes().ct_eq(secret.as_bytes()).into())
    }

    /// Fetch a device record.
    pub async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>, RegistryError> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT device_id, secret, model, registered_at, active
                 FROM devices WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok(DeviceRecord {
                        device_id: row.get(0)?,
                        secret: row.get(1)?,
                        model: row.get(2)?,
                        registered_at: row.get(3)?,
                        active: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Clear the active flag. Returns `false` for an unknown device-id.
    pub async fn deactivate(&self, device_id: &str) -> Result<bool, RegistryError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE devices SET active = 0 WHERE device_id = ?1",
            params![device_id],
        )?;
        Ok(updated == 1)
    }

    /// Number of registered devices.
    pub async fn count(&self) -> Result<u64, RegistryError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let registry = DeviceRegistry::open_in_memory().unwrap();

        assert!(registry.register("d1", "s1", "P7").await.unwrap());
        assert!(registry.authenticate("d1", "s1").await.unwrap());
        assert!(!registry.authenticate("d1", "wrong").await.unwrap());
        assert!(!registry.authenticate("unknown", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let registry = DeviceRegistry::open_in_memory().unwrap();

        assert!(registry.register("d1", "s1", "P7").await.unwrap());
        assert!(!registry.register("d1", "other", "P8").await.unwrap());

        // Original secret is untouched.
        let record = registry.get("d1").await.unwrap().unwrap();
        assert_eq!(record.secret, "s1");
        assert_eq!(record.model, "P7");
    }

    #[tokio::test]
    async fn test_deactivate_denies_auth() {
        let registry = DeviceRegistry::open_in_memory().unwrap();

        registry.register("d1", "s1", "P7").await.unwrap();
        assert!(registry.deactivate("d1").await.unwrap());
        assert!(!registry.authenticate("d1", "s1").await.unwrap());
        assert!(!registry.deactivate("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_is_case_sensitive() {
        let registry = DeviceRegistry::open_in_memory().unwrap();

        registry.register("Device-1", "s1", "P7").await.unwrap();
        assert!(registry.get("device-1").await.unwrap().is_none());
        assert!(!registry.authenticate("DEVICE-1", "s1").await.unwrap());
        assert!(registry.authenticate("Device-1", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.db");

        {
            let registry = DeviceRegistry::open(&path).unwrap();
            registry.register("d1", "s1", "P7").await.unwrap();
        }

        let registry = DeviceRegistry::open(&path).unwrap();
        assert!(registry.authenticate("d1", "s1").await.unwrap());
        assert_eq!(registry.count().await.unwrap(), 1);
    }
}
