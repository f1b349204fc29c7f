//! SQLite-backed flow store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::checkpoint::{FlowCheckpoint, FlowStore, FlowStoreError};
use crate::envelope::Envelope;

#[derive(Clone)]
pub struct SqliteFlowStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFlowStore {
    pub fn open(db_path: &str) -> Result<Self, FlowStoreError> {
        let conn = Connection::open(db_path).map_err(|e| {
            FlowStoreError::Store(format!("failed to open flow sqlite db: {}", e))
        })?;
        let this = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        this.ensure_schema()?;
        Ok(this)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, FlowStoreError> {
        self.conn
            .lock()
            .map_err(|_| FlowStoreError::Store("flow sqlite lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), FlowStoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS flow_checkpoints (
              token TEXT PRIMARY KEY,
              pid TEXT NOT NULL,
              capability TEXT NOT NULL,
              envelope_json TEXT NOT NULL,
              suspended_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| FlowStoreError::Store(format!("failed to init flow schema: {}", e)))?;
        Ok(())
    }

    fn select(conn: &Connection, token: &str) -> Result<Option<FlowCheckpoint>, FlowStoreError> {
        let row = conn
            .query_row(
                "SELECT token, pid, capability, envelope_json, suspended_at
                 FROM flow_checkpoints WHERE token = ?1",
                params![token],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| FlowStoreError::Store(format!("failed to query flow checkpoint: {}", e)))?;
        let Some((token, pid, capability, envelope_json, suspended_at)) = row else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(&envelope_json)
            .map_err(|e| FlowStoreError::Serialization(e.to_string()))?;
        let suspended_at = DateTime::parse_from_rfc3339(&suspended_at)
            .map_err(|e| FlowStoreError::Serialization(e.to_string()))?
            .with_timezone(&Utc);
        Ok(Some(FlowCheckpoint {
            token,
            pid,
            capability,
            envelope,
            suspended_at,
        }))
    }
}

#[async_trait]
impl FlowStore for SqliteFlowStore {
    async fn save(&self, checkpoint: &FlowCheckpoint) -> Result<(), FlowStoreError> {
        let envelope_json = serde_json::to_string(&checkpoint.envelope)
            .map_err(|e| FlowStoreError::Serialization(e.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO flow_checkpoints
             (token, pid, capability, envelope_json, suspended_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                checkpoint.token,
                checkpoint.pid,
                checkpoint.capability,
                envelope_json,
                checkpoint.suspended_at.to_rfc3339()
            ],
        )
        .map_err(|e| FlowStoreError::Store(format!("failed to persist flow checkpoint: {}", e)))?;
        Ok(())
    }

    async fn load(&self, token: &str) -> Result<Option<FlowCheckpoint>, FlowStoreError> {
        let conn = self.lock()?;
        Self::select(&conn, token)
    }

    async fn take(&self, token: &str) -> Result<Option<FlowCheckpoint>, FlowStoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| FlowStoreError::Store(format!("failed to begin take: {}", e)))?;
        let checkpoint = Self::select(&tx, token)?;
        if checkpoint.is_some() {
            tx.execute(
                "DELETE FROM flow_checkpoints WHERE token = ?1",
                params![token],
            )
            .map_err(|e| FlowStoreError::Store(format!("failed to claim flow checkpoint: {}", e)))?;
        }
        tx.commit()
            .map_err(|e| FlowStoreError::Store(format!("failed to commit take: {}", e)))?;
        Ok(checkpoint)
    }

    async fn delete(&self, token: &str) -> Result<(), FlowStoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM flow_checkpoints WHERE token = ?1",
            params![token],
        )
        .map_err(|e| FlowStoreError::Store(format!("failed to delete flow checkpoint: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::context::RequestContext;
    use crate::interrupt::FlowInterrupt;

    fn temp_sqlite_path() -> PathBuf {
        std::env::temp_dir().join(format!("keel-flow-store-{}.db", uuid::Uuid::new_v4()))
    }

    fn checkpoint() -> FlowCheckpoint {
        let mut envelope = Envelope::new(RequestContext::new("req-1", "user-1"), "pay rent");
        envelope
            .outputs
            .insert("planner".to_string(), json!({"step": 2}));
        envelope
            .suspend(FlowInterrupt::confirmation("Send $1200 to landlord?"))
            .unwrap();
        FlowCheckpoint::new("req-1", "banking", envelope)
    }

    #[tokio::test]
    async fn checkpoint_survives_reopen() {
        let path = temp_sqlite_path();
        let db = path.to_string_lossy().to_string();
        let cp = checkpoint();
        {
            let store = SqliteFlowStore::open(&db).unwrap();
            store.save(&cp).await.unwrap();
        }
        let store = SqliteFlowStore::open(&db).unwrap();
        let loaded = store.load(&cp.token).await.unwrap().unwrap();
        assert_eq!(loaded.envelope, cp.envelope);
        assert_eq!(loaded.capability, "banking");
        assert_eq!(loaded.suspended_at.timestamp(), cp.suspended_at.timestamp());
        assert!(loaded.envelope.interrupt_pending());
        let _ = fs::remove_file(path);
    }

    #[tokio::test]
    async fn take_claims_once() {
        let path = temp_sqlite_path();
        let store = SqliteFlowStore::open(&path.to_string_lossy()).unwrap();
        let cp = checkpoint();
        store.save(&cp).await.unwrap();
        assert!(store.take(&cp.token).await.unwrap().is_some());
        assert!(store.take(&cp.token).await.unwrap().is_none());
        store.delete(&cp.token).await.unwrap();
        let _ = fs::remove_file(path);
    }
}
