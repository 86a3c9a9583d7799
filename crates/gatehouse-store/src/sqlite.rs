use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::flow::FlowDefinition;
use gatehouse_core::instance::InstanceRecord;
use gatehouse_core::traits::InstanceStore;
use gatehouse_core::types::{InstanceId, Step};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS definitions (
    id TEXT PRIMARY KEY,
    definition_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    definition_id TEXT NOT NULL,
    status TEXT NOT NULL,
    record_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS steps (
    instance_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    step_id TEXT NOT NULL,
    step_json TEXT NOT NULL,
    UNIQUE(instance_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_steps_instance ON steps(instance_id, seq);
";

fn db_err(e: impl std::fmt::Display) -> GatehouseError {
    GatehouseError::Database(e.to_string())
}

/// SQLite-backed instance store.
///
/// Step history lives in its own table keyed by `(instance_id, seq)`; saves
/// insert rows past the highest stored `seq` and never update existing ones.
pub struct SqliteInstanceStore {
    conn: Mutex<Connection>,
}

impl SqliteInstanceStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatehouseError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Instance store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn save_definition_sync(&self, def: &FlowDefinition) -> Result<()> {
        let json = serde_json::to_string(def)?;
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO definitions (id, definition_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET definition_json = excluded.definition_json,
                                           updated_at = excluded.updated_at",
            params![def.id, json, chrono::Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn load_definition_sync(&self, id: &str) -> Result<Option<FlowDefinition>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT definition_json FROM definitions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        json.map(|j| serde_json::from_str(&j).map_err(GatehouseError::from))
            .transpose()
    }

    fn list_definitions_sync(&self) -> Result<Vec<FlowDefinition>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare("SELECT definition_json FROM definitions ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut defs = Vec::new();
        for row in rows {
            let json = row.map_err(db_err)?;
            match serde_json::from_str(&json) {
                Ok(def) => defs.push(def),
                Err(e) => warn!(error = %e, "Skipping unreadable flow definition"),
            }
        }
        Ok(defs)
    }

    fn save_instance_sync(&self, record: &InstanceRecord) -> Result<()> {
        // The header row carries everything except history.
        let mut header = serde_json::to_value(record)?;
        if let Some(obj) = header.as_object_mut() {
            obj.remove("history");
        }
        let header_json = serde_json::to_string(&header)?;

        let mut conn = self.conn.lock().map_err(db_err)?;
        let tx = conn.transaction().map_err(db_err)?;

        tx.execute(
            "INSERT INTO instances (id, definition_id, status, record_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                                           record_json = excluded.record_json,
                                           updated_at = excluded.updated_at",
            params![
                record.id.as_str(),
                record.definition_id,
                record.status.as_str(),
                header_json,
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        let stored: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM steps WHERE instance_id = ?1",
                params![record.id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let stored = stored as usize;

        let history = record.history();
        if history.len() < stored {
            warn!(
                instance_id = %record.id,
                stored,
                in_memory = history.len(),
                "Record has fewer steps than the store; keeping stored history"
            );
        }

        for (seq, step) in history.iter().enumerate().skip(stored) {
            let step_json = serde_json::to_string(step)?;
            tx.execute(
                "INSERT OR IGNORE INTO steps (instance_id, seq, step_id, step_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![record.id.as_str(), seq as i64, step.step_id, step_json],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn load_instance_sync(&self, id: &InstanceId) -> Result<Option<InstanceRecord>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let header: Option<String> = conn
            .query_row(
                "SELECT record_json FROM instances WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(header) = header else {
            return Ok(None);
        };
        let record: InstanceRecord = serde_json::from_str(&header)?;

        let mut stmt = conn
            .prepare("SELECT step_json FROM steps WHERE instance_id = ?1 ORDER BY seq")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut history: Vec<Step> = Vec::new();
        for row in rows {
            let json = row.map_err(db_err)?;
            history.push(serde_json::from_str(&json)?);
        }

        Ok(Some(record.restore(history)))
    }

    fn delete_instance_sync(&self, id: &InstanceId) -> Result<bool> {
        let mut conn = self.conn.lock().map_err(db_err)?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM steps WHERE instance_id = ?1", params![id.as_str()])
            .map_err(db_err)?;
        let deleted = tx
            .execute("DELETE FROM instances WHERE id = ?1", params![id.as_str()])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(deleted > 0)
    }

    fn list_instances_sync(&self) -> Result<Vec<InstanceId>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare("SELECT id FROM instances ORDER BY updated_at DESC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let ids = rows
            .map(|r| r.map(|id| InstanceId::from_string(&id)).map_err(db_err))
            .collect::<Result<Vec<_>>>()?;
        Ok(ids)
    }
}

impl InstanceStore for SqliteInstanceStore {
    fn save_definition(&self, def: &FlowDefinition) -> BoxFuture<'_, Result<()>> {
        let result = self.save_definition_sync(def);
        Box::pin(async move { result })
    }

    fn load_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let result = self.load_definition_sync(id);
        Box::pin(async move { result })
    }

    fn list_definitions(&self) -> BoxFuture<'_, Result<Vec<FlowDefinition>>> {
        Box::pin(async move { self.list_definitions_sync() })
    }

    fn save_instance(&self, record: &InstanceRecord) -> BoxFuture<'_, Result<()>> {
        let result = self.save_instance_sync(record);
        Box::pin(async move { result })
    }

    fn load_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<Option<InstanceRecord>>> {
        let id = id.clone();
        Box::pin(async move { self.load_instance_sync(&id) })
    }

    fn delete_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move { self.delete_instance_sync(&id) })
    }

    fn list_instances(&self) -> BoxFuture<'_, Result<Vec<InstanceId>>> {
        Box::pin(async move { self.list_instances_sync() })
    }
}
