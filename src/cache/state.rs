//! Persisted download progress of every `(project, query)` pair.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration as StdDuration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StorageResult;
use crate::model::ProjectId;
use crate::timeseries::Time;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryState {
    pub project_id: ProjectId,
    pub query: String,
    pub last_ts: Time,
    pub last_error: String,
}

/// Single sqlite connection behind a mutex.
pub struct StateDb {
    conn: Mutex<Connection>,
}

impl StateDb {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.busy_timeout(StdDuration::from_secs(30))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS prometheus_query_state (
                project_id TEXT NOT NULL,
                query TEXT NOT NULL,
                last_ts INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                PRIMARY KEY(project_id, query)
            );
            "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn save(&self, state: &QueryState) -> StorageResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO prometheus_query_state (project_id, query, last_ts, last_error) VALUES (?1, ?2, ?3, ?4)",
            params![state.project_id.as_str(), state.query, state.last_ts.0, state.last_error],
        )?;
        Ok(())
    }

    pub fn load(&self, project_id: &ProjectId) -> StorageResult<HashMap<String, QueryState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT query, last_ts, last_error FROM prometheus_query_state WHERE project_id = ?1",
        )?;
        let rows = stmt.query_map(params![project_id.as_str()], |row| {
            Ok(QueryState {
                project_id: project_id.clone(),
                query: row.get(0)?,
                last_ts: Time(row.get(1)?),
                last_error: row.get(2)?,
            })
        })?;
        let mut res = HashMap::new();
        for row in rows {
            let state = row?;
            res.insert(state.query.clone(), state);
        }
        Ok(res)
    }

    pub fn delete(&self, state: &QueryState) -> StorageResult<()> {
        self.conn.lock().execute(
            "DELETE FROM prometheus_query_state WHERE project_id = ?1 AND query = ?2",
            params![state.project_id.as_str(), state.query],
        )?;
        Ok(())
    }

    pub fn delete_project(&self, project_id: &ProjectId) -> StorageResult<()> {
        self.conn.lock().execute(
            "DELETE FROM prometheus_query_state WHERE project_id = ?1",
            params![project_id.as_str()],
        )?;
        Ok(())
    }

    /// Projects that have any state rows.
    pub fn projects(&self) -> StorageResult<Vec<ProjectId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT project_id FROM prometheus_query_state")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut res = Vec::new();
        for row in rows {
            res.push(ProjectId::new(row?));
        }
        Ok(res)
    }

    /// First non-empty download error of a project.
    pub fn last_error(&self, project_id: &ProjectId) -> StorageResult<Option<String>> {
        let conn = self.conn.lock();
        let res = conn
            .query_row(
                "SELECT last_error FROM prometheus_query_state WHERE project_id = ?1 AND last_error != '' LIMIT 1",
                params![project_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(res)
    }
}
