// ============================================================================
// STATE DATABASE
// ============================================================================
// Persistent state of the watchers and the notification dispatcher: alerts,
// incidents, deployments and the notification outbox. One sqlite connection
// guarded by a mutex; every statement is short and synchronous.
// ============================================================================

pub mod alerts;
pub mod deployments;
pub mod incidents;
pub mod notifications;

use std::path::Path;
use std::time::Duration as StdDuration;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::model::ApplicationId;

pub use notifications::{
    AlertNotification, AlertNotificationDetails, IncidentNotification, IncidentNotificationDetails,
    IncidentReport, NotificationDestination,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS alert (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    rule_name TEXT NOT NULL DEFAULT '',
    project_id TEXT NOT NULL,
    application_id TEXT NOT NULL,
    application_category TEXT NOT NULL DEFAULT '',
    severity TEXT NOT NULL,
    summary TEXT NOT NULL,
    details TEXT,
    report TEXT NOT NULL DEFAULT '',
    opened_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    resolved_at INTEGER NOT NULL DEFAULT 0,
    manually_resolved_at INTEGER NOT NULL DEFAULT 0,
    suppressed INTEGER NOT NULL DEFAULT 0,
    resolved_by TEXT NOT NULL DEFAULT '',
    pattern_words TEXT
);
CREATE INDEX IF NOT EXISTS alert_project_resolved ON alert (project_id, resolved_at);
CREATE INDEX IF NOT EXISTS alert_fingerprint_resolved ON alert (fingerprint, resolved_at);
CREATE INDEX IF NOT EXISTS alert_project_rule_resolved ON alert (project_id, rule_id, resolved_at);

CREATE TABLE IF NOT EXISTS incident (
    project_id TEXT NOT NULL,
    application_id TEXT NOT NULL,
    key TEXT NOT NULL,
    opened_at INTEGER NOT NULL,
    resolved_at INTEGER NOT NULL DEFAULT 0,
    severity INTEGER NOT NULL,
    details TEXT,
    PRIMARY KEY (project_id, application_id, opened_at)
);
CREATE UNIQUE INDEX IF NOT EXISTS incident_key ON incident (project_id, key);

CREATE TABLE IF NOT EXISTS application_deployment (
    project_id TEXT NOT NULL,
    application_id TEXT NOT NULL,
    name TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL DEFAULT 0,
    details TEXT,
    metrics_snapshot TEXT,
    notifications TEXT,
    PRIMARY KEY (project_id, application_id, started_at)
);

CREATE TABLE IF NOT EXISTS alert_notification (
    project_id TEXT NOT NULL,
    alert_id INTEGER NOT NULL,
    rule_id TEXT NOT NULL,
    application_id TEXT NOT NULL,
    status INTEGER NOT NULL,
    destination TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    sent_at INTEGER NOT NULL DEFAULT 0,
    external_key TEXT NOT NULL DEFAULT '',
    details TEXT
);
CREATE INDEX IF NOT EXISTS alert_notification_not_sent ON alert_notification (sent_at, timestamp);

CREATE TABLE IF NOT EXISTS incident_notification (
    project_id TEXT NOT NULL,
    application_id TEXT NOT NULL,
    incident_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    destination TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    sent_at INTEGER NOT NULL DEFAULT 0,
    external_key TEXT NOT NULL DEFAULT '',
    details TEXT
);
CREATE INDEX IF NOT EXISTS incident_notification_not_sent ON incident_notification (sent_at, timestamp);
"#;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let db = Self::init(Connection::open(path)?)?;
        info!(target: "cerebro::init", path = %path.display(), "state database opened");
        Ok(db)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.busy_timeout(StdDuration::from_secs(30))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Whether this instance may run the watchers. A single process owns
    /// the sqlite file, so it always may.
    pub fn get_primary_lock(&self) -> bool {
        true
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

// ----------------------------------------------------------------------------
// Column helpers
// ----------------------------------------------------------------------------

pub(crate) fn to_json<T: Serialize>(v: &T) -> StorageResult<String> {
    Ok(serde_json::to_string(v)?)
}

/// Empty or NULL columns decode to `None`.
pub(crate) fn from_json<T: DeserializeOwned>(s: Option<String>) -> StorageResult<Option<T>> {
    match s {
        Some(s) if !s.is_empty() => Ok(Some(serde_json::from_str(&s)?)),
        _ => Ok(None),
    }
}

pub(crate) fn parse_app_id(s: &str) -> StorageResult<ApplicationId> {
    s.parse().map_err(|_| StorageError::DataCorruption {
        message: format!("invalid application id: {s}"),
    })
}
