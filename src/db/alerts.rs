//! Alert rows. At most one alert per fingerprint is unresolved at a time;
//! the evaluator enforces it by always looking up the active one first.

use rusqlite::{params, OptionalExtension, Row};

use super::{from_json, parse_app_id, to_json, Db};
use crate::error::StorageResult;
use crate::model::{Alert, AlertDetail, ProjectId, Status};
use crate::timeseries::Time;

const COLUMNS: &str = "id, fingerprint, rule_id, rule_name, application_id, application_category, severity, summary, \
     details, report, opened_at, updated_at, resolved_at, manually_resolved_at, suppressed, resolved_by, pattern_words";

struct RawAlert {
    alert: Alert,
    application_id: String,
    details: Option<String>,
}

fn read(project_id: &ProjectId, row: &Row<'_>) -> rusqlite::Result<RawAlert> {
    let severity: String = row.get(6)?;
    Ok(RawAlert {
        alert: Alert {
            id: row.get(0)?,
            fingerprint: row.get(1)?,
            rule_id: row.get(2)?,
            rule_name: row.get(3)?,
            project_id: project_id.to_string(),
            application_category: row.get(5)?,
            severity: parse_severity(&severity),
            summary: row.get(7)?,
            report: row.get(9)?,
            opened_at: Time(row.get(10)?),
            updated_at: Time(row.get(11)?),
            resolved_at: Time(row.get(12)?),
            manually_resolved_at: Time(row.get(13)?),
            suppressed: row.get(14)?,
            resolved_by: row.get(15)?,
            pattern_words: row.get(16)?,
            ..Default::default()
        },
        application_id: row.get(4)?,
        details: row.get(8)?,
    })
}

fn finish(raw: RawAlert) -> StorageResult<Alert> {
    let mut alert = raw.alert;
    alert.application_id = parse_app_id(&raw.application_id)?;
    alert.details = from_json::<Vec<AlertDetail>>(raw.details)?.unwrap_or_default();
    Ok(alert)
}

fn placeholders(from: usize, n: usize) -> String {
    (from..from + n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

impl Db {
    fn query_alerts(&self, project_id: &ProjectId, sql: &str, args: &[&dyn rusqlite::ToSql]) -> StorageResult<Vec<Alert>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, |row| read(project_id, row))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(finish).collect()
    }

    pub fn get_alert(&self, project_id: &ProjectId, id: i64) -> StorageResult<Option<Alert>> {
        let sql = format!("SELECT {COLUMNS} FROM alert WHERE project_id = ?1 AND id = ?2");
        Ok(self.query_alerts(project_id, &sql, params![project_id.as_str(), id])?.pop())
    }

    /// The unresolved or suppressed alert of a fingerprint.
    pub fn get_active_alert(&self, project_id: &ProjectId, fingerprint: &str) -> StorageResult<Option<Alert>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM alert WHERE project_id = ?1 AND fingerprint = ?2 AND (resolved_at = 0 OR suppressed = 1) \
             ORDER BY opened_at DESC, id DESC LIMIT 1"
        );
        Ok(self
            .query_alerts(project_id, &sql, params![project_id.as_str(), fingerprint])?
            .pop())
    }

    /// Every alert that is not resolved yet, manually resolved ones included.
    pub fn get_unresolved_alerts(&self, project_id: &ProjectId) -> StorageResult<Vec<Alert>> {
        let sql = format!("SELECT {COLUMNS} FROM alert WHERE project_id = ?1 AND resolved_at = 0 ORDER BY id");
        self.query_alerts(project_id, &sql, params![project_id.as_str()])
    }

    /// Unresolved alerts of a rule, newest first.
    pub fn get_latest_alerts_by_rule(&self, project_id: &ProjectId, rule_id: &str) -> StorageResult<Vec<Alert>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM alert WHERE project_id = ?1 AND rule_id = ?2 AND resolved_at = 0 \
             ORDER BY opened_at DESC, id DESC"
        );
        self.query_alerts(project_id, &sql, params![project_id.as_str(), rule_id])
    }

    pub fn get_alerts(&self, project_id: &ProjectId, ids: &[i64]) -> StorageResult<Vec<Alert>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM alert WHERE project_id = ?1 AND id IN ({}) ORDER BY id",
            placeholders(2, ids.len())
        );
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&project_id.0];
        args.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));
        self.query_alerts(project_id, &sql, &args)
    }

    pub fn has_alerts(&self, project_id: &ProjectId) -> StorageResult<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM alert WHERE project_id = ?1 LIMIT 1",
                params![project_id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Inserts the alert and sets its id.
    pub fn create_alert(&self, project_id: &ProjectId, a: &mut Alert) -> StorageResult<()> {
        let details = to_json(&a.details)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO alert (fingerprint, rule_id, rule_name, project_id, application_id, application_category, severity, \
             summary, details, report, opened_at, updated_at, resolved_at, manually_resolved_at, suppressed, resolved_by, \
             pattern_words) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                a.fingerprint,
                a.rule_id,
                a.rule_name,
                project_id.as_str(),
                a.application_id.to_string(),
                a.application_category,
                a.severity.as_str(),
                a.summary,
                details,
                a.report,
                a.opened_at.0,
                a.updated_at.0,
                a.resolved_at.0,
                a.manually_resolved_at.0,
                a.suppressed,
                a.resolved_by,
                a.pattern_words,
            ],
        )?;
        a.id = conn.last_insert_rowid();
        a.project_id = project_id.to_string();
        Ok(())
    }

    /// Persists the mutable part of a firing alert.
    pub fn update_alert(&self, project_id: &ProjectId, a: &Alert) -> StorageResult<()> {
        let details = to_json(&a.details)?;
        self.conn().execute(
            "UPDATE alert SET severity = ?1, summary = ?2, details = ?3, report = ?4, pattern_words = ?5, \
             application_category = ?6, resolved_at = ?7, updated_at = ?8 WHERE project_id = ?9 AND id = ?10",
            params![
                a.severity.as_str(),
                a.summary,
                details,
                a.report,
                a.pattern_words,
                a.application_category,
                a.resolved_at.0,
                a.updated_at.0,
                project_id.as_str(),
                a.id,
            ],
        )?;
        Ok(())
    }

    pub fn resolve_alert(&self, project_id: &ProjectId, id: i64, at: Time) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE alert SET resolved_at = ?1, updated_at = ?1 WHERE project_id = ?2 AND id = ?3 AND resolved_at = 0",
            params![at.0, project_id.as_str(), id],
        )?;
        Ok(())
    }

    /// Marks alerts as resolved by a user; returns the ones that changed.
    pub fn resolve_alerts_manually(
        &self,
        project_id: &ProjectId,
        ids: &[i64],
        resolved_by: &str,
        now: Time,
    ) -> StorageResult<Vec<Alert>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let before: Vec<i64> = self
            .get_alerts(project_id, ids)?
            .into_iter()
            .filter(|a| !a.is_resolved() && !a.is_manually_resolved())
            .map(|a| a.id)
            .collect();
        if before.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE alert SET manually_resolved_at = ?1, updated_at = ?1, resolved_by = ?2 \
             WHERE project_id = ?3 AND resolved_at = 0 AND id IN ({})",
            placeholders(4, before.len())
        );
        let by = resolved_by.to_string();
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&now.0, &by, &project_id.0];
        args.extend(before.iter().map(|id| id as &dyn rusqlite::ToSql));
        self.conn().execute(&sql, &*args)?;
        self.get_alerts(project_id, &before)
    }

    pub fn suppress_alerts(&self, project_id: &ProjectId, ids: &[i64], suppressed_by: &str, now: Time) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE alert SET suppressed = 1, resolved_at = 0, manually_resolved_at = 0, resolved_by = ?1, updated_at = ?2 \
             WHERE project_id = ?3 AND id IN ({})",
            placeholders(4, ids.len())
        );
        let by = suppressed_by.to_string();
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&by, &now.0, &project_id.0];
        args.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));
        self.conn().execute(&sql, &*args)?;
        Ok(())
    }

    pub fn clear_suppression(&self, project_id: &ProjectId, fingerprint: &str) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE alert SET suppressed = 0, resolved_by = '' WHERE project_id = ?1 AND fingerprint = ?2 AND suppressed = 1",
            params![project_id.as_str(), fingerprint],
        )?;
        Ok(())
    }
}

/// Severity of an alert as stored; unknown strings read back as UNKNOWN.
pub fn parse_severity(s: &str) -> Status {
    s.parse().unwrap_or_default()
}
