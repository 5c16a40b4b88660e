use std::collections::BTreeMap;

use rusqlite::{params, Row};

use super::{from_json, parse_app_id, to_json, Db};
use crate::error::StorageResult;
use crate::model::{ApplicationId, ApplicationIncident, IncidentDetails, ProjectId, Status};
use crate::timeseries::Time;

const COLUMNS: &str = "application_id, key, opened_at, resolved_at, severity, details";

fn read(row: &Row<'_>) -> rusqlite::Result<(String, Option<String>, ApplicationIncident)> {
    Ok((
        row.get(0)?,
        row.get(5)?,
        ApplicationIncident {
            key: row.get(1)?,
            opened_at: Time(row.get(2)?),
            resolved_at: Time(row.get(3)?),
            severity: Status::from_i64(row.get(4)?),
            ..Default::default()
        },
    ))
}

fn finish((app_id, details, mut incident): (String, Option<String>, ApplicationIncident)) -> StorageResult<ApplicationIncident> {
    incident.application_id = parse_app_id(&app_id)?;
    incident.details = from_json::<IncidentDetails>(details)?.unwrap_or_default();
    Ok(incident)
}

impl Db {
    fn query_incidents(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> StorageResult<Vec<ApplicationIncident>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, read)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(finish).collect()
    }

    pub fn get_incident_by_key(&self, project_id: &ProjectId, key: &str) -> StorageResult<Option<ApplicationIncident>> {
        let sql = format!("SELECT {COLUMNS} FROM incident WHERE project_id = ?1 AND key = ?2 LIMIT 1");
        Ok(self.query_incidents(&sql, params![project_id.as_str(), key])?.pop())
    }

    /// The open incident of an application, if any.
    pub fn get_last_open_incident(
        &self,
        project_id: &ProjectId,
        app_id: &ApplicationId,
    ) -> StorageResult<Option<ApplicationIncident>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM incident WHERE project_id = ?1 AND application_id = ?2 AND resolved_at = 0 \
             ORDER BY opened_at DESC LIMIT 1"
        );
        Ok(self
            .query_incidents(&sql, params![project_id.as_str(), app_id.to_string()])?
            .pop())
    }

    /// Incidents overlapping `[from, to]`, grouped by application.
    pub fn get_application_incidents(
        &self,
        project_id: &ProjectId,
        from: Time,
        to: Time,
    ) -> StorageResult<BTreeMap<ApplicationId, Vec<ApplicationIncident>>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM incident WHERE project_id = ?1 AND opened_at <= ?2 AND (resolved_at = 0 OR resolved_at >= ?3) \
             ORDER BY opened_at ASC"
        );
        let mut res: BTreeMap<ApplicationId, Vec<ApplicationIncident>> = BTreeMap::new();
        for i in self.query_incidents(&sql, params![project_id.as_str(), to.0, from.0])? {
            res.entry(i.application_id.clone()).or_default().push(i);
        }
        Ok(res)
    }

    pub fn create_incident(&self, project_id: &ProjectId, i: &ApplicationIncident) -> StorageResult<()> {
        let details = to_json(&i.details)?;
        self.conn().execute(
            "INSERT INTO incident (project_id, application_id, key, opened_at, severity, details) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project_id.as_str(),
                i.application_id.to_string(),
                i.key,
                i.opened_at.0,
                i.severity as i64,
                details
            ],
        )?;
        Ok(())
    }

    pub fn update_incident(
        &self,
        project_id: &ProjectId,
        key: &str,
        severity: Status,
        details: &IncidentDetails,
    ) -> StorageResult<()> {
        let details = to_json(details)?;
        self.conn().execute(
            "UPDATE incident SET severity = ?1, details = ?2 WHERE project_id = ?3 AND key = ?4",
            params![severity as i64, details, project_id.as_str(), key],
        )?;
        Ok(())
    }

    pub fn resolve_incident(&self, project_id: &ProjectId, key: &str, at: Time) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE incident SET resolved_at = ?1 WHERE project_id = ?2 AND key = ?3 AND resolved_at = 0",
            params![at.0, project_id.as_str(), key],
        )?;
        Ok(())
    }
}
