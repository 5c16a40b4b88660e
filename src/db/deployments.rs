use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};

use super::{from_json, parse_app_id, to_json, Db};
use crate::error::StorageResult;
use crate::model::deployment::{DeploymentDetails, DeploymentNotifications};
use crate::model::{ApplicationDeployment, ApplicationId, MetricsSnapshot, ProjectId};
use crate::timeseries::Time;

/// Deployments kept per application when listing.
pub const DEPLOYMENTS_LAST_N: usize = 100;

impl Db {
    /// Inserts a new deployment or records the finish of a known one. A
    /// deployment that already finished is never changed.
    pub fn save_application_deployment(&self, project_id: &ProjectId, d: &ApplicationDeployment) -> StorageResult<()> {
        if d.started_at.is_zero() && d.finished_at.is_zero() {
            return Ok(());
        }
        let app_id = d.application_id.to_string();
        let conn = self.conn();
        if d.started_at.is_zero() {
            conn.execute(
                "UPDATE application_deployment SET finished_at = ?1, name = ?2 \
                 WHERE project_id = ?3 AND application_id = ?4 AND started_at <= ?1 AND finished_at = 0",
                params![d.finished_at.0, d.name, project_id.as_str(), app_id],
            )?;
            return Ok(());
        }
        let saved: Option<i64> = conn
            .query_row(
                "SELECT finished_at FROM application_deployment WHERE project_id = ?1 AND application_id = ?2 AND started_at = ?3",
                params![project_id.as_str(), app_id, d.started_at.0],
                |row| row.get(0),
            )
            .optional()?;
        match saved {
            None => {
                conn.execute(
                    "INSERT INTO application_deployment (project_id, application_id, name, started_at, finished_at, details) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        project_id.as_str(),
                        app_id,
                        d.name,
                        d.started_at.0,
                        d.finished_at.0,
                        to_json(&d.details)?
                    ],
                )?;
            }
            Some(0) if !d.finished_at.is_zero() => {
                conn.execute(
                    "UPDATE application_deployment SET finished_at = ?1, name = ?2 \
                     WHERE project_id = ?3 AND application_id = ?4 AND started_at = ?5",
                    params![d.finished_at.0, d.name, project_id.as_str(), app_id, d.started_at.0],
                )?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// The latest deployments of every application, oldest first.
    pub fn get_application_deployments(
        &self,
        project_id: &ProjectId,
    ) -> StorageResult<BTreeMap<ApplicationId, Vec<ApplicationDeployment>>> {
        type Raw = (String, String, i64, i64, Option<String>, Option<String>, Option<String>);
        let raws: Vec<Raw> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT application_id, name, started_at, finished_at, details, metrics_snapshot, notifications FROM ( \
                   SELECT *, row_number() OVER (PARTITION BY application_id ORDER BY started_at DESC) AS n \
                   FROM application_deployment WHERE project_id = ?1 \
                 ) WHERE n <= ?2 ORDER BY application_id, started_at",
            )?;
            let rows = stmt.query_map(params![project_id.as_str(), DEPLOYMENTS_LAST_N as i64], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut res: BTreeMap<ApplicationId, Vec<ApplicationDeployment>> = BTreeMap::new();
        for (app_id, name, started_at, finished_at, details, snapshot, notifications) in raws {
            let d = ApplicationDeployment {
                application_id: parse_app_id(&app_id)?,
                name,
                started_at: Time(started_at),
                finished_at: Time(finished_at),
                details: from_json::<DeploymentDetails>(details)?.unwrap_or_default(),
                metrics_snapshot: from_json::<MetricsSnapshot>(snapshot)?,
                notifications: from_json::<DeploymentNotifications>(notifications)?.unwrap_or_default(),
            };
            res.entry(d.application_id.clone()).or_default().push(d);
        }
        Ok(res)
    }

    pub fn save_deployment_metrics_snapshot(
        &self,
        project_id: &ProjectId,
        app_id: &ApplicationId,
        started_at: Time,
        snapshot: &MetricsSnapshot,
    ) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE application_deployment SET metrics_snapshot = ?1 WHERE project_id = ?2 AND application_id = ?3 AND started_at = ?4",
            params![to_json(snapshot)?, project_id.as_str(), app_id.to_string(), started_at.0],
        )?;
        Ok(())
    }

    pub fn save_deployment_notifications(&self, project_id: &ProjectId, d: &ApplicationDeployment) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE application_deployment SET notifications = ?1 WHERE project_id = ?2 AND application_id = ?3 AND started_at = ?4",
            params![
                to_json(&d.notifications)?,
                project_id.as_str(),
                d.application_id.to_string(),
                d.started_at.0
            ],
        )?;
        Ok(())
    }
}
