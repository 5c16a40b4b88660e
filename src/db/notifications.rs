//! Notification outbox: one row per destination and state change. `sent_at`
//! stays zero until a send succeeds.

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::{from_json, parse_app_id, to_json, Db};
use crate::error::{StorageError, StorageResult};
use crate::model::{AlertDetail, ApplicationId, IntegrationType, ProjectId, Status};
use crate::timeseries::{Duration, Time};

// ----------------------------------------------------------------------------
// Destination
// ----------------------------------------------------------------------------

/// Integration plus the slack channel for slack rows. Stored as
/// `slack:<channel>` or the bare integration name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationDestination {
    pub integration: IntegrationType,
    pub slack_channel: String,
}

impl NotificationDestination {
    pub fn new(integration: IntegrationType, slack_channel: impl Into<String>) -> Self {
        let slack_channel = if integration == IntegrationType::Slack {
            slack_channel.into()
        } else {
            String::new()
        };
        Self {
            integration,
            slack_channel,
        }
    }
}

impl fmt::Display for NotificationDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.integration {
            IntegrationType::Slack => write!(f, "slack:{}", self.slack_channel),
            other => f.write_str(other.as_str()),
        }
    }
}

impl FromStr for NotificationDestination {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, channel) = s.split_once(':').unwrap_or((s, ""));
        let integration = match name {
            "slack" => IntegrationType::Slack,
            "teams" => IntegrationType::Teams,
            "pagerduty" => IntegrationType::Pagerduty,
            "opsgenie" => IntegrationType::Opsgenie,
            "webhook" => IntegrationType::Webhook,
            _ => {
                return Err(StorageError::DataCorruption {
                    message: format!("invalid notification destination: {s}"),
                })
            }
        };
        Ok(Self::new(integration, channel))
    }
}

// ----------------------------------------------------------------------------
// Alert notifications
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertNotificationDetails {
    pub project_name: String,
    pub rule_name: String,
    pub severity: Status,
    pub summary: String,
    pub details: Vec<AlertDetail>,
    pub duration: Duration,
    pub resolved_by: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AlertNotification {
    pub project_id: ProjectId,
    pub alert_id: i64,
    pub rule_id: String,
    pub application_id: ApplicationId,
    /// `Ok` for a resolution, the alert severity otherwise.
    pub status: Status,
    pub destination: NotificationDestination,
    pub timestamp: Time,
    pub sent_at: Time,
    pub external_key: String,
    pub details: Option<AlertNotificationDetails>,
}

type RawAlertNotification = (String, i64, String, String, i64, String, i64, i64, String, Option<String>);

fn read_alert_notification(r: &Row<'_>) -> rusqlite::Result<RawAlertNotification> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
        r.get(9)?,
    ))
}

fn finish_alert_notification(raw: RawAlertNotification) -> StorageResult<AlertNotification> {
    let (project_id, alert_id, rule_id, app_id, status, destination, timestamp, sent_at, external_key, details) = raw;
    Ok(AlertNotification {
        project_id: ProjectId(project_id),
        alert_id,
        rule_id,
        application_id: parse_app_id(&app_id)?,
        status: Status::from_i64(status),
        destination: destination.parse()?,
        timestamp: Time(timestamp),
        sent_at: Time(sent_at),
        external_key,
        details: from_json(details)?,
    })
}

const ALERT_COLUMNS: &str =
    "project_id, alert_id, rule_id, application_id, status, destination, timestamp, sent_at, external_key, details";

// ----------------------------------------------------------------------------
// Incident notifications
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub name: String,
    pub check: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentNotificationDetails {
    pub reports: Vec<IncidentReport>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IncidentNotification {
    pub project_id: ProjectId,
    pub application_id: ApplicationId,
    pub incident_key: String,
    pub status: Status,
    pub destination: NotificationDestination,
    pub timestamp: Time,
    pub sent_at: Time,
    pub external_key: String,
    pub details: Option<IncidentNotificationDetails>,
}

type RawIncidentNotification = (String, String, String, i64, String, i64, i64, String, Option<String>);

fn read_incident_notification(r: &Row<'_>) -> rusqlite::Result<RawIncidentNotification> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
    ))
}

fn finish_incident_notification(raw: RawIncidentNotification) -> StorageResult<IncidentNotification> {
    let (project_id, app_id, incident_key, status, destination, timestamp, sent_at, external_key, details) = raw;
    Ok(IncidentNotification {
        project_id: ProjectId(project_id),
        application_id: parse_app_id(&app_id)?,
        incident_key,
        status: Status::from_i64(status),
        destination: destination.parse()?,
        timestamp: Time(timestamp),
        sent_at: Time(sent_at),
        external_key,
        details: from_json(details)?,
    })
}

const INCIDENT_COLUMNS: &str =
    "project_id, application_id, incident_key, status, destination, timestamp, sent_at, external_key, details";

impl Db {
    pub fn put_alert_notification(&self, n: &AlertNotification) -> StorageResult<()> {
        let details = n.details.as_ref().map(to_json).transpose()?;
        self.conn().execute(
            &format!("INSERT INTO alert_notification ({ALERT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                n.project_id.as_str(),
                n.alert_id,
                n.rule_id,
                n.application_id.to_string(),
                n.status as i64,
                n.destination.to_string(),
                n.timestamp.0,
                n.sent_at.0,
                n.external_key,
                details
            ],
        )?;
        Ok(())
    }

    /// Records a successful send.
    pub fn update_alert_notification(&self, n: &AlertNotification) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE alert_notification SET sent_at = ?1, external_key = ?2 \
             WHERE project_id = ?3 AND alert_id = ?4 AND timestamp = ?5 AND destination = ?6",
            params![
                n.sent_at.0,
                n.external_key,
                n.project_id.as_str(),
                n.alert_id,
                n.timestamp.0,
                n.destination.to_string()
            ],
        )?;
        Ok(())
    }

    /// Unsent rows created at or after `from`, oldest first.
    pub fn get_not_sent_alert_notifications(&self, from: Time) -> StorageResult<Vec<AlertNotification>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alert_notification WHERE sent_at = 0 AND timestamp >= ?1 ORDER BY timestamp, rowid"
        );
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![from.0], read_alert_notification)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(finish_alert_notification).collect()
    }

    /// Every row of an alert for one destination, oldest first.
    pub fn get_alert_notification_history(
        &self,
        project_id: &ProjectId,
        alert_id: i64,
        destination: &NotificationDestination,
    ) -> StorageResult<Vec<AlertNotification>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alert_notification WHERE project_id = ?1 AND alert_id = ?2 AND destination = ?3 \
             ORDER BY timestamp, rowid"
        );
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![project_id.as_str(), alert_id, destination.to_string()],
                read_alert_notification,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(finish_alert_notification).collect()
    }

    /// Rows of the same alert and destination created before `n`.
    pub fn get_previous_alert_notifications(&self, n: &AlertNotification) -> StorageResult<Vec<AlertNotification>> {
        let mut res = self.get_alert_notification_history(&n.project_id, n.alert_id, &n.destination)?;
        res.retain(|p| p.timestamp < n.timestamp || (p.timestamp == n.timestamp && p.status != n.status));
        Ok(res)
    }

    pub fn put_incident_notification(&self, n: &IncidentNotification) -> StorageResult<()> {
        let details = n.details.as_ref().map(to_json).transpose()?;
        self.conn().execute(
            &format!("INSERT INTO incident_notification ({INCIDENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                n.project_id.as_str(),
                n.application_id.to_string(),
                n.incident_key,
                n.status as i64,
                n.destination.to_string(),
                n.timestamp.0,
                n.sent_at.0,
                n.external_key,
                details
            ],
        )?;
        Ok(())
    }

    pub fn update_incident_notification(&self, n: &IncidentNotification) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE incident_notification SET sent_at = ?1, external_key = ?2 \
             WHERE project_id = ?3 AND incident_key = ?4 AND timestamp = ?5 AND destination = ?6 AND status = ?7",
            params![
                n.sent_at.0,
                n.external_key,
                n.project_id.as_str(),
                n.incident_key,
                n.timestamp.0,
                n.destination.to_string(),
                n.status as i64
            ],
        )?;
        Ok(())
    }

    pub fn get_not_sent_incident_notifications(&self, from: Time) -> StorageResult<Vec<IncidentNotification>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incident_notification WHERE sent_at = 0 AND timestamp >= ?1 ORDER BY timestamp, rowid"
        );
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![from.0], read_incident_notification)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(finish_incident_notification).collect()
    }

    pub fn get_incident_notification_history(
        &self,
        project_id: &ProjectId,
        incident_key: &str,
        destination: &NotificationDestination,
    ) -> StorageResult<Vec<IncidentNotification>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incident_notification WHERE project_id = ?1 AND incident_key = ?2 AND destination = ?3 \
             ORDER BY timestamp, rowid"
        );
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![project_id.as_str(), incident_key, destination.to_string()],
                read_incident_notification,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(finish_incident_notification).collect()
    }

    pub fn get_previous_incident_notifications(
        &self,
        n: &IncidentNotification,
    ) -> StorageResult<Vec<IncidentNotification>> {
        let mut res = self.get_incident_notification_history(&n.project_id, &n.incident_key, &n.destination)?;
        res.retain(|p| p.timestamp < n.timestamp || (p.timestamp == n.timestamp && p.status != n.status));
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApplicationKind;
    use pretty_assertions::assert_eq;

    fn app() -> ApplicationId {
        ApplicationId::new("c1", "shop", ApplicationKind::Deployment, "cart")
    }

    fn alert_notification(status: Status, destination: NotificationDestination, ts: i64) -> AlertNotification {
        AlertNotification {
            project_id: ProjectId::new("p1"),
            alert_id: 7,
            rule_id: "r1".into(),
            application_id: app(),
            status,
            destination,
            timestamp: Time(ts),
            sent_at: Time(0),
            external_key: String::new(),
            details: Some(AlertNotificationDetails {
                rule_name: "High error rate".into(),
                severity: status,
                summary: "boom".into(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_destination_text() {
        let d = NotificationDestination::new(IntegrationType::Slack, "#ops");
        assert_eq!(d.to_string(), "slack:#ops");
        assert_eq!("slack:#ops".parse::<NotificationDestination>().unwrap(), d);
        let d = NotificationDestination::new(IntegrationType::Pagerduty, "ignored");
        assert_eq!(d.to_string(), "pagerduty");
        assert_eq!("pagerduty".parse::<NotificationDestination>().unwrap(), d);
        assert!("carrier-pigeon".parse::<NotificationDestination>().is_err());
    }

    #[test]
    fn test_alert_outbox() {
        let db = Db::open_in_memory().unwrap();
        let slack = NotificationDestination::new(IntegrationType::Slack, "#ops");
        let mut open = alert_notification(Status::Critical, slack.clone(), 100);
        db.put_alert_notification(&open).unwrap();
        db.put_alert_notification(&alert_notification(Status::Critical, NotificationDestination::new(IntegrationType::Teams, ""), 100))
            .unwrap();

        let pending = db.get_not_sent_alert_notifications(Time(50)).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], open);
        assert!(db.get_not_sent_alert_notifications(Time(101)).unwrap().is_empty());

        open.sent_at = Time(110);
        open.external_key = "1700000000.0001".into();
        db.update_alert_notification(&open).unwrap();
        let pending = db.get_not_sent_alert_notifications(Time(0)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].destination.integration, IntegrationType::Teams);

        let resolved = alert_notification(Status::Ok, slack, 300);
        db.put_alert_notification(&resolved).unwrap();
        let prev = db.get_previous_alert_notifications(&resolved).unwrap();
        assert_eq!(prev.len(), 1);
        assert_eq!(prev[0].external_key, "1700000000.0001");
    }

    #[test]
    fn test_incident_outbox() {
        let db = Db::open_in_memory().unwrap();
        let pd = NotificationDestination::new(IntegrationType::Pagerduty, "");
        let mut n = IncidentNotification {
            project_id: ProjectId::new("p1"),
            application_id: app(),
            incident_key: "abcd1234".into(),
            status: Status::Warning,
            destination: pd.clone(),
            timestamp: Time(100),
            sent_at: Time(0),
            external_key: "p1:abcd1234:warning".into(),
            details: None,
        };
        db.put_incident_notification(&n).unwrap();
        assert_eq!(db.get_not_sent_incident_notifications(Time(0)).unwrap(), vec![n.clone()]);

        n.sent_at = Time(101);
        db.update_incident_notification(&n).unwrap();
        assert!(db.get_not_sent_incident_notifications(Time(0)).unwrap().is_empty());

        let history = db.get_incident_notification_history(&n.project_id, "abcd1234", &pd).unwrap();
        assert_eq!(history, vec![n]);
    }
}
