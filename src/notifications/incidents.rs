//! Incident notifications.
//!
//! Paging integrations track separate open keys per severity: escalating to
//! CRITICAL opens a new page, de-escalating to WARNING closes the critical
//! page before opening a warning one, resolution closes both.

use tracing::{error, warn};

use super::{record, FailedDestinations, NotificationClient, Notifier};
use crate::db::{IncidentNotification, IncidentNotificationDetails, IncidentReport, NotificationDestination};
use crate::error::StorageResult;
use crate::model::world::SLO_REPORT;
use crate::model::{Application, ApplicationIncident, IntegrationType, NotificationKind, Project, Status};
use crate::timeseries::Time;

/// Firing checks of an open incident, or the SLO checks of a resolved one.
fn incident_details(app: &Application, incident: &ApplicationIncident) -> Option<IncidentNotificationDetails> {
    let reports: Vec<IncidentReport> = app
        .reports
        .iter()
        .filter(|r| !incident.is_resolved() || r.name == SLO_REPORT)
        .flat_map(|r| {
            r.checks
                .iter()
                .filter(|ch| incident.is_resolved() || ch.status >= Status::Warning)
                .map(|ch| IncidentReport {
                    name: r.name.clone(),
                    check: ch.title.clone(),
                    message: ch.message.clone(),
                })
        })
        .collect();
    if reports.is_empty() {
        return None;
    }
    Some(IncidentNotificationDetails { reports })
}

impl Notifier {
    pub async fn enqueue_incident(&self, project: &Project, app: &Application, incident: &ApplicationIncident, now: Time) {
        if self.queue_incident(project, app, incident, now) {
            self.send_incidents().await;
        }
    }

    pub fn queue_incident(&self, project: &Project, app: &Application, incident: &ApplicationIncident, now: Time) -> bool {
        let destinations = project.notification_destinations(&app.category, NotificationKind::Incident);
        if destinations.is_empty() {
            return false;
        }
        for (integration, channel) in destinations {
            let n = IncidentNotification {
                project_id: project.id.clone(),
                application_id: app.id.clone(),
                incident_key: incident.key.clone(),
                status: incident.severity,
                destination: NotificationDestination::new(integration, channel),
                timestamp: now,
                sent_at: Time::ZERO,
                external_key: String::new(),
                details: None,
            };
            if let Err(e) = self.enqueue_incident_notification(project, app, incident, n) {
                error!(target: "cerebro::notifications", incident = %incident.key, error = %e, "failed to enqueue incident notification");
            }
        }
        true
    }

    fn enqueue_incident_notification(
        &self,
        project: &Project,
        app: &Application,
        incident: &ApplicationIncident,
        n: IncidentNotification,
    ) -> StorageResult<()> {
        let open = |external_key: String| IncidentNotification {
            external_key,
            details: incident_details(app, incident),
            ..n.clone()
        };
        let resolve = |external_key: String, details| IncidentNotification {
            status: Status::Ok,
            external_key,
            details,
            ..n.clone()
        };
        match n.destination.integration {
            IntegrationType::Slack | IntegrationType::Teams | IntegrationType::Webhook => {
                let row = if incident.is_resolved() {
                    resolve(String::new(), incident_details(app, incident))
                } else {
                    open(String::new())
                };
                self.db.put_incident_notification(&row)
            }
            IntegrationType::Pagerduty | IntegrationType::Opsgenie => {
                let (critical, warning) = self.open_incident_keys(&n)?;
                let key = format!("{}:{}:{}", project.id, incident.key, incident.severity);
                if incident.is_resolved() {
                    for k in [critical, warning] {
                        if !k.is_empty() {
                            self.db.put_incident_notification(&resolve(k, None))?;
                        }
                    }
                    return Ok(());
                }
                match incident.severity {
                    Status::Warning => {
                        if !critical.is_empty() {
                            self.db.put_incident_notification(&resolve(critical, None))?;
                        }
                        self.db.put_incident_notification(&open(key))
                    }
                    Status::Critical => self.db.put_incident_notification(&open(key)),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Open `(critical, warning)` page keys for the incident and destination.
    fn open_incident_keys(&self, n: &IncidentNotification) -> StorageResult<(String, String)> {
        let (mut critical, mut warning) = (String::new(), String::new());
        for prev in self.db.get_previous_incident_notifications(n)? {
            match prev.status {
                Status::Critical => critical = prev.external_key,
                Status::Warning => warning = prev.external_key,
                Status::Ok if prev.external_key == warning => warning.clear(),
                Status::Ok if prev.external_key == critical => critical.clear(),
                _ => {}
            }
        }
        Ok((critical, warning))
    }

    pub async fn send_incidents(&self) {
        let _pass = self.incidents_lock.lock().await;
        let pending = match self.db.get_not_sent_incident_notifications(self.retry_from()) {
            Ok(pending) => pending,
            Err(e) => {
                error!(target: "cerebro::notifications", error = %e, "failed to load incident notifications");
                return;
            }
        };
        let mut failed = FailedDestinations::default();
        for mut n in pending {
            if failed.contains(&n.project_id, &n.destination) {
                continue;
            }
            let Some(project) = self.projects.get(&n.project_id) else {
                continue;
            };
            let integrations = &project.integrations;
            let integration = n.destination.integration;
            let res = match NotificationClient::for_destination(&self.http, &n.destination, integrations, NotificationKind::Incident) {
                Err(e) => Err(e),
                Ok(None) => Ok(()),
                Ok(Some(client)) => {
                    if integration == IntegrationType::Slack {
                        match self.db.get_previous_incident_notifications(&n) {
                            Ok(prev) => {
                                if let Some(key) = prev.into_iter().rev().map(|p| p.external_key).find(|k| !k.is_empty()) {
                                    n.external_key = key;
                                }
                            }
                            Err(e) => error!(target: "cerebro::notifications", error = %e, "failed to load previous notifications"),
                        }
                    }
                    let res = self
                        .with_timeout(integration, client.send_incident(&integrations.base_url, &mut n))
                        .await;
                    record(integration, &res);
                    res
                }
            };
            match res {
                Err(e) => {
                    warn!(target: "cerebro::notifications", integration = %integration, incident = %n.incident_key, error = %e, "failed to send incident");
                    failed.insert(&n.project_id, &n.destination);
                }
                Ok(()) => {
                    n.sent_at = Time::now();
                    if let Err(e) = self.db.update_incident_notification(&n) {
                        error!(target: "cerebro::notifications", error = %e, "failed to mark incident notification sent");
                    }
                }
            }
        }
    }
}
