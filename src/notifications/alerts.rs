//! Alert notifications: outbox rows per destination and the send pass.

use tracing::{error, warn};

use super::{record, FailedDestinations, NotificationClient, Notifier};
use crate::db::{AlertNotification, AlertNotificationDetails, NotificationDestination};
use crate::error::StorageResult;
use crate::model::project::DEFAULT_CATEGORY;
use crate::model::{Alert, AlertDetail, AlertingRule, IntegrationType, NotificationKind, Project, Status};
use crate::timeseries::Time;

/// Chart and query details are only useful in the UI.
fn filter_details(details: &[AlertDetail]) -> Vec<AlertDetail> {
    details
        .iter()
        .filter(|d| d.name != "PromQL" && d.name != "PromQLChart")
        .cloned()
        .collect()
}

fn external_key(project: &Project, alert: &Alert) -> String {
    format!("{}:{}:{}", project.id, alert.id, alert.severity)
}

/// The application category if known, else the rule's notification
/// category, else the default one.
fn category(app_category: Option<&str>, rule: &AlertingRule) -> String {
    match app_category.filter(|c| !c.is_empty()) {
        Some(c) => c.to_string(),
        None if !rule.notification_category.is_empty() => rule.notification_category.clone(),
        None => DEFAULT_CATEGORY.to_string(),
    }
}

impl Notifier {
    /// Queues the current state of `alert` for every destination of its
    /// category and runs a send pass.
    pub async fn enqueue_alert(
        &self,
        project: &Project,
        app_category: Option<&str>,
        alert: &Alert,
        rule: &AlertingRule,
        now: Time,
    ) {
        if self.queue_alert(project, app_category, alert, rule, now) {
            self.send_alerts().await;
        }
    }

    /// Writes the outbox rows only. Returns whether any destination exists.
    pub fn queue_alert(
        &self,
        project: &Project,
        app_category: Option<&str>,
        alert: &Alert,
        rule: &AlertingRule,
        now: Time,
    ) -> bool {
        let category = category(app_category, rule);
        let destinations = project.notification_destinations(&category, NotificationKind::Alert);
        if destinations.is_empty() {
            return false;
        }
        let mut details = AlertNotificationDetails {
            project_name: project.name.clone(),
            rule_name: rule.name.clone(),
            severity: alert.severity,
            summary: alert.summary.clone(),
            details: filter_details(&alert.details),
            ..Default::default()
        };
        if alert.is_resolved() {
            details.duration = alert.resolved_at - alert.opened_at;
        }
        for (integration, channel) in destinations {
            let n = AlertNotification {
                project_id: project.id.clone(),
                alert_id: alert.id,
                rule_id: alert.rule_id.clone(),
                application_id: alert.application_id.clone(),
                status: alert.severity,
                destination: NotificationDestination::new(integration, channel),
                timestamp: now,
                sent_at: Time::ZERO,
                external_key: String::new(),
                details: Some(details.clone()),
            };
            if let Err(e) = self.enqueue_alert_notification(project, alert, n) {
                error!(target: "cerebro::notifications", alert_id = alert.id, error = %e, "failed to enqueue alert notification");
            }
        }
        true
    }

    fn enqueue_alert_notification(&self, project: &Project, alert: &Alert, mut n: AlertNotification) -> StorageResult<()> {
        match n.destination.integration {
            IntegrationType::Slack | IntegrationType::Teams | IntegrationType::Webhook => {
                if alert.is_resolved() {
                    n.status = Status::Ok;
                }
            }
            IntegrationType::Pagerduty | IntegrationType::Opsgenie => {
                if alert.is_resolved() {
                    let open_key = self.open_alert_key(&n)?;
                    if open_key.is_empty() {
                        return Ok(());
                    }
                    n.status = Status::Ok;
                    n.external_key = open_key;
                } else {
                    n.external_key = external_key(project, alert);
                }
            }
        }
        self.db.put_alert_notification(&n)
    }

    /// The key of the paging alert still open for this alert and
    /// destination, empty if none.
    fn open_alert_key(&self, n: &AlertNotification) -> StorageResult<String> {
        let mut open = String::new();
        for prev in self.db.get_previous_alert_notifications(n)? {
            if prev.status != Status::Ok {
                open = prev.external_key;
            } else if prev.external_key == open {
                open.clear();
            }
        }
        Ok(open)
    }

    /// Queues resolution notifications for alerts resolved by an operator.
    pub async fn enqueue_resolved_alerts(&self, project: &Project, alerts: &[Alert], rule: &AlertingRule) {
        self.queue_resolved_alerts(project, alerts, rule, Time::now());
        self.send_alerts().await;
    }

    pub fn queue_resolved_alerts(&self, project: &Project, alerts: &[Alert], rule: &AlertingRule, now: Time) {
        for alert in alerts {
            let category = category(Some(&alert.application_category), rule);
            let details = AlertNotificationDetails {
                project_name: project.name.clone(),
                rule_name: rule.name.clone(),
                severity: alert.severity,
                summary: alert.summary.clone(),
                details: filter_details(&alert.details),
                duration: now - alert.opened_at,
                resolved_by: alert.resolved_by.clone(),
            };
            for (integration, channel) in project.notification_destinations(&category, NotificationKind::Alert) {
                let external_key = match integration {
                    IntegrationType::Pagerduty | IntegrationType::Opsgenie => external_key(project, alert),
                    _ => String::new(),
                };
                let n = AlertNotification {
                    project_id: project.id.clone(),
                    alert_id: alert.id,
                    rule_id: alert.rule_id.clone(),
                    application_id: alert.application_id.clone(),
                    status: Status::Ok,
                    destination: NotificationDestination::new(integration, channel),
                    timestamp: now,
                    sent_at: Time::ZERO,
                    external_key,
                    details: Some(details.clone()),
                };
                if let Err(e) = self.db.put_alert_notification(&n) {
                    error!(target: "cerebro::notifications", alert_id = alert.id, error = %e, "failed to enqueue alert notification");
                }
            }
        }
    }

    /// Delivers unsent alert notifications of the retry window, oldest
    /// first. The first failure of a destination skips the rest of its
    /// rows until the next pass.
    pub async fn send_alerts(&self) {
        let _pass = self.alerts_lock.lock().await;
        let pending = match self.db.get_not_sent_alert_notifications(self.retry_from()) {
            Ok(pending) => pending,
            Err(e) => {
                error!(target: "cerebro::notifications", error = %e, "failed to load alert notifications");
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
            let res = match NotificationClient::for_destination(&self.http, &n.destination, integrations, NotificationKind::Alert) {
                Err(e) => Err(e),
                // the integration was removed or disabled; the row is dropped
                Ok(None) => Ok(()),
                Ok(Some(client)) => {
                    if integration == IntegrationType::Slack {
                        match self.db.get_previous_alert_notifications(&n) {
                            Ok(prev) => {
                                if let Some(key) = prev.into_iter().rev().map(|p| p.external_key).find(|k| !k.is_empty()) {
                                    n.external_key = key;
                                }
                            }
                            Err(e) => error!(target: "cerebro::notifications", error = %e, "failed to load previous notifications"),
                        }
                    }
                    let res = self
                        .with_timeout(integration, client.send_alert(&integrations.base_url, &mut n))
                        .await;
                    record(integration, &res);
                    res
                }
            };
            match res {
                Err(e) => {
                    warn!(target: "cerebro::notifications", integration = %integration, alert_id = n.alert_id, error = %e, "failed to send alert");
                    failed.insert(&n.project_id, &n.destination);
                }
                Ok(()) => {
                    n.sent_at = Time::now();
                    if let Err(e) = self.db.update_alert_notification(&n) {
                        error!(target: "cerebro::notifications", error = %e, "failed to mark alert notification sent");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationsConfig;
    use crate::db::Db;
    use crate::model::project::{Integrations, PagerdutyIntegration, WebhookIntegration};
    use crate::model::{AlertSource, ProjectId, ProjectRegistry};
    use crate::notifications::tests::{app, capture_server};
    use crate::timeseries::Duration;
    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn rule() -> AlertingRule {
        AlertingRule {
            id: "r1".into(),
            name: "Disk space".into(),
            source: AlertSource::Promql {
                expression: "up == 0".into(),
            },
            selector: Default::default(),
            severity: Status::Warning,
            r#for: Default::default(),
            keep_firing_for: Default::default(),
            templates: Default::default(),
            notification_category: String::new(),
            enabled: true,
            builtin: false,
        }
    }

    fn project(hook_url: &str) -> Project {
        Project {
            id: ProjectId::new("p1"),
            name: "prod".into(),
            integrations: Integrations {
                base_url: "https://c.io".into(),
                pagerduty: Some(PagerdutyIntegration {
                    integration_key: "k".into(),
                    incidents: true,
                }),
                webhook: Some(WebhookIntegration {
                    url: hook_url.into(),
                    alerts: true,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn notifier(project: Project) -> Arc<Notifier> {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let registry = Arc::new(ProjectRegistry::new(vec![project]));
        Notifier::new(db, registry, NotificationsConfig::default()).unwrap()
    }

    fn alert(id: i64) -> Alert {
        Alert {
            id,
            rule_id: "r1".into(),
            application_id: app(),
            severity: Status::Warning,
            summary: "disk is almost full".into(),
            details: vec![
                AlertDetail::new("Volume", "/data"),
                AlertDetail::code("PromQL", "up == 0"),
            ],
            opened_at: Time(1000),
            ..Default::default()
        }
    }

    fn rows(n: &Notifier, integration: IntegrationType) -> Vec<AlertNotification> {
        n.db.get_alert_notification_history(&ProjectId::new("p1"), 1, &NotificationDestination::new(integration, ""))
            .unwrap()
    }

    #[test]
    fn test_category() {
        let mut r = rule();
        assert_eq!(category(Some("db"), &r), "db");
        assert_eq!(category(None, &r), DEFAULT_CATEGORY);
        r.notification_category = "infra".into();
        assert_eq!(category(Some(""), &r), "infra");
    }

    #[tokio::test]
    async fn test_enqueue_and_deliver() {
        let (url, seen) = capture_server(StatusCode::OK).await;
        let mut p = project(&format!("{url}/hook"));
        p.integrations.pagerduty = None;
        let n = notifier(p.clone());

        n.enqueue_alert(&p, Some(DEFAULT_CATEGORY), &alert(1), &rule(), Time::now()).await;

        let hook = rows(&n, IntegrationType::Webhook);
        assert_eq!(hook.len(), 1);
        assert!(!hook[0].sent_at.is_zero());
        let details = hook[0].details.clone().unwrap();
        assert_eq!(details.details, vec![AlertDetail::new("Volume", "/data")]);
        let body: serde_json::Value = serde_json::from_str(&seen.lock()[0].body).unwrap();
        assert_eq!(body["rule_name"], "Disk space");
        assert_eq!(body["status"], "WARNING");

        // sent rows are not sent again
        n.send_alerts().await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_paging_keys() {
        let p = project("http://127.0.0.1:9/hook");
        let n = notifier(p.clone());
        let now = Time(10_000);

        // resolving an alert that never paged writes no paging row
        let mut a = alert(1);
        a.resolved_at = now;
        assert!(n.queue_alert(&p, None, &a, &rule(), now));
        assert!(rows(&n, IntegrationType::Pagerduty).is_empty());

        a.resolved_at = Time::ZERO;
        n.queue_alert(&p, None, &a, &rule(), now + Duration(1));
        a.resolved_at = now + Duration(2);
        n.queue_alert(&p, None, &a, &rule(), now + Duration(2));

        let pd = rows(&n, IntegrationType::Pagerduty);
        assert_eq!(pd.len(), 2);
        assert_eq!((pd[0].status, pd[0].external_key.as_str()), (Status::Warning, "p1:1:warning"));
        assert_eq!((pd[1].status, pd[1].external_key.as_str()), (Status::Ok, "p1:1:warning"));
        assert_eq!(pd[1].details.as_ref().unwrap().duration, Duration(10_002 - 1000));

        let hook = rows(&n, IntegrationType::Webhook);
        assert_eq!(
            hook.iter().map(|r| r.status).collect::<Vec<_>>(),
            vec![Status::Ok, Status::Warning, Status::Ok]
        );
        assert!(hook.iter().all(|r| r.external_key.is_empty()));
    }

    #[tokio::test]
    async fn test_failed_destination_is_retried_later() {
        let (url, seen) = capture_server(StatusCode::SERVICE_UNAVAILABLE).await;
        let mut p = project(&format!("{url}/hook"));
        p.integrations.pagerduty = None;
        let n = notifier(p.clone());
        let now = Time::now();

        n.enqueue_alert(&p, None, &alert(1), &rule(), now).await;
        n.enqueue_alert(&p, None, &alert(2), &rule(), now).await;
        // one attempt per pass: the first failure blocks the destination
        assert_eq!(seen.lock().len(), 2);
        let unsent = n.db.get_not_sent_alert_notifications(now - Duration::HOUR).unwrap();
        assert_eq!(unsent.len(), 2);

        n.send_alerts().await;
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn test_queue_resolved_alerts() {
        let p = project("http://127.0.0.1:9/hook");
        let n = notifier(p.clone());
        let mut a = alert(1);
        a.resolved_by = "alice".into();
        n.queue_resolved_alerts(&p, &[a], &rule(), Time(4600));

        let pd = rows(&n, IntegrationType::Pagerduty);
        assert_eq!(pd[0].status, Status::Ok);
        assert_eq!(pd[0].external_key, "p1:1:warning");
        let hook = rows(&n, IntegrationType::Webhook);
        let details = hook[0].details.as_ref().unwrap();
        assert_eq!(details.resolved_by, "alice");
        assert_eq!(details.duration, Duration::HOUR);
    }
}
