// ============================================================================
// NOTIFICATION DISPATCHER
// ============================================================================
// Outbox based delivery of alert, incident and deployment notifications to
// Slack, Microsoft Teams, PagerDuty, Opsgenie and generic webhooks.
//
// Watchers enqueue one outbox row per enabled destination and trigger an
// immediate send pass; a background loop retries unsent rows of the last
// `retry_window`. A row is marked sent only after its integration accepted
// it, and send passes of one kind never overlap.
// ============================================================================

mod alerts;
mod incidents;
pub mod opsgenie;
pub mod pagerduty;
pub mod slack;
pub mod teams;
pub mod webhook;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NotificationsConfig;
use crate::db::{AlertNotification, Db, IncidentNotification, NotificationDestination};
use crate::error::{NotificationError, ObserveResult};
use crate::model::project::Integrations;
use crate::model::{
    ApplicationDeployment, ApplicationDeploymentStatus, ApplicationId, IntegrationType, NotificationKind, Project,
    ProjectId, ProjectRegistry,
};
use crate::telemetry::metrics;

pub use opsgenie::Opsgenie;
pub use pagerduty::Pagerduty;
pub use slack::Slack;
pub use teams::Teams;
pub use webhook::Webhook;

/// Identifies the sender towards paging integrations.
pub(crate) const SOURCE: &str = "Cerebro";

// ----------------------------------------------------------------------------
// 1. Clients
// ----------------------------------------------------------------------------

/// A configured integration, built per send from the project settings.
pub enum NotificationClient {
    Slack(Slack),
    Teams(Teams),
    Pagerduty(Pagerduty),
    Opsgenie(Opsgenie),
    Webhook(Webhook),
}

impl NotificationClient {
    /// `None` when the integration is missing or does not accept `kind`.
    pub fn for_destination(
        http: &HttpClient,
        destination: &NotificationDestination,
        integrations: &Integrations,
        kind: NotificationKind,
    ) -> Result<Option<Self>, NotificationError> {
        if !integrations.allows(destination.integration, kind) {
            return Ok(None);
        }
        let client = match destination.integration {
            IntegrationType::Slack => integrations.slack.as_ref().map(|cfg| {
                let channel = if destination.slack_channel.is_empty() {
                    &cfg.default_channel
                } else {
                    &destination.slack_channel
                };
                NotificationClient::Slack(Slack::new(http.clone(), &cfg.token, channel))
            }),
            IntegrationType::Teams => integrations
                .teams
                .as_ref()
                .map(|cfg| NotificationClient::Teams(Teams::new(http.clone(), &cfg.webhook_url))),
            IntegrationType::Pagerduty => integrations
                .pagerduty
                .as_ref()
                .map(|cfg| NotificationClient::Pagerduty(Pagerduty::new(http.clone(), &cfg.integration_key))),
            IntegrationType::Opsgenie => integrations
                .opsgenie
                .as_ref()
                .map(|cfg| NotificationClient::Opsgenie(Opsgenie::new(http.clone(), &cfg.api_key, cfg.eu_instance))),
            IntegrationType::Webhook => match integrations.webhook.as_ref() {
                Some(cfg) => Some(NotificationClient::Webhook(Webhook::new(cfg)?)),
                None => None,
            },
        };
        Ok(client)
    }

    pub fn integration(&self) -> IntegrationType {
        match self {
            NotificationClient::Slack(_) => IntegrationType::Slack,
            NotificationClient::Teams(_) => IntegrationType::Teams,
            NotificationClient::Pagerduty(_) => IntegrationType::Pagerduty,
            NotificationClient::Opsgenie(_) => IntegrationType::Opsgenie,
            NotificationClient::Webhook(_) => IntegrationType::Webhook,
        }
    }

    /// Slack stores the thread of the alert in `n.external_key`.
    pub async fn send_alert(&self, base_url: &str, n: &mut AlertNotification) -> Result<(), NotificationError> {
        match self {
            NotificationClient::Slack(c) => c.send_alert(base_url, n).await,
            NotificationClient::Teams(c) => c.send_alert(base_url, n).await,
            NotificationClient::Pagerduty(c) => c.send_alert(base_url, n).await,
            NotificationClient::Opsgenie(c) => c.send_alert(base_url, n).await,
            NotificationClient::Webhook(c) => c.send_alert(base_url, n).await,
        }
    }

    pub async fn send_incident(&self, base_url: &str, n: &mut IncidentNotification) -> Result<(), NotificationError> {
        match self {
            NotificationClient::Slack(c) => c.send_incident(base_url, n).await,
            NotificationClient::Teams(c) => c.send_incident(base_url, n).await,
            NotificationClient::Pagerduty(c) => c.send_incident(base_url, n).await,
            NotificationClient::Opsgenie(c) => c.send_incident(base_url, n).await,
            NotificationClient::Webhook(c) => c.send_incident(base_url, n).await,
        }
    }

    /// Slack records its message in `ds.deployment.notifications.slack`.
    pub async fn send_deployment(
        &self,
        project: &Project,
        ds: &mut ApplicationDeploymentStatus,
    ) -> Result<(), NotificationError> {
        match self {
            NotificationClient::Slack(c) => c.send_deployment(project, ds).await,
            NotificationClient::Teams(c) => c.send_deployment(project, ds).await,
            NotificationClient::Webhook(c) => c.send_deployment(project, ds).await,
            NotificationClient::Pagerduty(_) | NotificationClient::Opsgenie(_) => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// 2. Shared helpers
// ----------------------------------------------------------------------------

pub(crate) fn incident_url(base_url: &str, n: &IncidentNotification) -> String {
    format!("{base_url}/p/{}/incidents?incident={}", n.project_id, n.incident_key)
}

pub(crate) fn alert_url(base_url: &str, n: &AlertNotification) -> String {
    format!("{base_url}/p/{}/alerts?alert={}", n.project_id, n.alert_id)
}

pub(crate) fn deployment_url(base_url: &str, project_id: &ProjectId, d: &ApplicationDeployment) -> String {
    format!("{base_url}/p/{project_id}/app/{}/Deployments#{}", d.application_id, d.id())
}

/// Application name, or the rule name for alerts not bound to an application.
pub(crate) fn alert_display_name(n: &AlertNotification) -> String {
    if !n.application_id.is_zero() {
        return n.application_id.name.clone();
    }
    n.details.as_ref().map(|d| d.rule_name.clone()).unwrap_or_default()
}

pub(crate) fn application_value(id: &ApplicationId) -> Value {
    json!({
        "cluster_id": id.cluster_id,
        "namespace": id.namespace,
        "kind": id.kind.as_str(),
        "name": id.name,
    })
}

/// Maps a non-2xx response to an integration error carrying the body.
pub(crate) async fn check_response(
    integration: IntegrationType,
    resp: reqwest::Response,
) -> Result<reqwest::Response, NotificationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(NotificationError::integration(
        integration.as_str(),
        format!("HTTP {}: {}", status.as_u16(), body.trim()),
    ))
}

pub(crate) fn request_error(integration: IntegrationType, e: reqwest::Error) -> NotificationError {
    NotificationError::integration(integration.as_str(), e.to_string())
}

// ----------------------------------------------------------------------------
// 3. Notifier
// ----------------------------------------------------------------------------

pub struct Notifier {
    db: Arc<Db>,
    projects: Arc<ProjectRegistry>,
    cfg: NotificationsConfig,
    http: HttpClient,
    alerts_lock: tokio::sync::Mutex<()>,
    incidents_lock: tokio::sync::Mutex<()>,
}

impl Notifier {
    pub fn new(db: Arc<Db>, projects: Arc<ProjectRegistry>, cfg: NotificationsConfig) -> ObserveResult<Arc<Self>> {
        let http = HttpClient::builder()
            .connect_timeout(StdDuration::from_secs(10))
            .build()
            .map_err(crate::error::NetworkError::from)?;
        Ok(Arc::new(Self {
            db,
            projects,
            cfg,
            http,
            alerts_lock: tokio::sync::Mutex::new(()),
            incidents_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Retries unsent notifications every `retry_interval` until shutdown.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.cfg.retry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(target: "cerebro::notifications", interval = ?this.cfg.retry_interval, "notification sender started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        this.send_incidents().await;
                        this.send_alerts().await;
                    }
                }
            }
            info!(target: "cerebro::notifications", "notification sender stopped");
        })
    }

    /// Sends one deployment status to a single integration.
    pub async fn send_deployment(
        &self,
        project: &Project,
        integration: IntegrationType,
        slack_channel: &str,
        ds: &mut ApplicationDeploymentStatus,
    ) -> Result<(), NotificationError> {
        let destination = NotificationDestination::new(integration, slack_channel);
        let client = NotificationClient::for_destination(
            &self.http,
            &destination,
            &project.integrations,
            NotificationKind::Deployment,
        )?;
        let Some(client) = client else {
            return Err(NotificationError::NotConfigured {
                integration: integration.to_string(),
            });
        };
        let res = self.with_timeout(integration, client.send_deployment(project, ds)).await;
        record(integration, &res);
        res
    }

    async fn with_timeout<F>(&self, integration: IntegrationType, f: F) -> Result<(), NotificationError>
    where
        F: Future<Output = Result<(), NotificationError>>,
    {
        match tokio::time::timeout(self.cfg.send_timeout, f).await {
            Ok(res) => res,
            Err(_) => Err(NotificationError::integration(
                integration.as_str(),
                format!("timed out after {:?}", self.cfg.send_timeout),
            )),
        }
    }

    fn retry_from(&self) -> crate::timeseries::Time {
        crate::timeseries::Time::now() - crate::timeseries::Duration::from_std(self.cfg.retry_window)
    }
}

fn record(integration: IntegrationType, res: &Result<(), NotificationError>) {
    let m = metrics();
    match res {
        Ok(()) => m.notifications_sent.with_label_values(&[integration.as_str()]).inc(),
        Err(_) => m.notifications_failed.with_label_values(&[integration.as_str()]).inc(),
    }
}

/// Destinations that already failed during the current send pass.
#[derive(Default)]
struct FailedDestinations(HashSet<(ProjectId, NotificationDestination)>);

impl FailedDestinations {
    fn contains(&self, project_id: &ProjectId, d: &NotificationDestination) -> bool {
        self.0.contains(&(project_id.clone(), d.clone()))
    }

    fn insert(&mut self, project_id: &ProjectId, d: &NotificationDestination) {
        self.0.insert((project_id.clone(), d.clone()));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::project::{SlackIntegration, WebhookIntegration};
    use crate::model::ApplicationKind;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Clone, Debug)]
    pub(crate) struct Captured {
        pub path: String,
        pub authorization: String,
        pub body: String,
    }

    /// Local HTTP endpoint recording every request. Answers like the Slack
    /// API so it serves for every integration.
    pub(crate) async fn capture_server(status: StatusCode) -> (String, Arc<Mutex<Vec<Captured>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let app = axum::Router::new().fallback(move |uri: Uri, headers: HeaderMap, body: String| {
            let s = s.clone();
            async move {
                s.lock().push(Captured {
                    path: uri.to_string(),
                    authorization: headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string(),
                    body,
                });
                (status, r#"{"ok":true,"channel":"C42","ts":"1700000000.0001"}"#)
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    pub(crate) fn app() -> ApplicationId {
        ApplicationId::new("c1", "shop", ApplicationKind::Deployment, "cart")
    }

    #[test]
    fn test_urls() {
        let n = IncidentNotification {
            project_id: ProjectId::new("p1"),
            application_id: app(),
            incident_key: "abcd".into(),
            status: crate::model::Status::Critical,
            destination: NotificationDestination::new(IntegrationType::Teams, ""),
            timestamp: crate::timeseries::Time(100),
            sent_at: crate::timeseries::Time::ZERO,
            external_key: String::new(),
            details: None,
        };
        assert_eq!(incident_url("https://c.io", &n), "https://c.io/p/p1/incidents?incident=abcd");
        let d = ApplicationDeployment {
            application_id: app(),
            started_at: crate::timeseries::Time(1700),
            ..Default::default()
        };
        assert_eq!(
            deployment_url("https://c.io", &n.project_id, &d),
            "https://c.io/p/p1/app/c1:shop:Deployment:cart/Deployments#1700"
        );
    }

    #[test]
    fn test_client_selection() {
        let http = HttpClient::new();
        let integrations = Integrations {
            slack: Some(SlackIntegration {
                token: "t".into(),
                default_channel: "general".into(),
                incidents: false,
                deployments: true,
            }),
            webhook: Some(WebhookIntegration {
                url: "http://localhost/hook".into(),
                incidents: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let slack = NotificationDestination::new(IntegrationType::Slack, "");
        let hook = NotificationDestination::new(IntegrationType::Webhook, "");
        let pd = NotificationDestination::new(IntegrationType::Pagerduty, "");

        let select = |d: &NotificationDestination, kind| {
            NotificationClient::for_destination(&http, d, &integrations, kind)
                .unwrap()
                .map(|c| c.integration())
        };
        assert_eq!(select(&slack, NotificationKind::Incident), None);
        assert_eq!(select(&slack, NotificationKind::Alert), Some(IntegrationType::Slack));
        assert_eq!(select(&hook, NotificationKind::Incident), Some(IntegrationType::Webhook));
        assert_eq!(select(&hook, NotificationKind::Alert), None);
        assert_eq!(select(&pd, NotificationKind::Alert), None);
    }
}
