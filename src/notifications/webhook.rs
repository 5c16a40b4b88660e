//! Generic webhook: renders the configured template for the notification
//! kind and POSTs the result as JSON. Without a template the data object
//! itself is sent.

use std::time::Duration as StdDuration;

use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::{application_value, alert_url, check_response, deployment_url, incident_url, request_error};
use crate::db::{AlertNotification, IncidentNotification};
use crate::error::NotificationError;
use crate::model::project::WebhookIntegration;
use crate::model::{ApplicationDeploymentStatus, DeploymentState, IntegrationType, Project, Status};
use crate::template;

pub struct Webhook {
    http: HttpClient,
    cfg: WebhookIntegration,
}

impl Webhook {
    pub fn new(cfg: &WebhookIntegration) -> Result<Self, NotificationError> {
        let http = HttpClient::builder()
            .connect_timeout(StdDuration::from_secs(10))
            .danger_accept_invalid_certs(cfg.tls_skip_verify)
            .build()
            .map_err(|e| request_error(IntegrationType::Webhook, e))?;
        Ok(Self { http, cfg: cfg.clone() })
    }

    async fn post(&self, tmpl: &str, data: &Value) -> Result<(), NotificationError> {
        let body = if tmpl.trim().is_empty() {
            data.to_string()
        } else {
            template::render(tmpl, data)?
        };
        let mut req = self
            .http
            .post(&self.cfg.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(auth) = self.cfg.basic_auth.as_ref().filter(|a| !a.user.is_empty()) {
            req = req.basic_auth(&auth.user, Some(&auth.password));
        }
        for h in &self.cfg.custom_headers {
            req = req.header(h.key.as_str(), h.value.as_str());
        }
        let resp = req.send().await.map_err(|e| request_error(IntegrationType::Webhook, e))?;
        check_response(IntegrationType::Webhook, resp).await?;
        Ok(())
    }

    pub async fn send_alert(&self, base_url: &str, n: &mut AlertNotification) -> Result<(), NotificationError> {
        self.post(&self.cfg.alert_template, &alert_data(base_url, n)).await
    }

    pub async fn send_incident(&self, base_url: &str, n: &mut IncidentNotification) -> Result<(), NotificationError> {
        self.post(&self.cfg.incident_template, &incident_data(base_url, n)).await
    }

    /// In-progress rollouts are not announced.
    pub async fn send_deployment(
        &self,
        project: &Project,
        ds: &mut ApplicationDeploymentStatus,
    ) -> Result<(), NotificationError> {
        if ds.state == DeploymentState::InProgress {
            return Ok(());
        }
        self.post(&self.cfg.deployment_template, &deployment_data(project, ds)).await
    }
}

fn status_text(s: Status) -> String {
    s.as_str().to_uppercase()
}

fn incident_data(base_url: &str, n: &IncidentNotification) -> Value {
    let reports: Vec<Value> = n
        .details
        .iter()
        .flat_map(|d| &d.reports)
        .map(|r| json!({"name": r.name, "check": r.check, "message": r.message}))
        .collect();
    json!({
        "status": status_text(n.status),
        "application": application_value(&n.application_id),
        "reports": reports,
        "url": incident_url(base_url, n),
    })
}

fn alert_data(base_url: &str, n: &AlertNotification) -> Value {
    let d = n.details.clone().unwrap_or_default();
    let details: Vec<Value> = d
        .details
        .iter()
        .map(|i| json!({"name": i.name, "value": i.value}))
        .collect();
    json!({
        "status": status_text(n.status),
        "project_name": d.project_name,
        "application": application_value(&n.application_id),
        "rule_name": d.rule_name,
        "severity": status_text(d.severity),
        "summary": d.summary,
        "details": details,
        "duration": if d.duration.is_zero() { String::new() } else { d.duration.to_string() },
        "resolved_by": d.resolved_by,
        "url": alert_url(base_url, n),
    })
}

fn deployment_data(project: &Project, ds: &ApplicationDeploymentStatus) -> Value {
    let d = &ds.deployment;
    let summary: Vec<String> = ds.summary.iter().map(|s| format!("{} {}", s.emoji(), s.message)).collect();
    json!({
        "status": ds.state.title(),
        "application": application_value(&d.application_id),
        "version": d.version(),
        "summary": summary,
        "url": deployment_url(&project.integrations.base_url, &project.id, d),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IncidentNotificationDetails, IncidentReport, NotificationDestination};
    use crate::model::project::{BasicAuth, Header};
    use crate::model::ProjectId;
    use crate::notifications::tests::{app, capture_server};
    use crate::timeseries::Time;
    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;

    fn incident() -> IncidentNotification {
        IncidentNotification {
            project_id: ProjectId::new("p1"),
            application_id: app(),
            incident_key: "k1".into(),
            status: Status::Warning,
            destination: NotificationDestination::new(IntegrationType::Webhook, ""),
            timestamp: Time(1000),
            sent_at: Time::ZERO,
            external_key: String::new(),
            details: Some(IncidentNotificationDetails {
                reports: vec![IncidentReport {
                    name: "SLO".into(),
                    check: "Availability".into(),
                    message: "errors".into(),
                }],
            }),
        }
    }

    #[test]
    fn test_incident_data() {
        let data = incident_data("https://c.io", &incident());
        assert_eq!(data["status"], "WARNING");
        assert_eq!(data["application"]["name"], "cart");
        assert_eq!(data["application"]["kind"], "Deployment");
        assert_eq!(data["reports"][0]["check"], "Availability");
        assert_eq!(data["url"], "https://c.io/p/p1/incidents?incident=k1");
    }

    #[tokio::test]
    async fn test_template_auth_and_headers() {
        let (url, seen) = capture_server(StatusCode::OK).await;
        let hook = Webhook::new(&WebhookIntegration {
            url: format!("{url}/hook"),
            basic_auth: Some(BasicAuth {
                user: "u".into(),
                password: "p".into(),
            }),
            custom_headers: vec![Header {
                key: "X-Team".into(),
                value: "sre".into(),
            }],
            incidents: true,
            incident_template: r#"{"text": "{{ .status }} {{ .application.name }}", "reports": {{ json .reports }}}"#.into(),
            ..Default::default()
        })
        .unwrap();
        hook.send_incident("", &mut incident()).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen[0].path, "/hook");
        // base64("u:p")
        assert_eq!(seen[0].authorization, "Basic dTpw");
        let body: Value = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(body["text"], "WARNING cart");
        assert_eq!(body["reports"][0]["message"], "errors");
    }

    #[tokio::test]
    async fn test_without_template_and_failure() {
        let (url, seen) = capture_server(StatusCode::OK).await;
        let hook = Webhook::new(&WebhookIntegration {
            url: url.clone(),
            ..Default::default()
        })
        .unwrap();
        hook.send_incident("https://c.io", &mut incident()).await.unwrap();
        let body: Value = serde_json::from_str(&seen.lock()[0].body).unwrap();
        assert_eq!(body, incident_data("https://c.io", &incident()));

        let (url, _) = capture_server(StatusCode::INTERNAL_SERVER_ERROR).await;
        let hook = Webhook::new(&WebhookIntegration {
            url,
            ..Default::default()
        })
        .unwrap();
        assert!(hook.send_incident("", &mut incident()).await.is_err());
    }
}
