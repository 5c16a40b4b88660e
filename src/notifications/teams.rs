//! Microsoft Teams incoming webhook client posting adaptive cards.

use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::{alert_display_name, alert_url, check_response, deployment_url, incident_url, request_error};
use crate::db::{AlertNotification, IncidentNotification};
use crate::error::NotificationError;
use crate::model::{ApplicationDeploymentStatus, DeploymentState, IntegrationType, Project, Status};

pub struct Teams {
    http: HttpClient,
    webhook_url: String,
}

impl Teams {
    pub fn new(http: HttpClient, webhook_url: &str) -> Self {
        Self {
            http,
            webhook_url: webhook_url.to_string(),
        }
    }

    async fn post(&self, card: Value) -> Result<(), NotificationError> {
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&card)
            .send()
            .await
            .map_err(|e| request_error(IntegrationType::Teams, e))?;
        check_response(IntegrationType::Teams, resp).await?;
        Ok(())
    }

    pub async fn send_alert(&self, base_url: &str, n: &mut AlertNotification) -> Result<(), NotificationError> {
        self.post(alert_card(base_url, n)).await
    }

    pub async fn send_incident(&self, base_url: &str, n: &mut IncidentNotification) -> Result<(), NotificationError> {
        self.post(incident_card(base_url, n)).await
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
        self.post(deployment_card(project, ds)).await
    }
}

/// A message with a single adaptive card: bold title, markdown body and a
/// link button.
fn card(title: &str, text: &str, url: &str, action: &str) -> Value {
    let text = if text.is_empty() { " " } else { text };
    json!({
        "type": "message",
        "attachments": [{
            "contentType": "application/vnd.microsoft.card.adaptive",
            "content": {
                "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
                "type": "AdaptiveCard",
                "version": "1.4",
                "msteams": {"width": "Full"},
                "body": [
                    {"type": "TextBlock", "text": title, "wrap": true, "size": "Medium", "weight": "Bolder"},
                    {"type": "TextBlock", "text": text, "wrap": true},
                ],
                "actions": [{"type": "Action.OpenUrl", "title": action, "url": url}],
            },
        }],
    })
}

fn alert_card(base_url: &str, n: &AlertNotification) -> Value {
    let name = alert_display_name(n);
    let title = if n.status == Status::Ok {
        let mut resolved = "resolved".to_string();
        if let Some(by) = n.details.as_ref().map(|d| d.resolved_by.as_str()).filter(|b| !b.is_empty()) {
            resolved = format!("manually resolved by **{by}**");
        }
        match n.details.as_ref().filter(|d| !d.duration.is_zero()) {
            Some(d) => format!("**{name}** alert {resolved} (duration: {})", d.duration),
            None => format!("**{name}** alert {resolved}"),
        }
    } else {
        let summary = n.details.as_ref().map(|d| d.summary.as_str()).unwrap_or_default();
        format!("[{}] **{name}**: {summary}", n.status.as_str().to_uppercase())
    };
    let mut text = String::new();
    if let Some(d) = &n.details {
        if !d.rule_name.is_empty() {
            text.push_str(&format!("**Alerting rule**: {}\n\n", d.rule_name));
        }
        for item in &d.details {
            if item.code {
                text.push_str(&format!("**{}**:\n```\n{}\n```\n\n", item.name, item.value));
            } else {
                text.push_str(&format!("**{}**: {}\n\n", item.name, item.value));
            }
        }
    }
    card(&title, &text, &alert_url(base_url, n), "View alert")
}

fn incident_card(base_url: &str, n: &IncidentNotification) -> Value {
    let name = &n.application_id.name;
    let title = if n.status == Status::Ok {
        format!("**{name}** incident resolved")
    } else {
        format!("[{}] **{name}** is not meeting its SLOs", n.status.as_str().to_uppercase())
    };
    let text: String = n
        .details
        .iter()
        .flat_map(|d| &d.reports)
        .map(|r| format!("* **{}** / {}: {}\n", r.name, r.check, r.message))
        .collect();
    card(&title, &text, &incident_url(base_url, n), "View incident")
}

fn deployment_card(project: &Project, ds: &ApplicationDeploymentStatus) -> Value {
    let d = &ds.deployment;
    let title = format!("Deployment of **{}** to **{}**", d.application_id.name, project.name);
    let mut text = format!("**Status**: {}\n\n**Version**: {}\n\n", ds.state.title(), d.version());
    if ds.state == DeploymentState::Summary {
        text.push_str("**Summary:**\n\n");
        if ds.summary.is_empty() {
            text.push_str("No notable changes");
        }
        for s in &ds.summary {
            text.push_str(&format!("* {} {}\n", s.emoji(), s.message));
        }
    }
    let url = deployment_url(&project.integrations.base_url, &project.id, d);
    card(&title, &text, &url, "View deployment")
}
