//! Slack Web API client (`chat.postMessage`, `chat.update`).
//!
//! The first message about an alert or incident starts a thread; its `ts`
//! becomes the external key and later state changes are posted as replies,
//! broadcast to the channel on resolution.

use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{alert_display_name, alert_url, check_response, deployment_url, incident_url, request_error};
use crate::db::{AlertNotification, IncidentNotification};
use crate::error::NotificationError;
use crate::model::{ApplicationDeploymentStatus, DeploymentState, IntegrationType, Project, Status};

const API_URL: &str = "https://slack.com/api";

pub struct Slack {
    http: HttpClient,
    api_url: String,
    token: String,
    channel: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    ts: String,
}

impl Slack {
    pub fn new(http: HttpClient, token: &str, channel: &str) -> Self {
        Self {
            http,
            api_url: API_URL.to_string(),
            token: token.to_string(),
            channel: channel.to_string(),
        }
    }

    pub fn with_api_url(mut self, api_url: &str) -> Self {
        self.api_url = api_url.trim_end_matches('/').to_string();
        self
    }

    async fn call(&self, method: &str, body: Value) -> Result<ApiResponse, NotificationError> {
        let resp = self
            .http
            .post(format!("{}/{method}", self.api_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(IntegrationType::Slack, e))?;
        let resp = check_response(IntegrationType::Slack, resp).await?;
        let res: ApiResponse = resp.json().await.map_err(|e| request_error(IntegrationType::Slack, e))?;
        if !res.ok {
            return Err(NotificationError::integration("slack", format!("{method}: {}", res.error)));
        }
        Ok(res)
    }

    /// Posts `message` into the channel, or into the thread `thread_ts`.
    /// Returns the thread the message belongs to.
    async fn post(&self, thread_ts: &str, broadcast: bool, mut message: Value) -> Result<String, NotificationError> {
        message["channel"] = json!(self.channel);
        message["unfurl_links"] = json!(false);
        if !thread_ts.is_empty() {
            message["thread_ts"] = json!(thread_ts);
            if broadcast {
                message["reply_broadcast"] = json!(true);
            }
        }
        let res = self.call("chat.postMessage", message).await?;
        if thread_ts.is_empty() {
            return Ok(res.ts);
        }
        Ok(thread_ts.to_string())
    }

    pub async fn send_alert(&self, base_url: &str, n: &mut AlertNotification) -> Result<(), NotificationError> {
        let message = alert_message(base_url, n);
        n.external_key = self.post(&n.external_key, n.status == Status::Ok, message).await?;
        Ok(())
    }

    pub async fn send_incident(&self, base_url: &str, n: &mut IncidentNotification) -> Result<(), NotificationError> {
        let message = incident_message(base_url, n);
        n.external_key = self.post(&n.external_key, n.status == Status::Ok, message).await?;
        Ok(())
    }

    /// Keeps one message per deployment up to date and replies in its
    /// thread with every new state.
    pub async fn send_deployment(
        &self,
        project: &Project,
        ds: &mut ApplicationDeploymentStatus,
    ) -> Result<(), NotificationError> {
        let d = &ds.deployment;
        let url = deployment_url(&project.integrations.base_url, &project.id, d);
        let link = |title: &str| format!("<{url}|*{title}*>");
        let summary = (ds.state == DeploymentState::Summary).then(|| {
            let items = if ds.summary.is_empty() {
                "No notable changes".to_string()
            } else {
                ds.summary
                    .iter()
                    .map(|s| format!("{} {}\n", s.emoji(), s.message))
                    .collect::<String>()
            };
            section(&format!("*Summary*\n{items}"))
        });
        let mut blocks = vec![
            section(&format!(
                "Deployment of {} to *{}*",
                link(&d.application_id.name),
                project.name
            )),
            json!({
                "type": "section",
                "fields": [
                    mrkdwn(&format!("*Status*\n{}", ds.state.title())),
                    mrkdwn(&format!("*Version*\n{}", link(&d.version()))),
                ],
            }),
        ];
        if let Some(s) = &summary {
            blocks.push(s.clone());
        }
        blocks.push(json!({
            "type": "context",
            "elements": [mrkdwn(&format!(
                "<!date^{}^{{date_short_pretty}} at {{time}}|{}>",
                d.started_at.0,
                d.started_at.to_datetime().to_rfc2822()
            ))],
        }));

        let fallback = format!("Deployment of {} to {}", d.application_id.name, project.name);
        let attachments = json!([attachment(ds.status, &fallback, blocks)]);
        let ns = &ds.deployment.notifications.slack;
        let (channel, ts) = if !ns.channel.is_empty() && !ns.thread_ts.is_empty() {
            let res = self
                .call(
                    "chat.update",
                    json!({"channel": ns.channel, "ts": ns.thread_ts, "attachments": attachments}),
                )
                .await?;
            let channel = if res.channel.is_empty() { ns.channel.clone() } else { res.channel };
            (channel, ns.thread_ts.clone())
        } else {
            let res = self
                .call(
                    "chat.postMessage",
                    json!({"channel": self.channel, "attachments": attachments, "unfurl_links": false}),
                )
                .await?;
            (res.channel, res.ts)
        };

        let reply = match summary {
            Some(s) => json!({"channel": channel, "thread_ts": ts, "blocks": [s]}),
            None => json!({
                "channel": channel,
                "thread_ts": ts,
                "attachments": [attachment(
                    ds.status,
                    &format!("{fallback}: {}", ds.state.title()),
                    vec![section(&ds.message)],
                )],
            }),
        };
        let ns = &mut ds.deployment.notifications.slack;
        ns.channel = channel;
        ns.thread_ts = ts;
        self.call("chat.postMessage", reply).await?;
        Ok(())
    }
}

fn mrkdwn(text: &str) -> Value {
    json!({"type": "mrkdwn", "text": text})
}

fn section(text: &str) -> Value {
    json!({"type": "section", "text": mrkdwn(text)})
}

fn attachment(status: Status, fallback: &str, blocks: Vec<Value>) -> Value {
    json!({"color": status.color(), "fallback": fallback, "blocks": blocks})
}

/// Header plus an optional coloured attachment with the details.
fn message(fallback: &str, header: &str, status: Status, details: &str) -> Value {
    let mut m = json!({"text": fallback, "blocks": [section(header)]});
    if !details.is_empty() {
        m["attachments"] = json!([attachment(status, fallback, vec![section(details)])]);
    }
    m
}

fn alert_message(base_url: &str, n: &AlertNotification) -> Value {
    let name = alert_display_name(n);
    let link = format!("<{}|*{name}*>", alert_url(base_url, n));
    let (header, fallback) = if n.status == Status::Ok {
        let mut resolved = "resolved".to_string();
        if let Some(by) = n.details.as_ref().map(|d| d.resolved_by.as_str()).filter(|b| !b.is_empty()) {
            resolved = format!("manually resolved by *{by}*");
        }
        let duration = n
            .details
            .as_ref()
            .filter(|d| !d.duration.is_zero())
            .map(|d| format!(" (duration: {})", d.duration))
            .unwrap_or_default();
        (
            format!("{link} alert {resolved}{duration}"),
            format!("{name} alert resolved"),
        )
    } else {
        let summary = n.details.as_ref().map(|d| d.summary.as_str()).unwrap_or_default();
        (
            format!("[{}] {link}: {summary}", n.status.as_str().to_uppercase()),
            format!("{name}: {summary}"),
        )
    };
    let mut details = String::new();
    if let Some(d) = &n.details {
        if !d.rule_name.is_empty() {
            details.push_str(&format!("*Alerting rule*: {}\n", d.rule_name));
        }
        for item in &d.details {
            if item.code {
                details.push_str(&format!("*{}*:\n```{}```\n", item.name, item.value));
            } else {
                details.push_str(&format!("*{}*: {}\n", item.name, item.value));
            }
        }
    }
    message(&fallback, &header, n.status, &details)
}

fn incident_message(base_url: &str, n: &IncidentNotification) -> Value {
    let name = &n.application_id.name;
    let link = format!("<{}|*{name}*>", incident_url(base_url, n));
    let (header, fallback) = if n.status == Status::Ok {
        (format!("{link} incident resolved"), format!("{name} incident resolved"))
    } else {
        (
            format!("[{}] {link} is not meeting its SLOs", n.status.as_str().to_uppercase()),
            format!("{name} is not meeting its SLOs"),
        )
    };
    let mut details = String::new();
    if let Some(d) = &n.details {
        let mut current = "";
        for r in &d.reports {
            if r.name != current {
                details.push_str(&format!("*{}*:\n", r.name));
                current = &r.name;
            }
            details.push_str(&format!("• {}: {}\n", r.check, r.message));
        }
    }
    message(&fallback, &header, n.status, &details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AlertNotificationDetails, IncidentNotificationDetails, IncidentReport, NotificationDestination};
    use crate::model::{AlertDetail, ApplicationDeployment, ProjectId};
    use crate::notifications::tests::{app, capture_server};
    use crate::timeseries::{Duration, Time};
    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;

    fn alert(status: Status, external_key: &str) -> AlertNotification {
        AlertNotification {
            project_id: ProjectId::new("p1"),
            alert_id: 7,
            rule_id: "r1".into(),
            application_id: app(),
            status,
            destination: NotificationDestination::new(IntegrationType::Slack, "ops"),
            timestamp: Time(1000),
            sent_at: Time::ZERO,
            external_key: external_key.into(),
            details: Some(AlertNotificationDetails {
                rule_name: "Error rate".into(),
                severity: Status::Warning,
                summary: "too many errors".into(),
                details: vec![AlertDetail::code("Labels", "code=\"500\"")],
                duration: if status == Status::Ok { Duration(300) } else { Duration::ZERO },
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_alert_message() {
        let m = alert_message("https://c.io", &alert(Status::Warning, ""));
        assert_eq!(
            m["blocks"][0]["text"]["text"],
            "[WARNING] <https://c.io/p/p1/alerts?alert=7|*cart*>: too many errors"
        );
        let details = m["attachments"][0]["blocks"][0]["text"]["text"].as_str().unwrap();
        assert!(details.starts_with("*Alerting rule*: Error rate\n"));
        assert!(details.contains("```code=\"500\"```"));
        assert_eq!(m["attachments"][0]["color"], Status::Warning.color());

        let m = alert_message("https://c.io", &alert(Status::Ok, "1.1"));
        assert_eq!(
            m["blocks"][0]["text"]["text"],
            "<https://c.io/p/p1/alerts?alert=7|*cart*> alert resolved (duration: 5m)"
        );
    }

    #[test]
    fn test_incident_message_groups_reports() {
        let n = IncidentNotification {
            project_id: ProjectId::new("p1"),
            application_id: app(),
            incident_key: "k1".into(),
            status: Status::Critical,
            destination: NotificationDestination::new(IntegrationType::Slack, ""),
            timestamp: Time(1000),
            sent_at: Time::ZERO,
            external_key: String::new(),
            details: Some(IncidentNotificationDetails {
                reports: vec![
                    IncidentReport {
                        name: "SLO".into(),
                        check: "Availability".into(),
                        message: "error budget burning".into(),
                    },
                    IncidentReport {
                        name: "SLO".into(),
                        check: "Latency".into(),
                        message: "slow".into(),
                    },
                ],
            }),
        };
        let m = incident_message("", &n);
        assert_eq!(
            m["attachments"][0]["blocks"][0]["text"]["text"],
            "*SLO*:\n• Availability: error budget burning\n• Latency: slow\n"
        );
    }

    #[tokio::test]
    async fn test_thread_replies() {
        let (url, seen) = capture_server(StatusCode::OK).await;
        let slack = Slack::new(HttpClient::new(), "xoxb-1", "ops").with_api_url(&url);

        let mut open = alert(Status::Warning, "");
        slack.send_alert("", &mut open).await.unwrap();
        assert_eq!(open.external_key, "1700000000.0001");

        let mut resolved = alert(Status::Ok, &open.external_key);
        slack.send_alert("", &mut resolved).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].path, "/chat.postMessage");
        assert_eq!(seen[0].authorization, "Bearer xoxb-1");
        let first: Value = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(first["channel"], "ops");
        assert!(first.get("thread_ts").is_none());
        let reply: Value = serde_json::from_str(&seen[1].body).unwrap();
        assert_eq!(reply["thread_ts"], "1700000000.0001");
        assert_eq!(reply["reply_broadcast"], true);
    }

    #[tokio::test]
    async fn test_deployment_message_is_updated() {
        let (url, seen) = capture_server(StatusCode::OK).await;
        let slack = Slack::new(HttpClient::new(), "xoxb-1", "deploys").with_api_url(&url);
        let project = Project {
            id: ProjectId::new("p1"),
            name: "prod".into(),
            ..Default::default()
        };
        let mut ds = ApplicationDeploymentStatus {
            deployment: ApplicationDeployment {
                application_id: app(),
                name: "cart-7d9f".into(),
                started_at: Time(1_700_000_000),
                ..Default::default()
            },
            state: DeploymentState::InProgress,
            status: Status::Info,
            message: "Rollout in progress".into(),
            summary: vec![],
        };
        slack.send_deployment(&project, &mut ds).await.unwrap();
        assert_eq!(ds.deployment.notifications.slack.channel, "C42");
        assert_eq!(ds.deployment.notifications.slack.thread_ts, "1700000000.0001");

        ds.state = DeploymentState::Summary;
        ds.status = Status::Ok;
        slack.send_deployment(&project, &mut ds).await.unwrap();

        let paths: Vec<String> = seen.lock().iter().map(|c| c.path.clone()).collect();
        assert_eq!(
            paths,
            vec!["/chat.postMessage", "/chat.postMessage", "/chat.update", "/chat.postMessage"]
        );
        let last: Value = serde_json::from_str(&seen.lock()[3].body).unwrap();
        assert_eq!(last["blocks"][0]["text"]["text"], "*Summary*\nNo notable changes");
    }
}
