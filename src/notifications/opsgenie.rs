//! Opsgenie Alert API client. Alerts are created and closed by alias, the
//! alias being the external key of the notification.

use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::{alert_display_name, alert_url, check_response, incident_url, request_error, SOURCE};
use crate::db::{AlertNotification, IncidentNotification};
use crate::error::NotificationError;
use crate::model::{IntegrationType, Status};

const API_URL: &str = "https://api.opsgenie.com";
const API_URL_EU: &str = "https://api.eu.opsgenie.com";

pub struct Opsgenie {
    http: HttpClient,
    api_url: String,
    api_key: String,
}

impl Opsgenie {
    pub fn new(http: HttpClient, api_key: &str, eu_instance: bool) -> Self {
        Self {
            http,
            api_url: if eu_instance { API_URL_EU } else { API_URL }.to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn with_api_url(mut self, url: &str) -> Self {
        self.api_url = url.trim_end_matches('/').to_string();
        self
    }

    async fn post(&self, path: &str, body: Value) -> Result<(), NotificationError> {
        let resp = self
            .http
            .post(format!("{}{path}", self.api_url))
            .header("Authorization", format!("GenieKey {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(IntegrationType::Opsgenie, e))?;
        check_response(IntegrationType::Opsgenie, resp).await?;
        Ok(())
    }

    async fn close(&self, alias: &str) -> Result<(), NotificationError> {
        let alias: String = url::form_urlencoded::byte_serialize(alias.as_bytes()).collect();
        self.post(
            &format!("/v2/alerts/{alias}/close?identifierType=alias"),
            json!({"source": SOURCE}),
        )
        .await
    }

    async fn create(&self, alias: &str, message: &str, status: Status, description: String) -> Result<(), NotificationError> {
        let mut body = json!({
            "message": message,
            "alias": alias,
            "source": SOURCE,
            "description": description,
        });
        if let Some(p) = priority(status) {
            body["priority"] = json!(p);
        }
        self.post("/v2/alerts", body).await
    }

    pub async fn send_alert(&self, base_url: &str, n: &mut AlertNotification) -> Result<(), NotificationError> {
        if n.status == Status::Ok {
            return self.close(&n.external_key).await;
        }
        let summary = n.details.as_ref().map(|d| d.summary.as_str()).unwrap_or_default();
        let message = format!("[{}] {}: {summary}", n.status.as_str().to_uppercase(), alert_display_name(n));
        let mut description = String::new();
        if let Some(d) = &n.details {
            for item in &d.details {
                description.push_str(&format!("• {}: {}\n", item.name, item.value));
            }
        }
        description.push_str(&format!("\n{}", alert_url(base_url, n)));
        self.create(&n.external_key, &message, n.status, description).await
    }

    pub async fn send_incident(&self, base_url: &str, n: &mut IncidentNotification) -> Result<(), NotificationError> {
        if n.status == Status::Ok {
            return self.close(&n.external_key).await;
        }
        let message = format!(
            "[{}] {} is not meeting its SLOs",
            n.status.as_str().to_uppercase(),
            n.application_id.name
        );
        let mut description: String = n
            .details
            .iter()
            .flat_map(|d| &d.reports)
            .map(|r| format!("• {} / {}: {}\n", r.name, r.check, r.message))
            .collect();
        description.push_str(&format!("\n{}", incident_url(base_url, n)));
        self.create(&n.external_key, &message, n.status, description).await
    }
}

fn priority(s: Status) -> Option<&'static str> {
    match s {
        Status::Critical => Some("P2"),
        Status::Warning => Some("P3"),
        Status::Info => Some("P4"),
        _ => None,
    }
}
