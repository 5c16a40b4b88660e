//! PagerDuty Events API v2 client. The external key is the dedup key, so a
//! resolve event closes exactly the incident its trigger opened.

use std::collections::BTreeMap;

use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::{alert_display_name, alert_url, check_response, incident_url, request_error, SOURCE};
use crate::db::{AlertNotification, IncidentNotification};
use crate::error::NotificationError;
use crate::model::{IntegrationType, Status};
use crate::timeseries::Time;

const EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

pub struct Pagerduty {
    http: HttpClient,
    events_url: String,
    integration_key: String,
}

impl Pagerduty {
    pub fn new(http: HttpClient, integration_key: &str) -> Self {
        Self {
            http,
            events_url: EVENTS_URL.to_string(),
            integration_key: integration_key.to_string(),
        }
    }

    pub fn with_events_url(mut self, url: &str) -> Self {
        self.events_url = url.to_string();
        self
    }

    async fn enqueue(&self, event: Value) -> Result<(), NotificationError> {
        let resp = self
            .http
            .post(&self.events_url)
            .json(&event)
            .send()
            .await
            .map_err(|e| request_error(IntegrationType::Pagerduty, e))?;
        check_response(IntegrationType::Pagerduty, resp).await?;
        Ok(())
    }

    pub async fn send_alert(&self, base_url: &str, n: &mut AlertNotification) -> Result<(), NotificationError> {
        let event = if n.status == Status::Ok {
            self.resolve_event(&n.external_key)
        } else {
            let summary = n.details.as_ref().map(|d| d.summary.as_str()).unwrap_or_default();
            let details: BTreeMap<&str, &str> = n
                .details
                .iter()
                .flat_map(|d| &d.details)
                .map(|d| (d.name.as_str(), d.value.as_str()))
                .collect();
            self.trigger_event(
                &n.external_key,
                &format!("[{}] {}: {summary}", upper(n.status), alert_display_name(n)),
                n.status,
                n.timestamp,
                &alert_url(base_url, n),
                details,
            )
        };
        self.enqueue(event).await
    }

    pub async fn send_incident(&self, base_url: &str, n: &mut IncidentNotification) -> Result<(), NotificationError> {
        let event = if n.status == Status::Ok {
            self.resolve_event(&n.external_key)
        } else {
            let details: BTreeMap<String, &str> = n
                .details
                .iter()
                .flat_map(|d| &d.reports)
                .map(|r| (format!("{} / {}", r.name, r.check), r.message.as_str()))
                .collect();
            self.trigger_event(
                &n.external_key,
                &format!("[{}] {} is not meeting its SLOs", upper(n.status), n.application_id.name),
                n.status,
                n.timestamp,
                &incident_url(base_url, n),
                details,
            )
        };
        self.enqueue(event).await
    }

    fn resolve_event(&self, dedup_key: &str) -> Value {
        json!({
            "routing_key": self.integration_key,
            "dedup_key": dedup_key,
            "event_action": "resolve",
        })
    }

    fn trigger_event<K: serde::Serialize + Ord>(
        &self,
        dedup_key: &str,
        summary: &str,
        status: Status,
        timestamp: Time,
        url: &str,
        details: BTreeMap<K, &str>,
    ) -> Value {
        let mut payload = json!({
            "summary": summary,
            "source": SOURCE,
            "severity": severity(status),
            "timestamp": timestamp.to_datetime().to_rfc3339(),
        });
        if !details.is_empty() {
            payload["custom_details"] = json!(details);
        }
        json!({
            "routing_key": self.integration_key,
            "dedup_key": dedup_key,
            "event_action": "trigger",
            "client": SOURCE,
            "client_url": url,
            "payload": payload,
        })
    }
}

fn upper(s: Status) -> String {
    s.as_str().to_uppercase()
}

/// PagerDuty accepts critical, error, warning and info.
fn severity(s: Status) -> &'static str {
    match s {
        Status::Critical => "critical",
        Status::Warning => "warning",
        _ => "info",
    }
}
