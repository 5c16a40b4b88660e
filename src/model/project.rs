//! Projects (tenants), their integrations and notification routing.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use super::{alerting::glob_match, AlertingRule, ApplicationId, ProjectId};
use crate::timeseries::Duration;

pub const DEFAULT_CATEGORY: &str = "application";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrometheusIntegration {
    pub url: String,
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: std::time::Duration,
    #[serde(default)]
    pub tls_skip_verify: bool,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default)]
    pub extra_selector: String,
    #[serde(default)]
    pub custom_headers: Vec<Header>,
    #[serde(default)]
    pub remote_write_url: String,
}

fn default_refresh_interval() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

impl PrometheusIntegration {
    pub fn step(&self) -> Duration {
        let step = Duration::from_std(self.refresh_interval);
        if step.0 <= 0 {
            return Duration(30);
        }
        step
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackIntegration {
    pub token: String,
    pub default_channel: String,
    #[serde(default)]
    pub incidents: bool,
    #[serde(default)]
    pub deployments: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamsIntegration {
    pub webhook_url: String,
    #[serde(default)]
    pub incidents: bool,
    #[serde(default)]
    pub deployments: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PagerdutyIntegration {
    pub integration_key: String,
    #[serde(default)]
    pub incidents: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OpsgenieIntegration {
    pub api_key: String,
    #[serde(default)]
    pub eu_instance: bool,
    #[serde(default)]
    pub incidents: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookIntegration {
    pub url: String,
    #[serde(default)]
    pub tls_skip_verify: bool,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default)]
    pub custom_headers: Vec<Header>,
    #[serde(default)]
    pub incidents: bool,
    #[serde(default)]
    pub deployments: bool,
    #[serde(default)]
    pub alerts: bool,
    #[serde(default)]
    pub incident_template: String,
    #[serde(default)]
    pub deployment_template: String,
    #[serde(default)]
    pub alert_template: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Integrations {
    /// External UI address used in notification links.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub slack: Option<SlackIntegration>,
    #[serde(default)]
    pub teams: Option<TeamsIntegration>,
    #[serde(default)]
    pub pagerduty: Option<PagerdutyIntegration>,
    #[serde(default)]
    pub opsgenie: Option<OpsgenieIntegration>,
    #[serde(default)]
    pub webhook: Option<WebhookIntegration>,
}

/// Notification destination kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationType {
    Slack,
    Teams,
    Pagerduty,
    Opsgenie,
    Webhook,
}

impl IntegrationType {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationType::Slack => "slack",
            IntegrationType::Teams => "teams",
            IntegrationType::Pagerduty => "pagerduty",
            IntegrationType::Opsgenie => "opsgenie",
            IntegrationType::Webhook => "webhook",
        }
    }
}

impl std::fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ALL_INTEGRATIONS: [IntegrationType; 5] = [
    IntegrationType::Slack,
    IntegrationType::Teams,
    IntegrationType::Pagerduty,
    IntegrationType::Opsgenie,
    IntegrationType::Webhook,
];

/// What a notification is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Incident,
    Alert,
    Deployment,
}

impl Integrations {
    /// Whether integration `t` is configured and accepts notifications of
    /// `kind`. Paging integrations never receive deployments.
    pub fn allows(&self, t: IntegrationType, kind: NotificationKind) -> bool {
        use NotificationKind::*;
        match t {
            IntegrationType::Slack => self.slack.as_ref().is_some_and(|c| match kind {
                Incident => c.incidents,
                Alert => true,
                Deployment => c.deployments,
            }),
            IntegrationType::Teams => self.teams.as_ref().is_some_and(|c| match kind {
                Incident => c.incidents,
                Alert => true,
                Deployment => c.deployments,
            }),
            IntegrationType::Pagerduty => self.pagerduty.as_ref().is_some_and(|c| match kind {
                Incident => c.incidents,
                Alert => true,
                Deployment => false,
            }),
            IntegrationType::Opsgenie => self.opsgenie.as_ref().is_some_and(|c| match kind {
                Incident => c.incidents,
                Alert => true,
                Deployment => false,
            }),
            IntegrationType::Webhook => self.webhook.as_ref().is_some_and(|c| match kind {
                Incident => c.incidents,
                Alert => c.alerts,
                Deployment => c.deployments,
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Application categories
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackDestination {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub channel: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationDestinations {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub slack: Option<SlackDestination>,
    #[serde(default)]
    pub teams: Option<Destination>,
    #[serde(default)]
    pub pagerduty: Option<Destination>,
    #[serde(default)]
    pub opsgenie: Option<Destination>,
    #[serde(default)]
    pub webhook: Option<Destination>,
}

impl NotificationDestinations {
    /// The explicit entry of one integration: `(enabled, slack channel)`.
    fn entry(&self, t: IntegrationType) -> Option<(bool, &str)> {
        match t {
            IntegrationType::Slack => self.slack.as_ref().map(|s| (s.enabled, s.channel.as_str())),
            IntegrationType::Teams => self.teams.as_ref().map(|d| (d.enabled, "")),
            IntegrationType::Pagerduty => self.pagerduty.as_ref().map(|d| (d.enabled, "")),
            IntegrationType::Opsgenie => self.opsgenie.as_ref().map(|d| (d.enabled, "")),
            IntegrationType::Webhook => self.webhook.as_ref().map(|d| (d.enabled, "")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryNotificationSettings {
    #[serde(default)]
    pub incidents: NotificationDestinations,
    /// Alert routing; falls back to `incidents` when not configured.
    #[serde(default)]
    pub alerts: Option<NotificationDestinations>,
    #[serde(default)]
    pub deployments: NotificationDestinations,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationCategorySettings {
    /// Globs over `namespace/name`.
    #[serde(default)]
    pub custom_patterns: Vec<String>,
    #[serde(default)]
    pub notification_settings: CategoryNotificationSettings,
}

// ----------------------------------------------------------------------------
// Project
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub prometheus: Option<PrometheusIntegration>,
    #[serde(default)]
    pub integrations: Integrations,
    #[serde(default)]
    pub application_categories: BTreeMap<String, ApplicationCategorySettings>,
    #[serde(default)]
    pub alerting_rules: Vec<AlertingRule>,
    /// Extra PromQL expressions the cache keeps back-filled.
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub recording_rules: Vec<String>,
}

impl Project {
    /// Category of an application: the first custom pattern match in name
    /// order, otherwise the default category.
    pub fn calc_application_category(&self, app_id: &ApplicationId) -> String {
        let id = format!("{}/{}", app_id.namespace, app_id.name);
        self.application_categories
            .iter()
            .find(|(_, s)| glob_match(&id, &s.custom_patterns))
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
    }

    pub fn category_settings(&self, category: &str) -> Option<&ApplicationCategorySettings> {
        self.application_categories.get(category)
    }

    /// Effective destinations of a category. Integrations without an
    /// explicit entry are enabled by default (deployments only for the
    /// default category); an empty slack channel means the default channel.
    pub fn notification_destinations(&self, category: &str, kind: NotificationKind) -> Vec<(IntegrationType, String)> {
        let configured = self.category_settings(category).map(|s| {
            let n = &s.notification_settings;
            match kind {
                NotificationKind::Incident => &n.incidents,
                NotificationKind::Alert => n.alerts.as_ref().unwrap_or(&n.incidents),
                NotificationKind::Deployment => &n.deployments,
            }
        });
        let default_on = kind != NotificationKind::Deployment || category == DEFAULT_CATEGORY;
        let mut res = Vec::new();
        for t in ALL_INTEGRATIONS {
            if !self.integrations.allows(t, kind) {
                continue;
            }
            let (enabled, channel) = match configured.and_then(|d| d.entry(t).map(|e| (d.enabled, e))) {
                Some((all, (enabled, channel))) => (all && enabled, channel),
                None => (default_on, ""),
            };
            if !enabled {
                continue;
            }
            let channel = match (&self.integrations.slack, t) {
                (Some(slack), IntegrationType::Slack) if channel.is_empty() => slack.default_channel.clone(),
                _ => channel.to_string(),
            };
            res.push((t, channel));
        }
        res
    }

    pub fn has_api_key(&self, key: &str) -> bool {
        self.api_keys.iter().any(|k| k == key)
    }
}

/// Lock-free snapshot of the configured projects.
#[derive(Debug)]
pub struct ProjectRegistry {
    projects: ArcSwap<Vec<Arc<Project>>>,
}

impl ProjectRegistry {
    pub fn new(projects: Vec<Project>) -> Self {
        Self {
            projects: ArcSwap::from_pointee(projects.into_iter().map(Arc::new).collect()),
        }
    }

    pub fn replace(&self, projects: Vec<Project>) {
        self.projects
            .store(Arc::new(projects.into_iter().map(Arc::new).collect()));
    }

    pub fn list(&self) -> Arc<Vec<Arc<Project>>> {
        self.projects.load_full()
    }

    pub fn get(&self, id: &ProjectId) -> Option<Arc<Project>> {
        self.projects.load().iter().find(|p| &p.id == id).cloned()
    }
}
