//! Alerting rules and the alerts they produce.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Application, ApplicationId, Labels, Status};
use crate::timeseries::{Duration, Time};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertSource {
    Check {
        check_id: String,
    },
    LogPatterns {
        #[serde(default)]
        severities: Vec<String>,
        #[serde(default)]
        min_count: Option<u32>,
        #[serde(default)]
        max_alerts_per_app: Option<usize>,
        #[serde(default)]
        evaluate_with_ai: bool,
    },
    Promql {
        expression: String,
    },
}

impl AlertSource {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertSource::Check { .. } => "check",
            AlertSource::LogPatterns { .. } => "log_patterns",
            AlertSource::Promql { .. } => "promql",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppSelector {
    #[default]
    All,
    Category {
        #[serde(default)]
        categories: Vec<String>,
    },
    Applications {
        #[serde(default)]
        application_id_patterns: Vec<String>,
    },
}

impl AppSelector {
    fn matches(&self, id: &ApplicationId, category: &str) -> bool {
        match self {
            AppSelector::All => true,
            AppSelector::Category { categories } => categories.iter().any(|c| c == category),
            AppSelector::Applications { application_id_patterns } => {
                glob_match(&id.string_without_cluster(), application_id_patterns)
            }
        }
    }
}

/// True if `s` matches any of the glob patterns; invalid patterns never match.
pub fn glob_match(s: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| {
        glob::Pattern::new(p)
            .map(|pattern| pattern.matches(s))
            .unwrap_or(false)
    })
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertTemplates {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertingRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub source: AlertSource,
    #[serde(default)]
    pub selector: AppSelector,
    #[serde(default = "default_rule_severity")]
    pub severity: Status,
    #[serde(default, with = "duration_secs")]
    pub r#for: Duration,
    #[serde(default, with = "duration_secs")]
    pub keep_firing_for: Duration,
    #[serde(default)]
    pub templates: AlertTemplates,
    #[serde(default)]
    pub notification_category: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub builtin: bool,
}

fn default_rule_severity() -> Status {
    Status::Warning
}

fn default_true() -> bool {
    true
}

/// Rule durations in config are humantime strings (`5m`) or plain seconds.
mod duration_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::timeseries::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&d.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(i64),
            Text(String),
        }
        match Raw::deserialize(d)? {
            Raw::Secs(s) => Ok(Duration(s)),
            Raw::Text(t) => humantime::parse_duration(&t)
                .map(Duration::from_std)
                .map_err(de::Error::custom),
        }
    }
}

impl AlertingRule {
    pub fn matches(&self, app: &Application) -> bool {
        self.selector.matches(&app.id, &app.category)
    }

    pub fn matches_alert(&self, alert: &Alert) -> bool {
        self.selector
            .matches(&alert.application_id, &alert.application_category)
    }

    /// UNKNOWN severity falls back to WARNING.
    pub fn effective_severity(&self) -> Status {
        if self.severity == Status::Unknown {
            Status::Warning
        } else {
            self.severity
        }
    }
}

/// Rules every project gets unless it defines a rule with the same id.
pub fn builtin_alerting_rules() -> Vec<AlertingRule> {
    let check = |id: &str, name: &str, check_id: &str, r#for: i64, keep: i64, description: &str| AlertingRule {
        id: id.to_string(),
        name: name.to_string(),
        source: AlertSource::Check {
            check_id: check_id.to_string(),
        },
        selector: AppSelector::All,
        severity: Status::Warning,
        r#for: Duration(r#for),
        keep_firing_for: Duration(keep),
        templates: AlertTemplates {
            summary: String::new(),
            description: description.to_string(),
        },
        notification_category: String::new(),
        enabled: true,
        builtin: true,
    };
    vec![
        check(
            "storage-space",
            "Low disk space",
            "StorageSpace",
            300,
            300,
            "Disk space is running low. If the volume fills up completely, the application may fail to write data.",
        ),
        check(
            "memory-oom",
            "Out of memory kills",
            "MemoryOOM",
            0,
            0,
            "Containers are being terminated by the kernel due to memory limits.",
        ),
        check(
            "instance-availability",
            "Instance availability",
            "InstanceAvailability",
            120,
            300,
            "Some application instances are unavailable. This reduces capacity and may affect service availability.",
        ),
        check(
            "instance-restarts",
            "Instance restarts",
            "InstanceRestarts",
            0,
            0,
            "Application instances are restarting frequently.",
        ),
        AlertingRule {
            id: "log-patterns".to_string(),
            name: "Error logs".to_string(),
            source: AlertSource::LogPatterns {
                severities: vec!["error".to_string(), "critical".to_string()],
                min_count: None,
                max_alerts_per_app: None,
                evaluate_with_ai: false,
            },
            selector: AppSelector::All,
            severity: Status::Warning,
            r#for: Duration::ZERO,
            keep_firing_for: Duration(30 * 60),
            templates: AlertTemplates::default(),
            notification_category: String::new(),
            enabled: true,
            builtin: true,
        },
    ]
}

/// Merges project rules over the builtin ones by id.
pub fn merge_with_builtin(rules: &[AlertingRule]) -> Vec<AlertingRule> {
    let mut res: Vec<AlertingRule> = builtin_alerting_rules()
        .into_iter()
        .filter(|b| !rules.iter().any(|r| r.id == b.id))
        .collect();
    res.extend(rules.iter().cloned());
    res
}

// ----------------------------------------------------------------------------
// Alerts
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertDetail {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub code: bool,
}

impl AlertDetail {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            code: false,
        }
    }

    pub fn code(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            code: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub fingerprint: String,
    pub rule_id: String,
    pub rule_name: String,
    pub project_id: String,
    pub application_id: ApplicationId,
    pub application_category: String,
    pub severity: Status,
    pub summary: String,
    pub details: Vec<AlertDetail>,
    pub report: String,
    pub opened_at: Time,
    pub updated_at: Time,
    pub resolved_at: Time,
    pub manually_resolved_at: Time,
    pub suppressed: bool,
    pub resolved_by: String,
    pub pattern_words: Option<String>,
}

impl Alert {
    pub fn is_resolved(&self) -> bool {
        !self.resolved_at.is_zero()
    }

    pub fn is_manually_resolved(&self) -> bool {
        !self.manually_resolved_at.is_zero()
    }

    /// Still counts against the per-app firing cap.
    pub fn is_firing(&self) -> bool {
        !self.is_resolved() && !self.is_manually_resolved() && !self.suppressed
    }

    pub fn detail(&self, name: &str) -> Option<&AlertDetail> {
        self.details.iter().find(|d| d.name == name)
    }

    pub fn duration(&self, now: Time) -> Duration {
        let end = if self.is_resolved() { self.resolved_at } else { now };
        end - self.opened_at
    }
}

/// `hex(sha256(ruleId ‖ appId ‖ k1 ‖ v1 ‖ …))[..16]` with labels in key order.
pub fn alert_fingerprint(rule_id: &str, app_id: &str, labels: &Labels) -> String {
    let mut h = Sha256::new();
    h.update(rule_id.as_bytes());
    h.update(app_id.as_bytes());
    for (k, v) in labels {
        h.update(k.as_bytes());
        h.update(v.as_bytes());
    }
    let mut res = hex::encode(h.finalize());
    res.truncate(16);
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use crate::model::ApplicationKind;

    fn app(ns: &str, name: &str, category: &str) -> Application {
        let mut app = Application::new(ApplicationId::new("c", ns, ApplicationKind::Deployment, name));
        app.category = category.to_string();
        app
    }

    #[test]
    fn test_rule_selectors() {
        let mut rule = builtin_alerting_rules().remove(0);
        assert!(rule.matches(&app("default", "api", "application")));

        rule.selector = AppSelector::Category {
            categories: vec!["databases".into()],
        };
        assert!(!rule.matches(&app("default", "api", "application")));
        assert!(rule.matches(&app("default", "pg", "databases")));

        rule.selector = AppSelector::Applications {
            application_id_patterns: vec!["default:Deployment:*".into(), "[".into()],
        };
        assert!(rule.matches(&app("default", "api", "")));
        assert!(!rule.matches(&app("kube-system", "dns", "")));
    }

    #[test]
    fn test_rule_from_toml() {
        let rule: AlertingRule = toml::from_str(
            r#"
            id = "high-latency"
            name = "High latency"
            for = "5m"
            keep_firing_for = 60
            source = { type = "promql", expression = "histogram_quantile(0.99, rate(x[5m])) > 1" }
            selector = { type = "applications", application_id_patterns = ["*:Deployment:api"] }
            "#,
        )
        .unwrap();
        assert_eq!(rule.r#for, Duration(300));
        assert_eq!(rule.keep_firing_for, Duration(60));
        assert_eq!(rule.severity, Status::Warning);
        assert!(rule.enabled);
        assert_eq!(rule.source.kind(), "promql");
    }

    #[test]
    fn test_merge_with_builtin() {
        let mut own = builtin_alerting_rules().remove(0);
        own.enabled = false;
        let merged = merge_with_builtin(&[own]);
        assert_eq!(merged.len(), builtin_alerting_rules().len());
        assert!(!merged.iter().find(|r| r.id == "storage-space").unwrap().enabled);
    }

    #[test]
    fn test_fingerprint_length() {
        let fp = alert_fingerprint("rule", "c:ns:Deployment:app", &Labels::new());
        assert_eq!(fp.len(), 16);
        assert_ne!(fp, alert_fingerprint("rule", "c:ns:Deployment:app2", &Labels::new()));
    }

    proptest! {
        #[test]
        fn test_fingerprint_is_permutation_stable(pairs in proptest::collection::vec(("[a-z]{1,5}", "[a-z0-9]{0,5}"), 0..8)) {
            let forward: Labels = pairs.iter().cloned().collect();
            let reversed: Labels = pairs.iter().rev().cloned().collect();
            // Later duplicates win in both directions only when keys are unique.
            prop_assume!(forward == reversed);
            prop_assert_eq!(
                alert_fingerprint("r", "a", &forward),
                alert_fingerprint("r", "a", &reversed)
            );
        }
    }
}
