use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ApplicationId, Status};
use crate::timeseries::{Duration, Time};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDetails {
    pub container_images: Vec<String>,
}

/// Aggregates collected over a window after a rollout finished.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: Time,
    pub duration: Duration,

    pub requests: i64,
    pub errors: i64,
    /// Requests per histogram bucket, keyed by `le` formatted with 3 decimals.
    pub latency: BTreeMap<String, i64>,

    pub restarts: i64,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub memory_leak_percent: i64,
    pub oom_kills: i64,
    pub log_errors: i64,
    pub log_warnings: i64,
}

/// Lifecycle state reported to notification integrations, ordered by progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    InProgress,
    Stuck,
    Cancelled,
    Summary,
}

impl DeploymentState {
    pub fn title(self) -> &'static str {
        match self {
            DeploymentState::InProgress => "In-progress",
            DeploymentState::Stuck => "Stuck",
            DeploymentState::Cancelled => "Cancelled",
            DeploymentState::Summary => "Deployed",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackDeploymentNotification {
    pub channel: String,
    pub thread_ts: String,
    pub state: Option<DeploymentState>,
}

/// Per-integration delivery state of a deployment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentNotifications {
    pub slack: SlackDeploymentNotification,
    pub teams: Option<DeploymentState>,
    pub webhook: Option<DeploymentState>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDeployment {
    pub application_id: ApplicationId,
    pub name: String,
    pub started_at: Time,
    pub finished_at: Time,
    pub details: DeploymentDetails,
    pub metrics_snapshot: Option<MetricsSnapshot>,
    pub notifications: DeploymentNotifications,
}

impl ApplicationDeployment {
    pub fn id(&self) -> String {
        self.started_at.to_string()
    }

    pub fn is_finished(&self) -> bool {
        !self.finished_at.is_zero()
    }

    /// Image tags of the rollout, or the replica set name when unknown.
    pub fn version(&self) -> String {
        let tags: Vec<&str> = self
            .details
            .container_images
            .iter()
            .map(|image| match image.rsplit_once(':') {
                Some((_, tag)) if !tag.contains('/') => tag,
                _ => image.as_str(),
            })
            .collect();
        if tags.is_empty() {
            return self.name.clone();
        }
        tags.join(", ")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SummaryItem {
    pub ok: bool,
    pub message: String,
}

impl SummaryItem {
    pub fn emoji(&self) -> &'static str {
        if self.ok {
            "🎉"
        } else {
            "💔"
        }
    }
}

/// A deployment together with what should be reported about it.
#[derive(Clone, Debug)]
pub struct ApplicationDeploymentStatus {
    pub deployment: ApplicationDeployment,
    pub state: DeploymentState,
    pub status: Status,
    pub message: String,
    pub summary: Vec<SummaryItem>,
}

/// Compares the snapshot of a deployment with the one of its predecessor.
pub fn calc_summary(curr: &MetricsSnapshot, prev: Option<&MetricsSnapshot>) -> Vec<SummaryItem> {
    let mut res = Vec::new();
    if curr.oom_kills > 0 {
        res.push(SummaryItem {
            ok: false,
            message: format!("{} OOM kills after the rollout", curr.oom_kills),
        });
    }
    if curr.restarts > 0 {
        res.push(SummaryItem {
            ok: false,
            message: format!("{} container restarts after the rollout", curr.restarts),
        });
    }
    if curr.memory_leak_percent >= 10 {
        res.push(SummaryItem {
            ok: false,
            message: format!("memory usage is growing by {}% per hour", curr.memory_leak_percent),
        });
    }
    let Some(prev) = prev else {
        return res;
    };
    let error_rate = |s: &MetricsSnapshot| {
        if s.requests > 0 {
            s.errors as f32 / s.requests as f32 * 100.0
        } else {
            0.0
        }
    };
    let (curr_er, prev_er) = (error_rate(curr), error_rate(prev));
    if curr_er > 1.0 && curr_er > prev_er * 1.2 {
        res.push(SummaryItem {
            ok: false,
            message: format!("error rate increased from {:.1}% to {:.1}%", prev_er, curr_er),
        });
    } else if prev_er > 1.0 && curr_er < prev_er * 0.8 {
        res.push(SummaryItem {
            ok: true,
            message: format!("error rate decreased from {:.1}% to {:.1}%", prev_er, curr_er),
        });
    }
    if prev.cpu_usage > 0.0 {
        let change = (curr.cpu_usage - prev.cpu_usage) / prev.cpu_usage * 100.0;
        if change >= 20.0 {
            res.push(SummaryItem {
                ok: false,
                message: format!("CPU usage increased by {:.0}%", change),
            });
        } else if change <= -20.0 {
            res.push(SummaryItem {
                ok: true,
                message: format!("CPU usage decreased by {:.0}%", -change),
            });
        }
    }
    if curr.log_errors > prev.log_errors * 2 && curr.log_errors > 10 {
        res.push(SummaryItem {
            ok: false,
            message: format!("error logs increased from {} to {}", prev.log_errors, curr.log_errors),
        });
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let mut d = ApplicationDeployment {
            name: "api-5d8f7".into(),
            ..Default::default()
        };
        assert_eq!(d.version(), "api-5d8f7");
        d.details.container_images = vec!["registry:5000/api:1.2.3".into(), "envoy".into()];
        assert_eq!(d.version(), "1.2.3, envoy");
    }

    #[test]
    fn test_summary() {
        let prev = MetricsSnapshot {
            requests: 1000,
            errors: 10,
            cpu_usage: 1.0,
            ..Default::default()
        };
        let curr = MetricsSnapshot {
            requests: 1000,
            errors: 50,
            cpu_usage: 1.5,
            oom_kills: 1,
            ..Default::default()
        };
        let items = calc_summary(&curr, Some(&prev));
        let messages: Vec<&str> = items.iter().map(|i| i.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "1 OOM kills after the rollout",
                "error rate increased from 1.0% to 5.0%",
                "CPU usage increased by 50%",
            ]
        );
        assert!(items.iter().all(|i| !i.ok));
        assert!(calc_summary(&prev, None).is_empty());
    }

    #[test]
    fn test_state_order() {
        assert!(DeploymentState::InProgress < DeploymentState::Stuck);
        assert!(DeploymentState::Cancelled < DeploymentState::Summary);
    }
}
