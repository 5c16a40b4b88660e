//! Rollout detection for Kubernetes deployments.
//!
//! A rollout is read off the replica sets alive at each sample: the walk
//! remembers the last stable replica set, opens a deployment as soon as a
//! second one appears and closes it once the new one is alone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::constants::{
    DEPLOYMENT_METRICS_SHIFT, DEPLOYMENT_METRICS_WINDOW, DEPLOYMENT_NOTIFICATION_WINDOW, DEPLOYMENT_STUCK_AFTER,
};
use crate::db::Db;
use crate::model::deployment::{calc_summary, DeploymentDetails, DeploymentNotifications};
use crate::model::world::Severity;
use crate::model::{
    Application, ApplicationDeployment, ApplicationDeploymentStatus, ApplicationId, DeploymentState, IntegrationType,
    MetricsSnapshot, NotificationKind, Project, Status, World,
};
use crate::notifications::Notifier;
use crate::timeseries::{defined, nan_sum, zero_to_nan, Aggregate, Duration, LinearRegression, Time, TimeSeries};

type Known = BTreeMap<ApplicationId, Vec<ApplicationDeployment>>;

pub struct DeploymentWatcher {
    db: Arc<Db>,
    notifier: Arc<Notifier>,
}

impl DeploymentWatcher {
    pub fn new(db: Arc<Db>, notifier: Arc<Notifier>) -> Self {
        Self { db, notifier }
    }

    pub async fn check(&self, project: &Project, world: &World) {
        let start = Instant::now();
        let mut known = match self.db.get_application_deployments(&project.id) {
            Ok(known) => known,
            Err(e) => {
                error!(target: "cerebro::watchers", project = %project.id, error = %e, "failed to load deployments");
                return;
            }
        };
        let apps = self.discover(project, world, &mut known);
        self.snapshot_metrics(project, world, &mut known);
        self.send_notifications(project, world, &mut known).await;
        info!(
            target: "cerebro::watchers",
            project = %project.id,
            apps,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "deployments checked"
        );
    }

    /// Persists new rollouts and the finish of known ones. Returns the
    /// number of deployment applications seen.
    fn discover(&self, project: &Project, world: &World, known: &mut Known) -> usize {
        let mut apps = 0;
        for app in world.applications.values().filter(|a| a.is_k8s_deployment()) {
            apps += 1;
            let saved = known.entry(app.id.clone()).or_default();
            for d in calc_deployments(app) {
                let pos = saved
                    .iter()
                    .position(|s| s.name == d.name && s.started_at == d.started_at);
                let changed = match pos {
                    None => true,
                    Some(i) => !saved[i].is_finished() && saved[i].finished_at != d.finished_at,
                };
                if !changed {
                    continue;
                }
                if let Err(e) = self.db.save_application_deployment(&project.id, &d) {
                    error!(target: "cerebro::watchers", project = %project.id, app = %app.id, error = %e, "failed to save deployment");
                    return apps;
                }
                match pos {
                    Some(i) => saved[i].finished_at = d.finished_at,
                    None => {
                        info!(target: "cerebro::watchers", project = %project.id, app = %app.id, name = %d.name, "new deployment detected");
                        saved.push(d);
                        saved.sort_by_key(|d| d.started_at);
                    }
                }
            }
        }
        apps
    }

    fn snapshot_metrics(&self, project: &Project, world: &World, known: &mut Known) {
        let now = world.ctx.to;
        for app in world.applications.values() {
            let Some(deployments) = known.get_mut(&app.id) else {
                continue;
            };
            for i in 0..deployments.len() {
                let d = &deployments[i];
                if d.metrics_snapshot.is_some() || !d.is_finished() {
                    continue;
                }
                let from = d.finished_at + DEPLOYMENT_METRICS_SHIFT;
                let to = from + DEPLOYMENT_METRICS_WINDOW;
                let next_or_now = deployments.get(i + 1).map_or(now, |next| next.started_at);
                if to > next_or_now {
                    continue;
                }
                let started_at = d.started_at;
                let snapshot = calc_metrics_snapshot(app, from, to, world.ctx.step);
                if let Err(e) = self.db.save_deployment_metrics_snapshot(&project.id, &app.id, started_at, &snapshot) {
                    error!(target: "cerebro::watchers", project = %project.id, app = %app.id, error = %e, "failed to save metrics snapshot");
                    continue;
                }
                deployments[i].metrics_snapshot = Some(snapshot);
            }
        }
    }

    /// Sends every state a rollout reaches to each integration once.
    async fn send_notifications(&self, project: &Project, world: &World, known: &mut Known) {
        let now = world.ctx.to;
        for app in world.applications.values() {
            let Some(deployments) = known.get_mut(&app.id) else {
                continue;
            };
            let destinations = project.notification_destinations(&app.category, NotificationKind::Deployment);
            if destinations.is_empty() {
                continue;
            }
            for (i, mut ds) in calc_deployment_statuses(deployments, now).into_iter().enumerate() {
                if now - ds.deployment.started_at > DEPLOYMENT_NOTIFICATION_WINDOW {
                    continue;
                }
                let state = ds.state;
                let mut changed = false;
                for (integration, channel) in &destinations {
                    match sent_state(&mut ds.deployment.notifications, *integration) {
                        None => continue,
                        Some(sent) if sent.is_some_and(|s| s >= state) => continue,
                        Some(_) => {}
                    }
                    match self.notifier.send_deployment(project, *integration, channel, &mut ds).await {
                        Ok(()) => {
                            if let Some(sent) = sent_state(&mut ds.deployment.notifications, *integration) {
                                *sent = Some(state);
                            }
                            changed = true;
                        }
                        Err(e) => {
                            warn!(target: "cerebro::watchers", project = %project.id, app = %app.id, integration = %integration, error = %e, "failed to send deployment notification");
                        }
                    }
                }
                if !changed {
                    continue;
                }
                deployments[i].notifications = ds.deployment.notifications.clone();
                if let Err(e) = self.db.save_deployment_notifications(&project.id, &deployments[i]) {
                    error!(target: "cerebro::watchers", project = %project.id, app = %app.id, error = %e, "failed to save deployment notifications");
                }
            }
        }
    }
}

fn sent_state(n: &mut DeploymentNotifications, integration: IntegrationType) -> Option<&mut Option<DeploymentState>> {
    match integration {
        IntegrationType::Slack => Some(&mut n.slack.state),
        IntegrationType::Teams => Some(&mut n.teams),
        IntegrationType::Webhook => Some(&mut n.webhook),
        IntegrationType::Pagerduty | IntegrationType::Opsgenie => None,
    }
}

// ----------------------------------------------------------------------------
// Detection
// ----------------------------------------------------------------------------

pub fn calc_deployments(app: &Application) -> Vec<ApplicationDeployment> {
    if !app.is_k8s_deployment() || app.instances.is_empty() {
        return Vec::new();
    }

    let mut life_spans: BTreeMap<&str, Aggregate> = BTreeMap::new();
    let mut images: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for instance in &app.instances {
        let Some(pod) = instance.pod.as_ref().filter(|p| !p.replica_set.is_empty()) else {
            continue;
        };
        let rs = pod.replica_set.as_str();
        let agg = life_spans.entry(rs).or_insert_with(|| Aggregate::new(nan_sum));
        if let Some(ts) = &pod.life_span {
            agg.add(ts);
        }
        let rs_images = images.entry(rs).or_default();
        for c in &instance.containers {
            if !c.image.is_empty() {
                rs_images.insert(c.image.clone());
            }
        }
    }

    let series: Vec<(&str, TimeSeries)> = life_spans
        .iter()
        .filter_map(|(name, agg)| agg.get().map(|ts| (*name, ts)))
        .collect();
    let Some((_, first)) = series.first() else {
        return Vec::new();
    };
    let len = series.iter().map(|(_, ts)| ts.len()).min().unwrap_or(0);
    let (from, step) = (first.from(), first.step());

    let mut deployments: Vec<ApplicationDeployment> = Vec::new();
    let mut in_progress: Option<usize> = None;
    let mut prev = "";
    for i in 0..len {
        // names come out sorted since the map is ordered
        let names: Vec<&str> = series
            .iter()
            .filter(|(_, ts)| ts.data()[i] > 0.0)
            .map(|(name, _)| *name)
            .collect();
        let t = from + step * i as i64;
        match names.as_slice() {
            [] => {}
            [curr] => {
                if prev.is_empty() {
                    prev = *curr;
                    continue;
                }
                if let Some(idx) = in_progress.take() {
                    if deployments[idx].name == *curr {
                        deployments[idx].finished_at = t;
                    }
                }
                if prev == *curr {
                    continue;
                }
                deployments.push(ApplicationDeployment {
                    application_id: app.id.clone(),
                    name: curr.to_string(),
                    started_at: t,
                    finished_at: t,
                    ..Default::default()
                });
                prev = *curr;
            }
            _ => {
                if prev.is_empty() || in_progress.is_some() {
                    continue;
                }
                let name = names.iter().find(|n| **n != prev).copied().unwrap_or_default();
                deployments.push(ApplicationDeployment {
                    application_id: app.id.clone(),
                    name: name.to_string(),
                    started_at: t,
                    ..Default::default()
                });
                in_progress = Some(deployments.len() - 1);
                prev = name;
            }
        }
    }

    for d in &mut deployments {
        if let Some(images) = images.get(d.name.as_str()) {
            d.details = DeploymentDetails {
                container_images: images.iter().cloned().collect(),
            };
        }
    }
    deployments
}

// ----------------------------------------------------------------------------
// Metrics snapshot
// ----------------------------------------------------------------------------

fn sum(ts: Option<&TimeSeries>, from: Time, to: Time) -> f32 {
    ts.map_or(0.0, |ts| {
        ts.iter()
            .filter(|(t, v)| *t >= from && *t <= to && !v.is_nan())
            .map(|(_, v)| v)
            .sum()
    })
}

/// Integral of a per-second rate over `[from, to]`.
fn sum_rate(ts: Option<&TimeSeries>, from: Time, to: Time, step: Duration) -> f32 {
    sum(ts, from, to) * step.as_f32()
}

fn bucket_key(le: f32) -> String {
    if le.is_infinite() {
        return "+Inf".to_string();
    }
    format!("{le:.3}")
}

pub fn calc_metrics_snapshot(app: &Application, from: Time, to: Time, step: Duration) -> MetricsSnapshot {
    let mut ms = MetricsSnapshot {
        timestamp: to,
        duration: to - from,
        ..Default::default()
    };
    if let Some(sli) = app.availability_slis.first() {
        ms.requests = sum_rate(sli.total_requests.as_ref(), from, to, step) as i64;
        ms.errors = sum_rate(sli.failed_requests.as_ref(), from, to, step) as i64;
    }
    if let Some(sli) = app.latency_slis.first() {
        for b in &sli.histogram {
            ms.latency
                .insert(bucket_key(b.le), sum_rate(Some(&b.time_series), from, to, step) as i64);
        }
    }

    let mut cpu = Aggregate::new(nan_sum);
    let mut memory = Aggregate::new(nan_sum);
    let mut oom_kills = Aggregate::new(nan_sum);
    let mut restarts = Aggregate::new(nan_sum);
    let mut log_errors = Aggregate::new(nan_sum);
    let mut log_warnings = Aggregate::new(nan_sum);

    for (severity, msgs) in &app.log_messages {
        let Some(messages) = &msgs.messages else {
            continue;
        };
        match severity {
            Severity::Critical | Severity::Error => {
                log_errors.add(messages);
            }
            Severity::Warning => {
                log_warnings.add(messages);
            }
            _ => {}
        }
    }
    for c in app.instances.iter().flat_map(|i| &i.containers) {
        let pairs = [
            (&mut cpu, &c.cpu_usage),
            (&mut memory, &c.memory_rss),
            (&mut restarts, &c.restarts),
            (&mut oom_kills, &c.oom_kills),
        ];
        for (agg, ts) in pairs {
            if let Some(ts) = ts {
                agg.add(ts);
            }
        }
    }

    ms.cpu_usage = sum_rate(cpu.get().as_ref(), from, to, step);
    if let Some(total) = memory.get() {
        if let Some(lr) = LinearRegression::new(&total.map(zero_to_nan)) {
            let s = lr.calc(from - Duration::HOUR);
            let e = lr.calc(from);
            if s > 0.0 && e > 0.0 {
                ms.memory_leak_percent = ((e - s) / s * 100.0) as i64;
            }
        }
        let s = total.reduce(nan_sum);
        let c = total.map(defined).reduce(nan_sum);
        if c > 0.0 && s > 0.0 {
            ms.memory_usage = s / c;
        }
    }
    ms.oom_kills = sum(oom_kills.get().as_ref(), from, to) as i64;
    ms.restarts = sum(restarts.get().as_ref(), from, to) as i64;
    ms.log_errors = sum(log_errors.get().as_ref(), from, to) as i64;
    ms.log_warnings = sum(log_warnings.get().as_ref(), from, to) as i64;
    ms
}

// ----------------------------------------------------------------------------
// Statuses
// ----------------------------------------------------------------------------

/// One status per deployment, in the same order. `deployments` must be
/// sorted by start time.
pub fn calc_deployment_statuses(deployments: &[ApplicationDeployment], now: Time) -> Vec<ApplicationDeploymentStatus> {
    deployments
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let superseded = i + 1 < deployments.len();
            let (state, status, message, summary) = if !d.is_finished() {
                let age = now - d.started_at;
                if superseded {
                    (DeploymentState::Cancelled, Status::Info, "the rollout was cancelled".to_string(), Vec::new())
                } else if age < DEPLOYMENT_STUCK_AFTER {
                    (DeploymentState::InProgress, Status::Info, "the rollout is in progress".to_string(), Vec::new())
                } else {
                    (
                        DeploymentState::Stuck,
                        Status::Warning,
                        format!("the rollout has been in progress for {age}"),
                        Vec::new(),
                    )
                }
            } else {
                match &d.metrics_snapshot {
                    None => (
                        DeploymentState::InProgress,
                        Status::Info,
                        "collecting metrics after the rollout".to_string(),
                        Vec::new(),
                    ),
                    Some(snapshot) => {
                        let prev = i.checked_sub(1).and_then(|p| deployments[p].metrics_snapshot.as_ref());
                        let summary = calc_summary(snapshot, prev);
                        let status = if summary.iter().any(|s| !s.ok) { Status::Warning } else { Status::Ok };
                        (DeploymentState::Summary, status, "deployed".to_string(), summary)
                    }
                }
            };
            ApplicationDeploymentStatus {
                deployment: d.clone(),
                state,
                status,
                message,
                summary,
            }
        })
        .collect()
}
