//! Alerting rule evaluation.
//!
//! Every tick evaluates the project rules merged over the builtin ones.
//! Rules with a `for` duration keep new fingerprints pending in memory until
//! they have been firing long enough; `keep_firing_for` delays resolution
//! counting from the last time an alert was seen firing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::constants::{
    LOG_PATTERN_MAX_ALERTS_PER_APP, LOG_PATTERN_MIN_COUNT, PENDING_ALERT_TTL, PROMQL_EVALUATION_TIMEOUT_SECS,
};
use crate::db::Db;
use crate::model::alerting::merge_with_builtin;
use crate::model::world::LOGS_REPORT;
use crate::model::{
    alert_fingerprint, Alert, AlertDetail, AlertSource, AlertingRule, Application, Context, Labels, LogPattern,
    Pattern, Project, ProjectId, Severity, Status, World,
};
use crate::notifications::Notifier;
use crate::prom::{add_extra_selector, MetricSourceFactory};
use crate::template;
use crate::timeseries::{format_value, nan_sum, Duration, Time};

pub struct AlertEvaluator {
    db: Arc<Db>,
    notifier: Arc<Notifier>,
    sources: Arc<dyn MetricSourceFactory>,
    /// First time a not yet opened fingerprint was seen firing.
    pending: HashMap<String, Time>,
    initialized: HashMap<ProjectId, bool>,
}

struct Candidate<'a> {
    app: &'a Application,
    severity: Severity,
    pattern: &'a LogPattern,
    count: f32,
}

fn keeps_firing(rule: &AlertingRule, alert: &Alert, now: Time) -> bool {
    rule.keep_firing_for > Duration::ZERO && now - alert.updated_at < rule.keep_firing_for
}

/// Category to route notifications by; none for alerts not bound to an
/// application.
fn alert_category(alert: &Alert) -> Option<&str> {
    if alert.application_id.is_zero() {
        return None;
    }
    Some(&alert.application_category)
}

fn description_details(tmpl: &str, data: &Value) -> Vec<AlertDetail> {
    if tmpl.is_empty() {
        return Vec::new();
    }
    let description = template::render_or_raw(tmpl, data);
    if description.is_empty() {
        return Vec::new();
    }
    vec![AlertDetail::new("Description", description)]
}

fn log_pattern_details(rule: &AlertingRule, lp: &LogPattern) -> Vec<AlertDetail> {
    let mut details = Vec::new();
    if !rule.templates.description.is_empty() {
        details.push(AlertDetail::new("Description", rule.templates.description.clone()));
    }
    if !lp.sample.is_empty() {
        details.push(AlertDetail::code("Sample", lp.sample.clone()));
    }
    details
}

fn pattern_fingerprint(rule_id: &str, app_id: &str, hash: &str) -> String {
    let labels = Labels::from([("ph".to_string(), hash.to_string())]);
    alert_fingerprint(rule_id, app_id, &labels)
}

impl AlertEvaluator {
    pub fn new(db: Arc<Db>, notifier: Arc<Notifier>, sources: Arc<dyn MetricSourceFactory>) -> Self {
        Self {
            db,
            notifier,
            sources,
            pending: HashMap::new(),
            initialized: HashMap::new(),
        }
    }

    pub async fn check(&mut self, project: &Project, world: &World, now: Time) {
        let start = Instant::now();
        if !self.initialized.get(&project.id).copied().unwrap_or(false) {
            match self.db.has_alerts(&project.id) {
                Ok(has) => {
                    self.initialized.insert(project.id.clone(), has);
                }
                Err(e) => {
                    error!(target: "cerebro::watchers", project = %project.id, error = %e, "failed to check existing alerts");
                    return;
                }
            }
        }

        let mut evaluated = 0;
        for rule in merge_with_builtin(&project.alerting_rules) {
            if rule.enabled {
                match &rule.source {
                    AlertSource::Check { check_id } => {
                        for app in world.applications.values().filter(|a| rule.matches(a)) {
                            if self.evaluate_check(project, &rule, app, check_id, now).await {
                                evaluated += 1;
                            }
                        }
                    }
                    AlertSource::LogPatterns {
                        severities,
                        min_count,
                        max_alerts_per_app,
                        ..
                    } => {
                        let severities: BTreeSet<Severity> =
                            severities.iter().map(|s| s.parse().unwrap_or_default()).collect();
                        let min_count = min_count.filter(|c| *c > 0).map_or(LOG_PATTERN_MIN_COUNT, |c| c as f32);
                        let max_alerts = max_alerts_per_app
                            .filter(|m| *m > 0)
                            .unwrap_or(LOG_PATTERN_MAX_ALERTS_PER_APP);
                        let candidates = log_pattern_candidates(&rule, world, &severities, min_count);
                        evaluated += candidates.len();
                        self.evaluate_log_patterns(project, &rule, world, candidates, max_alerts, now).await;
                    }
                    AlertSource::Promql { expression } => {
                        if !expression.trim().is_empty() {
                            evaluated += self.evaluate_promql(project, &rule, expression, world.ctx, now).await;
                        }
                    }
                }
            }
            self.resolve_non_matching(project, &rule, now).await;
        }
        self.cleanup_pending(now);

        info!(
            target: "cerebro::watchers",
            project = %project.id,
            evaluated,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "alerts evaluated"
        );
    }

    /// Whether a new alert for `fingerprint` may open now. Records the first
    /// sighting otherwise.
    fn pending_elapsed(&mut self, fingerprint: &str, r#for: Duration, now: Time) -> bool {
        if r#for > Duration::ZERO {
            match self.pending.get(fingerprint) {
                None => {
                    self.pending.insert(fingerprint.to_string(), now);
                    return false;
                }
                Some(first_seen) if now - *first_seen < r#for => return false,
                Some(_) => {}
            }
        }
        self.pending.remove(fingerprint);
        true
    }

    fn cleanup_pending(&mut self, now: Time) {
        self.pending.retain(|_, first_seen| now - *first_seen <= PENDING_ALERT_TTL);
    }

    async fn create(&self, project: &Project, rule: &AlertingRule, mut alert: Alert, now: Time) -> Option<Alert> {
        if let Err(e) = self.db.create_alert(&project.id, &mut alert) {
            error!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, error = %e, "failed to create alert");
            return None;
        }
        debug!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, alert_id = alert.id, "alert opened");
        if alert.is_firing() {
            self.notifier
                .enqueue_alert(project, alert_category(&alert), &alert, rule, now)
                .await;
        }
        Some(alert)
    }

    fn update(&self, project: &Project, alert: &Alert) {
        if let Err(e) = self.db.update_alert(&project.id, alert) {
            error!(target: "cerebro::watchers", project = %project.id, alert_id = alert.id, error = %e, "failed to update alert");
        }
    }

    /// Resolves the alert; operators already know about manually resolved
    /// ones, so those are not announced again.
    async fn resolve(&self, project: &Project, rule: &AlertingRule, mut alert: Alert, now: Time) {
        if let Err(e) = self.db.resolve_alert(&project.id, alert.id, now) {
            error!(target: "cerebro::watchers", project = %project.id, alert_id = alert.id, error = %e, "failed to resolve alert");
            return;
        }
        alert.resolved_at = now;
        debug!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, alert_id = alert.id, "alert resolved");
        if !alert.is_manually_resolved() {
            self.notifier
                .enqueue_alert(project, alert_category(&alert), &alert, rule, now)
                .await;
        }
    }

    // ------------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------------

    /// Returns false when the application has no such check.
    async fn evaluate_check(
        &mut self,
        project: &Project,
        rule: &AlertingRule,
        app: &Application,
        check_id: &str,
        now: Time,
    ) -> bool {
        let Some((report, check)) = app.find_check(check_id) else {
            return false;
        };
        let fingerprint = alert_fingerprint(&rule.id, &app.id.to_string(), &Labels::new());
        let firing = check.is_firing();
        let existing = match self.db.get_active_alert(&project.id, &fingerprint) {
            Ok(existing) => existing,
            Err(e) => {
                error!(target: "cerebro::watchers", project = %project.id, error = %e, "failed to load alert");
                return true;
            }
        };

        if existing.as_ref().is_some_and(|a| a.suppressed) {
            if !firing {
                if let Err(e) = self.db.clear_suppression(&project.id, &fingerprint) {
                    error!(target: "cerebro::watchers", project = %project.id, error = %e, "failed to clear suppression");
                }
            }
            return true;
        }

        if !firing {
            self.pending.remove(&fingerprint);
            if let Some(alert) = existing {
                if !keeps_firing(rule, &alert, now) {
                    self.resolve(project, rule, alert, now).await;
                }
            }
            return true;
        }

        let data = json!({
            "app": app.id.name,
            "namespace": app.id.namespace,
            "check_title": check.title,
            "check_message": check.message,
            "check_value": check.value.map(format_value).unwrap_or_default(),
        });
        let details = description_details(&rule.templates.description, &data);
        match existing {
            Some(mut alert) => {
                alert.severity = rule.effective_severity();
                alert.summary = check.message.clone();
                alert.details = details;
                alert.updated_at = now;
                self.update(project, &alert);
            }
            None => {
                if !self.pending_elapsed(&fingerprint, rule.r#for, now) {
                    return true;
                }
                let alert = Alert {
                    fingerprint,
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    application_id: app.id.clone(),
                    application_category: app.category.clone(),
                    severity: rule.effective_severity(),
                    summary: check.message.clone(),
                    details,
                    report: report.name.clone(),
                    opened_at: now,
                    updated_at: now,
                    ..Default::default()
                };
                self.create(project, rule, alert, now).await;
            }
        }
        true
    }

    // ------------------------------------------------------------------------
    // Log patterns
    // ------------------------------------------------------------------------

    async fn evaluate_log_patterns(
        &mut self,
        project: &Project,
        rule: &AlertingRule,
        world: &World,
        candidates: Vec<Candidate<'_>>,
        max_alerts: usize,
        now: Time,
    ) {
        if !self.initialized.get(&project.id).copied().unwrap_or(false) {
            self.init_log_pattern_alerts(project, rule, &candidates, now);
            return;
        }

        let latest = match self.db.get_latest_alerts_by_rule(&project.id, &rule.id) {
            Ok(latest) => latest,
            Err(e) => {
                error!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, error = %e, "failed to load alerts");
                return;
            }
        };
        let mut by_fingerprint: BTreeMap<String, Alert> = BTreeMap::new();
        let mut firing_by_app: HashMap<String, usize> = HashMap::new();
        for alert in latest {
            if by_fingerprint.contains_key(&alert.fingerprint) {
                continue;
            }
            if !alert.is_manually_resolved() && !alert.suppressed {
                *firing_by_app.entry(alert.application_id.to_string()).or_default() += 1;
            }
            by_fingerprint.insert(alert.fingerprint.clone(), alert);
        }

        let window = world.ctx.to - world.ctx.from;
        let mut active: HashSet<String> = HashSet::new();
        for c in candidates {
            let app_id = c.app.id.to_string();
            let fingerprint = pattern_fingerprint(&rule.id, &app_id, &c.pattern.hash);
            active.insert(fingerprint.clone());
            let summary = format!(
                "new {} in the logs ({} messages in the last {window})",
                c.severity,
                c.count.round() as i64
            );

            if let Some(blocking) = find_blocking(&rule.id, &fingerprint, &c, &by_fingerprint) {
                active.insert(blocking.clone());
                if let Some(alert) = by_fingerprint.get_mut(&blocking) {
                    if !alert.suppressed && !alert.is_manually_resolved() {
                        alert.summary = summary;
                        alert.details = log_pattern_details(rule, c.pattern);
                        alert.updated_at = now;
                        self.update(project, alert);
                    }
                }
                continue;
            }

            let firing = firing_by_app.entry(app_id).or_default();
            if *firing >= max_alerts {
                continue;
            }
            let alert = Alert {
                fingerprint: fingerprint.clone(),
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                application_id: c.app.id.clone(),
                application_category: c.app.category.clone(),
                severity: rule.effective_severity(),
                summary,
                details: log_pattern_details(rule, c.pattern),
                report: LOGS_REPORT.to_string(),
                opened_at: now,
                updated_at: now,
                pattern_words: Some(c.pattern.pattern.to_string()),
                ..Default::default()
            };
            if let Some(alert) = self.create(project, rule, alert, now).await {
                *firing += 1;
                by_fingerprint.insert(fingerprint, alert);
            }
        }

        for alert in by_fingerprint.into_values() {
            if active.contains(&alert.fingerprint) || alert.suppressed || keeps_firing(rule, &alert, now) {
                continue;
            }
            self.resolve(project, rule, alert, now).await;
        }
    }

    /// First evaluation of a project: every current pattern is recorded as
    /// already handled so that existing noise does not page anyone.
    fn init_log_pattern_alerts(&self, project: &Project, rule: &AlertingRule, candidates: &[Candidate<'_>], now: Time) {
        let mut created = 0;
        for c in candidates {
            let mut alert = Alert {
                fingerprint: pattern_fingerprint(&rule.id, &c.app.id.to_string(), &c.pattern.hash),
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                application_id: c.app.id.clone(),
                application_category: c.app.category.clone(),
                severity: rule.effective_severity(),
                summary: format!("new {} in the logs ({} messages)", c.severity, c.count.round() as i64),
                details: log_pattern_details(rule, c.pattern),
                report: LOGS_REPORT.to_string(),
                opened_at: now,
                updated_at: now,
                manually_resolved_at: now,
                resolved_by: "init".to_string(),
                pattern_words: Some(c.pattern.pattern.to_string()),
                ..Default::default()
            };
            match self.db.create_alert(&project.id, &mut alert) {
                Ok(()) => created += 1,
                Err(e) => {
                    error!(target: "cerebro::watchers", project = %project.id, error = %e, "failed to create initial log pattern alert");
                }
            }
        }
        if created > 0 {
            info!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, created, "log pattern alerts initialized");
        }
    }

    // ------------------------------------------------------------------------
    // PromQL
    // ------------------------------------------------------------------------

    /// Returns the number of series evaluated.
    async fn evaluate_promql(
        &mut self,
        project: &Project,
        rule: &AlertingRule,
        expression: &str,
        ctx: Context,
        now: Time,
    ) -> usize {
        let Some(source) = self.sources.source(project) else {
            debug!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, "no metric source for PromQL rule");
            return 0;
        };
        let query = source.query_range(expression, ctx.from, ctx.to, ctx.step);
        let results = match tokio::time::timeout(StdDuration::from_secs(PROMQL_EVALUATION_TIMEOUT_SECS), query).await {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                warn!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, error = %e, "failed to evaluate PromQL rule");
                return 0;
            }
            Err(_) => {
                warn!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, "PromQL rule evaluation timed out");
                return 0;
            }
        };

        let severity = rule.effective_severity();
        let mut active: HashSet<String> = HashSet::new();
        let mut evaluated = 0;
        for mv in &results {
            let Some((_, value)) = mv.values.last_not_nan() else {
                continue;
            };
            evaluated += 1;
            let fingerprint = alert_fingerprint(&rule.id, "", &mv.labels);
            active.insert(fingerprint.clone());
            let existing = match self.db.get_active_alert(&project.id, &fingerprint) {
                Ok(existing) => existing,
                Err(e) => {
                    error!(target: "cerebro::watchers", project = %project.id, error = %e, "failed to load alert");
                    continue;
                }
            };
            if existing.as_ref().is_some_and(|a| a.suppressed) {
                continue;
            }

            let mut data = json!({"value": value, "labels": mv.labels});
            if let Value::Object(fields) = &mut data {
                for (k, v) in &mv.labels {
                    fields.insert(k.clone(), Value::String(v.clone()));
                }
            }
            let mut summary = template::render_or_raw(&rule.templates.summary, &data);
            if summary.is_empty() {
                summary = format!("PromQL alert is firing (value: {})", format_value(value));
            }
            let details = promql_details(rule, expression, &mv.labels, &data);

            match existing {
                Some(mut alert) => {
                    alert.severity = severity;
                    alert.summary = summary;
                    alert.details = details;
                    alert.updated_at = now;
                    self.update(project, &alert);
                }
                None => {
                    if !self.pending_elapsed(&fingerprint, rule.r#for, now) {
                        continue;
                    }
                    let alert = Alert {
                        fingerprint,
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        severity,
                        summary,
                        details,
                        opened_at: now,
                        updated_at: now,
                        ..Default::default()
                    };
                    self.create(project, rule, alert, now).await;
                }
            }
        }

        let latest = match self.db.get_latest_alerts_by_rule(&project.id, &rule.id) {
            Ok(latest) => latest,
            Err(e) => {
                error!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, error = %e, "failed to load alerts");
                return evaluated;
            }
        };
        for alert in latest {
            if active.contains(&alert.fingerprint) || alert.suppressed {
                continue;
            }
            self.pending.remove(&alert.fingerprint);
            if keeps_firing(rule, &alert, now) {
                continue;
            }
            self.resolve(project, rule, alert, now).await;
        }
        evaluated
    }

    // ------------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------------

    /// Resolves open alerts of a rule that was disabled or whose selector no
    /// longer covers the application.
    async fn resolve_non_matching(&self, project: &Project, rule: &AlertingRule, now: Time) {
        let latest = match self.db.get_latest_alerts_by_rule(&project.id, &rule.id) {
            Ok(latest) => latest,
            Err(e) => {
                error!(target: "cerebro::watchers", project = %project.id, rule = %rule.id, error = %e, "failed to load alerts");
                return;
            }
        };
        for alert in latest {
            if rule.enabled && (alert.application_id.is_zero() || rule.matches_alert(&alert)) {
                continue;
            }
            self.resolve(project, rule, alert, now).await;
        }
    }
}

fn log_pattern_candidates<'a>(
    rule: &AlertingRule,
    world: &'a World,
    severities: &BTreeSet<Severity>,
    min_count: f32,
) -> Vec<Candidate<'a>> {
    let mut res = Vec::new();
    for app in world.applications.values().filter(|a| rule.matches(a)) {
        for (severity, msgs) in &app.log_messages {
            if !severities.contains(severity) {
                continue;
            }
            for pattern in msgs.patterns.values() {
                let count = pattern.messages.reduce(nan_sum);
                if count.is_nan() || count < min_count {
                    continue;
                }
                res.push(Candidate {
                    app,
                    severity: *severity,
                    pattern,
                    count,
                });
            }
        }
    }
    res
}

/// An open alert standing for the same pattern: its own fingerprint, the
/// fingerprint of a similar pattern, or an alert of the application whose
/// words nearly match.
fn find_blocking(
    rule_id: &str,
    fingerprint: &str,
    c: &Candidate<'_>,
    alerts: &BTreeMap<String, Alert>,
) -> Option<String> {
    if alerts.contains_key(fingerprint) {
        return Some(fingerprint.to_string());
    }
    let app_id = c.app.id.to_string();
    for hash in &c.pattern.similar_pattern_hashes {
        let fp = pattern_fingerprint(rule_id, &app_id, hash);
        if alerts.contains_key(&fp) {
            return Some(fp);
        }
    }
    alerts
        .values()
        .filter(|a| a.application_id == c.app.id)
        .find(|a| {
            a.pattern_words
                .as_deref()
                .is_some_and(|w| !w.is_empty() && c.pattern.pattern.weak_equal(&Pattern::new(w)))
        })
        .map(|a| a.fingerprint.clone())
}

fn promql_details(rule: &AlertingRule, expression: &str, labels: &Labels, data: &Value) -> Vec<AlertDetail> {
    let mut details = description_details(&rule.templates.description, data);
    let mut chart = expression.to_string();
    if !labels.is_empty() {
        let parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
        details.push(AlertDetail::code("Labels", parts.join("\n")));
        chart = add_extra_selector(expression, &format!("{{{}}}", parts.join(",")));
    }
    details.push(AlertDetail::code("PromQL", expression));
    details.push(AlertDetail::new("PromQLChart", chart));
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationsConfig;
    use crate::error::ObserveResult;
    use crate::model::alerting::{AlertTemplates, AppSelector};
    use crate::model::world::{AuditReport, Check, LogMessages};
    use crate::model::{ApplicationId, ApplicationKind, MetricValues, ProjectRegistry};
    use crate::prom::MetricSource;
    use crate::timeseries::TimeSeries;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    const T0: Time = Time(1_699_999_200);
    const STEP: Duration = Duration(60);

    #[derive(Default)]
    struct FakeSource {
        results: Mutex<Vec<MetricValues>>,
    }

    #[async_trait]
    impl MetricSource for FakeSource {
        async fn query_range(&self, _: &str, _: Time, _: Time, _: Duration) -> ObserveResult<Vec<MetricValues>> {
            Ok(self.results.lock().clone())
        }
    }

    struct FakeFactory(Arc<FakeSource>);

    impl MetricSourceFactory for FakeFactory {
        fn source(&self, _: &Project) -> Option<Arc<dyn MetricSource>> {
            Some(self.0.clone())
        }
    }

    fn rule(id: &str, source: AlertSource, r#for: i64, keep: i64) -> AlertingRule {
        AlertingRule {
            id: id.into(),
            name: id.into(),
            source,
            selector: AppSelector::All,
            severity: Status::Warning,
            r#for: Duration(r#for),
            keep_firing_for: Duration(keep),
            templates: AlertTemplates::default(),
            notification_category: String::new(),
            enabled: true,
            builtin: false,
        }
    }

    fn setup(rules: Vec<AlertingRule>) -> (Project, Arc<Db>, AlertEvaluator, Arc<FakeSource>) {
        let project = Project {
            id: ProjectId::new("p1"),
            name: "prod".into(),
            alerting_rules: rules,
            ..Default::default()
        };
        let db = Arc::new(Db::open_in_memory().unwrap());
        let notifier = Notifier::new(
            db.clone(),
            Arc::new(ProjectRegistry::new(vec![project.clone()])),
            NotificationsConfig::default(),
        )
        .unwrap();
        let source = Arc::new(FakeSource::default());
        let evaluator = AlertEvaluator::new(db.clone(), notifier, Arc::new(FakeFactory(source.clone())));
        (project, db, evaluator, source)
    }

    fn app_id() -> ApplicationId {
        ApplicationId::new("c1", "shop", ApplicationKind::Deployment, "cart")
    }

    fn world_with_check(status: Status) -> World {
        let mut app = Application::new(app_id());
        app.category = "application".into();
        app.reports.push(AuditReport {
            name: "CPU".into(),
            checks: vec![Check {
                id: "CPUNode".into(),
                title: "Node CPU".into(),
                status,
                message: "high cpu".into(),
                ..Default::default()
            }],
        });
        let mut w = World::new(T0, T0 + Duration::HOUR, STEP);
        w.add_application(app);
        w
    }

    fn world_with_patterns(patterns: &[(&str, &str)]) -> World {
        let mut app = Application::new(app_id());
        app.category = "application".into();
        let mut msgs = LogMessages::default();
        for (hash, text) in patterns {
            msgs.patterns.insert(
                hash.to_string(),
                LogPattern {
                    hash: hash.to_string(),
                    pattern: Pattern::new(text),
                    sample: text.to_string(),
                    messages: TimeSeries::with_value(T0, 60, STEP, 1.0),
                    similar_pattern_hashes: BTreeSet::new(),
                },
            );
        }
        app.log_messages.insert(Severity::Error, msgs);
        let mut w = World::new(T0, T0 + Duration::HOUR, STEP);
        w.add_application(app);
        w
    }

    #[tokio::test]
    async fn test_check_alert_pending_and_keep_firing() {
        let cpu = rule(
            "cpu",
            AlertSource::Check {
                check_id: "CPUNode".into(),
            },
            120,
            300,
        );
        let (project, db, mut evaluator, _) = setup(vec![cpu.clone()]);
        let fp = alert_fingerprint("cpu", &app_id().to_string(), &Labels::new());
        let at = |m: i64| T0 + Duration::MINUTE * m;

        evaluator.check(&project, &world_with_check(Status::Warning), at(0)).await;
        evaluator.check(&project, &world_with_check(Status::Warning), at(1)).await;
        assert!(db.get_active_alert(&project.id, &fp).unwrap().is_none());

        evaluator.check(&project, &world_with_check(Status::Critical), at(2)).await;
        let opened = db.get_active_alert(&project.id, &fp).unwrap().unwrap();
        assert_eq!(opened.summary, "high cpu");
        assert_eq!(opened.report, "CPU");
        assert_eq!(opened.opened_at, at(2));

        evaluator.check(&project, &world_with_check(Status::Warning), at(3)).await;
        evaluator.check(&project, &world_with_check(Status::Ok), at(4)).await;
        assert!(db.get_active_alert(&project.id, &fp).unwrap().is_some());

        evaluator.check(&project, &world_with_check(Status::Ok), at(9)).await;
        assert!(db.get_active_alert(&project.id, &fp).unwrap().is_none());
        let resolved = db.get_alert(&project.id, opened.id).unwrap().unwrap();
        assert_eq!(resolved.resolved_at, at(9));
    }

    #[tokio::test]
    async fn test_suppressed_check_alert() {
        let cpu = rule(
            "cpu",
            AlertSource::Check {
                check_id: "CPUNode".into(),
            },
            0,
            0,
        );
        let (project, db, mut evaluator, _) = setup(vec![cpu]);
        let fp = alert_fingerprint("cpu", &app_id().to_string(), &Labels::new());

        evaluator.check(&project, &world_with_check(Status::Warning), T0).await;
        let alert = db.get_active_alert(&project.id, &fp).unwrap().unwrap();
        db.suppress_alerts(&project.id, &[alert.id], "ops", T0).unwrap();

        evaluator.check(&project, &world_with_check(Status::Warning), T0 + STEP).await;
        assert!(db.get_active_alert(&project.id, &fp).unwrap().unwrap().suppressed);

        evaluator.check(&project, &world_with_check(Status::Ok), T0 + STEP * 2).await;
        assert!(!db.get_alert(&project.id, alert.id).unwrap().unwrap().suppressed);
    }

    #[tokio::test]
    async fn test_log_patterns_init_and_blocking() {
        let (project, db, mut evaluator, _) = setup(Vec::new());
        let latest = || db.get_latest_alerts_by_rule(&project.id, "log-patterns").unwrap();

        evaluator
            .check(&project, &world_with_patterns(&[("h1", "connection refused to host")]), T0)
            .await;
        let init = latest();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].resolved_by, "init");
        assert!(init[0].is_manually_resolved());
        assert_eq!(init[0].summary, "new error in the logs (60 messages)");

        let now = T0 + Duration::MINUTE;
        let world = world_with_patterns(&[
            ("h1", "connection refused to host"),
            ("h2", "connection refused to db"),
            ("h3", "disk full on device"),
        ]);
        evaluator.check(&project, &world, now).await;
        let alerts = latest();
        assert_eq!(alerts.len(), 2);
        let fresh = alerts.iter().find(|a| a.is_firing()).unwrap();
        assert_eq!(fresh.pattern_words.as_deref(), Some("disk full on device"));
        assert_eq!(fresh.summary, "new error in the logs (60 messages in the last 1h)");
        assert_eq!(fresh.report, LOGS_REPORT);
        assert_eq!(fresh.detail("Sample").map(|d| d.code), Some(true));

        // the builtin rule keeps firing for 30m after the last sighting
        evaluator.check(&project, &world_with_patterns(&[]), now + Duration::MINUTE * 10).await;
        assert_eq!(latest().len(), 2);
        evaluator.check(&project, &world_with_patterns(&[]), now + Duration::MINUTE * 31).await;
        assert!(latest().is_empty());
    }

    #[tokio::test]
    async fn test_promql_alert() {
        let mut disk = rule(
            "disk",
            AlertSource::Promql {
                expression: "disk_used_percent > 90".into(),
            },
            0,
            0,
        );
        disk.templates.summary = "disk of {{ .instance }} is almost full".into();
        let (project, db, mut evaluator, source) = setup(vec![disk]);
        let labels = Labels::from([("instance".to_string(), "n1".to_string())]);
        *source.results.lock() = vec![MetricValues::new(
            labels.clone(),
            TimeSeries::with_data(T0, STEP, vec![91.0, 95.0, f32::NAN]),
        )];
        let fp = alert_fingerprint("disk", "", &labels);

        evaluator.check(&project, &World::new(T0, T0 + STEP * 2, STEP), T0).await;
        let alert = db.get_active_alert(&project.id, &fp).unwrap().unwrap();
        assert_eq!(alert.summary, "disk of n1 is almost full");
        assert!(alert.application_id.is_zero());
        assert_eq!(alert.detail("Labels").unwrap().value, "instance=\"n1\"");
        assert_eq!(alert.detail("PromQL").unwrap().value, "disk_used_percent > 90");
        assert!(alert.detail("PromQLChart").unwrap().value.contains("instance=\"n1\""));

        source.results.lock().clear();
        evaluator.check(&project, &World::new(T0, T0 + STEP * 2, STEP), T0 + STEP).await;
        assert!(db.get_active_alert(&project.id, &fp).unwrap().is_none());
        assert_eq!(db.get_alert(&project.id, alert.id).unwrap().unwrap().resolved_at, T0 + STEP);
    }

    #[tokio::test]
    async fn test_disabled_rule_resolves_alerts() {
        let cpu = rule(
            "cpu",
            AlertSource::Check {
                check_id: "CPUNode".into(),
            },
            0,
            0,
        );
        let (mut project, db, mut evaluator, _) = setup(vec![cpu]);
        evaluator.check(&project, &world_with_check(Status::Warning), T0).await;
        assert_eq!(db.get_latest_alerts_by_rule(&project.id, "cpu").unwrap().len(), 1);

        project.alerting_rules[0].enabled = false;
        evaluator.check(&project, &world_with_check(Status::Warning), T0 + STEP).await;
        assert!(db.get_latest_alerts_by_rule(&project.id, "cpu").unwrap().is_empty());
    }

    #[test]
    fn test_pending_cleanup() {
        let (_, _, mut evaluator, _) = setup(Vec::new());
        assert!(!evaluator.pending_elapsed("a", Duration::MINUTE, T0));
        assert!(!evaluator.pending_elapsed("b", Duration::MINUTE, T0 + Duration::MINUTE * 20));
        evaluator.cleanup_pending(T0 + Duration::MINUTE * 31);
        assert!(!evaluator.pending.contains_key("a"));
        assert!(evaluator.pending.contains_key("b"));
        assert!(evaluator.pending_elapsed("b", Duration::MINUTE, T0 + Duration::MINUTE * 31));
        assert!(!evaluator.pending.contains_key("b"));
    }
}
