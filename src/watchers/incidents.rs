//! SLO incidents from multi-window burn rates.

use std::cmp::max;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::db::Db;
use crate::model::incident::{max_burn_rate_window, min_burn_rate_short_window, nano_id, BURN_RATE_RULES};
use crate::model::{Application, ApplicationIncident, BurnRate, IncidentDetails, Project, Status, World};
use crate::notifications::Notifier;
use crate::timeseries::{Time, TimeSeries};

/// Requests that count against the objective.
enum BadRequests<'a> {
    Failed(Option<&'a TimeSeries>),
    /// Everything slower than the objective bucket: `total - fast`.
    Slow { fast: &'a TimeSeries },
}

struct Sli<'a> {
    total: &'a TimeSeries,
    bad: BadRequests<'a>,
    objective_percentage: f32,
}

impl Sli<'_> {
    fn availability(app: &Application) -> Option<Sli<'_>> {
        let sli = app.availability_slis.first()?;
        let total = sli.total_requests_raw.as_ref().filter(|ts| !ts.tail_is_empty())?;
        Some(Sli {
            total,
            bad: BadRequests::Failed(sli.failed_requests_raw.as_ref().filter(|ts| !ts.is_empty())),
            objective_percentage: sli.objective_percentage,
        })
    }

    fn latency(app: &Application) -> Option<Sli<'_>> {
        let sli = app.latency_slis.first()?;
        let (total, fast) = sli.total_and_fast(true);
        Some(Sli {
            total: total?,
            bad: BadRequests::Slow {
                fast: fast.filter(|ts| !ts.is_empty())?,
            },
            objective_percentage: sli.objective_percentage,
        })
    }

    /// NaN unless at least half of the points since `from` are defined.
    fn total_sum(&self, from: Time) -> f32 {
        let (mut sum, mut count, mut defined) = (0.0, 0, 0);
        for (_, v) in self.total.iter().filter(|(t, _)| *t >= from) {
            count += 1;
            if !v.is_nan() {
                sum += v;
                defined += 1;
            }
        }
        if count == 0 || (defined as f32) / (count as f32) < 0.5 {
            return f32::NAN;
        }
        sum
    }

    fn bad_sum(&self, from: Time) -> f32 {
        match self.bad {
            BadRequests::Failed(None) => 0.0,
            BadRequests::Failed(Some(failed)) => failed
                .iter()
                .filter(|(t, v)| *t >= from && !v.is_nan())
                .map(|(_, v)| v)
                .sum(),
            BadRequests::Slow { fast } => self
                .total
                .iter()
                .zip(fast.iter())
                .filter(|((t, total), _)| *t >= from && !total.is_nan())
                .map(|((_, total), (_, fast))| if fast.is_nan() { total } else { total - fast })
                .sum(),
        }
    }

    /// Share of bad requests, in percent, since the incident opened.
    fn impact(&self, opened_at: Time, now: Time) -> f32 {
        let from = max(opened_at - min_burn_rate_short_window(), now - max_burn_rate_window());
        let v = self.bad_sum(from) / self.total_sum(from);
        if v.is_nan() {
            return 0.0;
        }
        v * 100.0
    }
}

fn calc_burn_rates(now: Time, sli: &Sli) -> Vec<BurnRate> {
    let objective = 1.0 - sli.objective_percentage / 100.0;
    let ratio = |from: Time| sli.bad_sum(from) / sli.total_sum(from);
    let mut res = Vec::new();
    for rule in &BURN_RATE_RULES {
        let long = ratio(now - rule.long_window);
        if long.is_nan() {
            continue;
        }
        let short = ratio(now - rule.short_window);
        if short.is_nan() {
            continue;
        }
        let mut br = BurnRate {
            long_window: rule.long_window,
            short_window: rule.short_window,
            long_window_burn_rate: long / objective,
            short_window_burn_rate: short / objective,
            long_window_percentage: long * 100.0,
            short_window_percentage: short * 100.0,
            threshold: rule.threshold,
            severity: Status::Ok,
        };
        if br.long_window_burn_rate > rule.threshold && br.short_window_burn_rate > rule.threshold {
            br.severity = rule.severity;
        }
        res.push(br);
    }
    res
}

pub struct IncidentWatcher {
    db: Arc<Db>,
    notifier: Arc<Notifier>,
}

impl IncidentWatcher {
    pub fn new(db: Arc<Db>, notifier: Arc<Notifier>) -> Self {
        Self { db, notifier }
    }

    pub async fn check(&self, project: &Project, world: &World, now: Time) {
        let start = Instant::now();
        let mut apps = 0;
        for app in world.applications.values() {
            let availability = Sli::availability(app);
            let latency = Sli::latency(app);
            let burn_rates = |sli: &Option<Sli>| {
                sli.as_ref()
                    .map(|s| calc_burn_rates(world.ctx.to, s))
                    .unwrap_or_default()
            };
            let mut details = IncidentDetails {
                availability_burn_rates: burn_rates(&availability),
                latency_burn_rates: burn_rates(&latency),
                ..Default::default()
            };
            let status = details
                .availability_burn_rates
                .iter()
                .chain(&details.latency_burn_rates)
                .map(|br| br.severity)
                .max()
                .unwrap_or(Status::Unknown);
            if status == Status::Unknown {
                continue;
            }
            apps += 1;

            let set_impact = |details: &mut IncidentDetails, opened_at: Time| {
                let impact = |sli: &Option<Sli>| sli.as_ref().map_or(0.0, |s| s.impact(opened_at, now));
                details.availability_impact.affected_request_percentage = impact(&availability);
                details.latency_impact.affected_request_percentage = impact(&latency);
            };

            let open = match self.db.get_last_open_incident(&project.id, &app.id) {
                Ok(open) => open,
                Err(e) => {
                    error!(target: "cerebro::watchers", project = %project.id, app = %app.id, error = %e, "failed to load incident");
                    continue;
                }
            };
            let notify = match open {
                None if status <= Status::Ok => continue,
                None => {
                    set_impact(&mut details, now);
                    let incident = ApplicationIncident {
                        application_id: app.id.clone(),
                        key: nano_id(8),
                        opened_at: now,
                        resolved_at: Time::ZERO,
                        severity: status,
                        details,
                    };
                    if let Err(e) = self.db.create_incident(&project.id, &incident) {
                        error!(target: "cerebro::watchers", project = %project.id, app = %app.id, error = %e, "failed to create incident");
                        continue;
                    }
                    info!(target: "cerebro::watchers", project = %project.id, app = %app.id, key = %incident.key, severity = %status, "incident opened");
                    Some(incident)
                }
                Some(mut incident) if status == Status::Ok => {
                    incident.resolved_at = now;
                    if let Err(e) = self.db.resolve_incident(&project.id, &incident.key, now) {
                        error!(target: "cerebro::watchers", project = %project.id, app = %app.id, error = %e, "failed to resolve incident");
                        continue;
                    }
                    info!(target: "cerebro::watchers", project = %project.id, app = %app.id, key = %incident.key, "incident resolved");
                    Some(incident)
                }
                Some(mut incident) => {
                    let escalated = status > incident.severity;
                    if escalated {
                        incident.severity = status;
                    }
                    set_impact(&mut details, incident.opened_at);
                    incident.details = details;
                    if let Err(e) = self
                        .db
                        .update_incident(&project.id, &incident.key, incident.severity, &incident.details)
                    {
                        error!(target: "cerebro::watchers", project = %project.id, app = %app.id, error = %e, "failed to update incident");
                        continue;
                    }
                    escalated.then_some(incident)
                }
            };
            if let Some(incident) = notify {
                self.notifier.enqueue_incident(project, app, &incident, now).await;
            }
        }
        info!(
            target: "cerebro::watchers",
            project = %project.id,
            apps,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "incidents checked"
        );
    }
}
