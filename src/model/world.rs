//! The application-aware world model consumed by the watchers.
//!
//! Applications are kept in an arena keyed by [`ApplicationId`]; instances
//! refer to their owner by id, never by pointer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ApplicationId, ApplicationKind, Status};
use crate::timeseries::{Duration, Time, TimeSeries};

/// Time range and resolution a world was built for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub from: Time,
    pub to: Time,
    pub step: Duration,
}

impl Context {
    pub fn points_count(&self) -> usize {
        if self.step.0 <= 0 || self.to < self.from {
            return 0;
        }
        ((self.to - self.from) / self.step) as usize + 1
    }
}

#[derive(Clone, Debug, Default)]
pub struct World {
    pub ctx: Context,
    pub applications: BTreeMap<ApplicationId, Application>,
}

impl World {
    pub fn new(from: Time, to: Time, step: Duration) -> Self {
        Self {
            ctx: Context { from, to, step },
            applications: BTreeMap::new(),
        }
    }

    pub fn add_application(&mut self, app: Application) {
        self.applications.insert(app.id.clone(), app);
    }
}

#[derive(Clone, Debug, Default)]
pub struct Application {
    pub id: ApplicationId,
    pub category: String,
    pub instances: Vec<Instance>,
    pub log_messages: BTreeMap<Severity, LogMessages>,
    pub availability_slis: Vec<AvailabilitySli>,
    pub latency_slis: Vec<LatencySli>,
    pub reports: Vec<AuditReport>,
}

impl Application {
    pub fn new(id: ApplicationId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_k8s_deployment(&self) -> bool {
        self.id.kind == ApplicationKind::Deployment
    }

    /// Looks up a check by id across all audit reports.
    pub fn find_check(&self, check_id: &str) -> Option<(&AuditReport, &Check)> {
        self.reports.iter().find_map(|r| {
            r.checks
                .iter()
                .find(|c| c.id == check_id)
                .map(|c| (r, c))
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct Instance {
    pub name: String,
    pub pod: Option<Pod>,
    pub containers: Vec<Container>,
}

#[derive(Clone, Debug, Default)]
pub struct Pod {
    pub replica_set: String,
    pub life_span: Option<TimeSeries>,
}

#[derive(Clone, Debug, Default)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub cpu_usage: Option<TimeSeries>,
    pub memory_rss: Option<TimeSeries>,
    pub restarts: Option<TimeSeries>,
    pub oom_kills: Option<TimeSeries>,
}

// ----------------------------------------------------------------------------
// Logs
// ----------------------------------------------------------------------------

/// Log message severity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Unknown,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "debug" => Severity::Debug,
            "info" => Severity::Info,
            "warning" | "warn" => Severity::Warning,
            "error" => Severity::Error,
            "critical" | "fatal" => Severity::Critical,
            _ => Severity::Unknown,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogMessages {
    pub messages: Option<TimeSeries>,
    pub patterns: BTreeMap<String, LogPattern>,
}

#[derive(Clone, Debug)]
pub struct LogPattern {
    pub hash: String,
    pub pattern: Pattern,
    pub sample: String,
    pub messages: TimeSeries,
    /// Filled by the world constructor; consumed as-is.
    pub similar_pattern_hashes: BTreeSet<String>,
}

/// Tokenized log message template.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pattern {
    words: Vec<String>,
}

impl Pattern {
    pub fn new(text: &str) -> Self {
        Self {
            words: text.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Same number of words and at most one position differs.
    pub fn weak_equal(&self, other: &Pattern) -> bool {
        if self.words.is_empty() || self.words.len() != other.words.len() {
            return false;
        }
        let diff = self
            .words
            .iter()
            .zip(other.words.iter())
            .filter(|(a, b)| a != b)
            .count();
        diff <= 1
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.words.join(" "))
    }
}

// ----------------------------------------------------------------------------
// SLIs
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct AvailabilitySli {
    pub objective_percentage: f32,
    pub total_requests: Option<TimeSeries>,
    pub failed_requests: Option<TimeSeries>,
    pub total_requests_raw: Option<TimeSeries>,
    pub failed_requests_raw: Option<TimeSeries>,
}

#[derive(Clone, Debug)]
pub struct HistogramBucket {
    pub le: f32,
    pub time_series: TimeSeries,
}

#[derive(Clone, Debug, Default)]
pub struct LatencySli {
    pub objective_percentage: f32,
    /// Upper bound (seconds) of a fast request.
    pub objective_bucket: f32,
    /// Cumulative buckets ordered by `le`; the last one is `+Inf`.
    pub histogram: Vec<HistogramBucket>,
    pub histogram_raw: Vec<HistogramBucket>,
}

impl LatencySli {
    /// `(total, fast)` request series taken from the `+Inf` bucket and the
    /// objective bucket.
    pub fn total_and_fast(&self, raw: bool) -> (Option<&TimeSeries>, Option<&TimeSeries>) {
        let histogram = if raw { &self.histogram_raw } else { &self.histogram };
        let total = histogram
            .iter()
            .find(|b| b.le.is_infinite())
            .map(|b| &b.time_series);
        let fast = histogram
            .iter()
            .find(|b| b.le == self.objective_bucket)
            .map(|b| &b.time_series);
        (total, fast)
    }
}

// ----------------------------------------------------------------------------
// Audit output
// ----------------------------------------------------------------------------

/// Name of the report holding the availability and latency checks.
pub const SLO_REPORT: &str = "SLO";

/// Report log-pattern alerts are filed under.
pub const LOGS_REPORT: &str = "Logs";

#[derive(Clone, Debug, Default)]
pub struct AuditReport {
    pub name: String,
    pub checks: Vec<Check>,
}

#[derive(Clone, Debug, Default)]
pub struct Check {
    pub id: String,
    pub title: String,
    pub threshold: f32,
    pub status: Status,
    pub message: String,
    pub value: Option<f32>,
}

impl Check {
    pub fn is_firing(&self) -> bool {
        self.status > Status::Ok
    }
}
