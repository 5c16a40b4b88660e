use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{ApplicationId, Status};
use crate::timeseries::{Duration, Time};

/// Multi-window burn-rate rule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BurnRateRule {
    pub long_window: Duration,
    pub short_window: Duration,
    pub threshold: f32,
    pub severity: Status,
}

pub const BURN_RATE_RULES: [BurnRateRule; 4] = [
    BurnRateRule {
        long_window: Duration::HOUR,
        short_window: Duration(5 * 60),
        threshold: 14.4,
        severity: Status::Critical,
    },
    BurnRateRule {
        long_window: Duration(6 * 3600),
        short_window: Duration(30 * 60),
        threshold: 6.0,
        severity: Status::Critical,
    },
    BurnRateRule {
        long_window: Duration::DAY,
        short_window: Duration(2 * 3600),
        threshold: 3.0,
        severity: Status::Warning,
    },
    BurnRateRule {
        long_window: Duration(3 * 86400),
        short_window: Duration(6 * 3600),
        threshold: 1.0,
        severity: Status::Warning,
    },
];

pub fn max_burn_rate_window() -> Duration {
    BURN_RATE_RULES
        .iter()
        .map(|r| r.long_window)
        .max()
        .unwrap_or(Duration::HOUR)
}

pub fn min_burn_rate_short_window() -> Duration {
    BURN_RATE_RULES
        .iter()
        .map(|r| r.short_window)
        .min()
        .unwrap_or(Duration(5 * 60))
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BurnRate {
    pub long_window: Duration,
    pub short_window: Duration,
    pub long_window_burn_rate: f32,
    pub short_window_burn_rate: f32,
    pub long_window_percentage: f32,
    pub short_window_percentage: f32,
    pub threshold: f32,
    pub severity: Status,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentImpact {
    pub affected_request_percentage: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentDetails {
    pub availability_burn_rates: Vec<BurnRate>,
    pub latency_burn_rates: Vec<BurnRate>,
    pub availability_impact: IncidentImpact,
    pub latency_impact: IncidentImpact,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationIncident {
    pub application_id: ApplicationId,
    pub key: String,
    pub opened_at: Time,
    pub resolved_at: Time,
    pub severity: Status,
    pub details: IncidentDetails,
}

impl ApplicationIncident {
    pub fn is_resolved(&self) -> bool {
        !self.resolved_at.is_zero()
    }

    pub fn duration(&self, now: Time) -> Duration {
        let end = if self.is_resolved() { self.resolved_at } else { now };
        end - self.opened_at
    }
}

const NANOID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Random id over `[0-9a-z]`.
pub fn nano_id(size: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..size)
        .map(|_| NANOID_ALPHABET[rng.gen_range(0..NANOID_ALPHABET.len())] as char)
        .collect()
}
