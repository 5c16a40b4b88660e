use std::collections::BTreeMap;

use xxhash_rust::xxh64::Xxh64;

use crate::timeseries::{Duration, Time, TimeSeries};

/// Sorted label set of a series.
pub type Labels = BTreeMap<String, String>;

const SEP: u8 = 0xff;

/// Stable hash of a label set: xxh64 over `key\xffvalue\xff` in key order.
pub fn labels_hash(labels: &Labels) -> u64 {
    let mut h = Xxh64::new(0);
    for (k, v) in labels {
        h.update(k.as_bytes());
        h.update(&[SEP]);
        h.update(v.as_bytes());
        h.update(&[SEP]);
    }
    h.digest()
}

/// One series of a range query result with its frequently used labels
/// promoted to fields.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricValues {
    pub labels: Labels,
    pub labels_hash: u64,
    pub values: TimeSeries,

    pub machine_id: String,
    pub system_uuid: String,
    pub container_id: String,
    pub destination: String,
    pub actual_destination: String,
}

impl MetricValues {
    pub fn new(labels: Labels, values: TimeSeries) -> Self {
        let hash = labels_hash(&labels);
        let mut mv = Self {
            labels: Labels::new(),
            labels_hash: hash,
            values,
            machine_id: String::new(),
            system_uuid: String::new(),
            container_id: String::new(),
            destination: String::new(),
            actual_destination: String::new(),
        };
        mv.set_labels(labels);
        mv
    }

    /// Empty series with a precomputed hash; labels are set later.
    pub fn with_hash(labels_hash: u64, from: Time, points_count: usize, step: Duration) -> Self {
        Self {
            labels: Labels::new(),
            labels_hash,
            values: TimeSeries::new(from, points_count, step),
            machine_id: String::new(),
            system_uuid: String::new(),
            container_id: String::new(),
            destination: String::new(),
            actual_destination: String::new(),
        }
    }

    pub fn set_labels(&mut self, labels: Labels) {
        for (k, v) in &labels {
            match k.as_str() {
                "machine_id" => self.machine_id = v.clone(),
                "system_uuid" => self.system_uuid = v.clone(),
                "container_id" => self.container_id = v.clone(),
                "destination" | "destination_ip" => self.destination = v.clone(),
                "actual_destination" => self.actual_destination = v.clone(),
                _ => {}
            }
        }
        self.labels = labels;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_labels_hash_is_order_independent() {
        let a = labels(&[("a", "b"), ("c", "d")]);
        let b = labels(&[("c", "d"), ("a", "b")]);
        assert_eq!(labels_hash(&a), labels_hash(&b));
        assert_ne!(labels_hash(&a), labels_hash(&labels(&[("a", "bc"), ("", "d")])));
    }

    #[test]
    fn test_promoted_labels() {
        let mv = MetricValues::new(
            labels(&[("container_id", "/k8s/ns/pod/app"), ("destination_ip", "10.0.0.1:80")]),
            TimeSeries::new(Time(0), 1, Duration(30)),
        );
        assert_eq!(mv.container_id, "/k8s/ns/pod/app");
        assert_eq!(mv.destination, "10.0.0.1:80");
        assert_eq!(mv.labels.len(), 2);
    }
}
