//! Queries every project keeps back-filled.

use std::collections::BTreeMap;

use crate::model::Project;

/// Built-in range queries, keyed by the name the world constructor uses.
/// `$RANGE` is substituted by the metric source.
pub const CORE_QUERIES: &[(&str, &str)] = &[
    ("up", "up"),
    ("node_info", "node_info"),
    ("node_cloud_info", "node_cloud_info"),
    ("node_cpu_cores", "node_resources_cpu_logical_cores"),
    (
        "node_cpu_usage_percent",
        r#"sum(rate(node_resources_cpu_usage_seconds_total{mode!="idle"}[$RANGE])) without(mode) /sum(rate(node_resources_cpu_usage_seconds_total[$RANGE])) without(mode)*100"#,
    ),
    ("node_memory_total_bytes", "node_resources_memory_total_bytes"),
    ("node_memory_available_bytes", "node_resources_memory_available_bytes"),
    ("node_net_rx_bytes", "rate(node_net_received_bytes_total[$RANGE])"),
    ("node_net_tx_bytes", "rate(node_net_transmitted_bytes_total[$RANGE])"),
    ("kube_pod_info", "kube_pod_info"),
    ("kube_pod_labels", "kube_pod_labels"),
    ("kube_pod_status_phase", "kube_pod_status_phase"),
    ("kube_pod_status_ready", r#"kube_pod_status_ready{condition="true"}"#),
    ("kube_deployment_spec_replicas", "kube_deployment_spec_replicas"),
    ("kube_replicaset_owner", "kube_replicaset_owner"),
    ("container_log_messages", "container_log_messages_total"),
    ("container_cpu_limit", "container_resources_cpu_limit_cores"),
    ("container_cpu_usage", "rate(container_resources_cpu_usage_seconds_total[$RANGE])"),
    ("container_cpu_delay", "rate(container_resources_cpu_delay_seconds_total[$RANGE])"),
    ("container_memory_rss", "container_resources_memory_rss_bytes"),
    ("container_memory_limit", "container_resources_memory_limit_bytes"),
    ("container_oom_kills_total", "container_oom_kills_total"),
    ("container_restarts", "container_restarts_total"),
    ("container_volume_size", "container_resources_disk_size_bytes"),
    ("container_volume_used", "container_resources_disk_used_bytes"),
    ("container_http_requests_count", "rate(container_http_requests_total[$RANGE])"),
    (
        "container_http_requests_latency",
        "rate(container_http_requests_duration_seconds_total_sum [$RANGE]) / rate(container_http_requests_duration_seconds_total_count [$RANGE])",
    ),
    (
        "container_http_requests_histogram",
        "rate(container_http_requests_duration_seconds_total_bucket[$RANGE])",
    ),
    ("container_postgres_queries_count", "rate(container_postgres_queries_total[$RANGE])"),
    ("container_redis_queries_count", "rate(container_redis_queries_total[$RANGE])"),
];

/// A query the updater must keep up to date.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedQuery {
    pub query: String,
    /// Recording rules share one jitter per project.
    pub is_recording_rule: bool,
}

/// Core queries plus the project's own queries and recording rules,
/// deduplicated by query text. A recording rule wins over a plain query.
pub fn expected_queries(project: &Project) -> Vec<ExpectedQuery> {
    let mut res: BTreeMap<&str, bool> = BTreeMap::new();
    for (_, q) in CORE_QUERIES {
        res.insert(q, false);
    }
    for q in &project.queries {
        res.entry(q.as_str()).or_insert(false);
    }
    for q in &project.recording_rules {
        res.insert(q.as_str(), true);
    }
    res.into_iter()
        .filter(|(q, _)| !q.trim().is_empty())
        .map(|(q, is_rr)| ExpectedQuery {
            query: q.to_string(),
            is_recording_rule: is_rr,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_queries() {
        let project = Project {
            name: "p".into(),
            queries: vec!["up".into(), "my_metric".into(), " ".into()],
            recording_rules: vec!["sum(rate(x[$RANGE]))".into()],
            ..Default::default()
        };
        let qs = expected_queries(&project);
        assert_eq!(qs.len(), CORE_QUERIES.len() + 2);
        assert!(qs.iter().any(|q| q.query == "my_metric" && !q.is_recording_rule));
        assert!(qs.iter().any(|q| q.query == "sum(rate(x[$RANGE]))" && q.is_recording_rule));
        assert_eq!(qs.iter().filter(|q| q.query == "up").count(), 1);
    }

    #[test]
    fn test_core_query_names_are_unique() {
        let mut names: Vec<&str> = CORE_QUERIES.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), CORE_QUERIES.len());
    }
}
