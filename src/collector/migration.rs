// ============================================================================
// SCHEMA MIGRATION
// ============================================================================
// Idempotent DDL for the signal tables. Engines and `ON CLUSTER` clauses
// depend on the detected topology; `_distributed` tables exist only in
// cluster mode. Retention comes from the per-signal TTL settings.
// ============================================================================

use std::time::Duration as StdDuration;

use tracing::debug;

use super::clickhouse::{ClickHouseClient, Topology};
use super::Signal;
use crate::config::ObserveConfig;
use crate::constants::{MIGRATION_BACKOFF_FACTOR, MIGRATION_BACKOFF_MAX_SECS, MIGRATION_BACKOFF_MIN_SECS};
use crate::error::CollectorError;

const MERGE_TREE: &str = "MergeTree()";
const REPLICATED_MERGE_TREE: &str = "ReplicatedMergeTree('/clickhouse/tables/{shard}/{database}/{table}', '{replica}')";
const REPLACING_MERGE_TREE: &str = "ReplacingMergeTree()";
const REPLICATED_REPLACING_MERGE_TREE: &str =
    "ReplicatedReplacingMergeTree('/clickhouse/tables/{shard}/{database}/{table}', '{replica}')";

/// Retention of each signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ttls {
    pub traces: StdDuration,
    pub logs: StdDuration,
    pub profiles: StdDuration,
    pub metrics: StdDuration,
}

impl Ttls {
    pub fn from_config(cfg: &ObserveConfig) -> Self {
        Self {
            traces: cfg.traces.ttl,
            logs: cfg.logs.ttl,
            profiles: cfg.profiles.ttl,
            metrics: cfg.metrics.ttl,
        }
    }

    pub fn get(&self, signal: Signal) -> StdDuration {
        match signal {
            Signal::Traces => self.traces,
            Signal::Logs => self.logs,
            Signal::Profiles => self.profiles,
            Signal::Metrics => self.metrics,
        }
    }
}

/// Substitutes every schema placeholder of `sql`.
pub fn render(sql: &str, ttl: StdDuration, topology: &Topology) -> String {
    let (merge_tree, replacing) = if topology.is_distributed() {
        (REPLICATED_MERGE_TREE, REPLICATED_REPLACING_MERGE_TREE)
    } else {
        (MERGE_TREE, REPLACING_MERGE_TREE)
    };
    let sql = sql
        .replace("@ttl_seconds", &ttl.as_secs().to_string())
        .replace("@ttl_days", &(ttl.as_secs() / 86_400).max(1).to_string())
        .replace("@replacing_merge_tree", replacing)
        .replace("@merge_tree", merge_tree);
    topology.apply(&sql)
}

/// Every statement to run against a server with the given topology.
pub fn statements(topology: &Topology, ttls: &Ttls) -> Vec<String> {
    let mut res: Vec<String> = TABLES
        .iter()
        .map(|(signal, sql)| render(sql, ttls.get(*signal), topology))
        .collect();
    if topology.is_distributed() {
        res.extend(DISTRIBUTED_TABLES.iter().map(|sql| topology.apply(sql)));
    }
    res
}

/// Creates the database (unless it is `default`) and every table.
pub async fn migrate(client: &ClickHouseClient, ttls: &Ttls) -> Result<(), CollectorError> {
    let database = client.database();
    if !database.is_empty() && database != "default" {
        client
            .exec_in_default(&format!("CREATE DATABASE IF NOT EXISTS `{database}` @on_cluster"))
            .await?;
    }
    let stmts = statements(client.topology(), ttls);
    for sql in &stmts {
        client.exec(sql).await.map_err(|e| CollectorError::MigrationFailed {
            message: format!("{e}; statement: {}", sql.trim().lines().next().unwrap_or_default()),
        })?;
    }
    debug!(target: "cerebro::collector", address = client.address(), statements = stmts.len(), "schema is up to date");
    Ok(())
}

/// Exponential backoff between migration attempts.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    min: StdDuration,
    max: StdDuration,
    factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempt: 0,
            min: StdDuration::from_secs(MIGRATION_BACKOFF_MIN_SECS),
            max: StdDuration::from_secs(MIGRATION_BACKOFF_MAX_SECS),
            factor: MIGRATION_BACKOFF_FACTOR,
        }
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> StdDuration {
        let mult = self.factor.saturating_pow(self.attempt.min(16));
        self.attempt += 1;
        self.min.saturating_mul(mult).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ----------------------------------------------------------------------------
// DDL
// ----------------------------------------------------------------------------

const TABLES: &[(Signal, &str)] = &[
    (
        Signal::Logs,
        r#"
CREATE TABLE IF NOT EXISTS otel_logs @on_cluster (
     Timestamp DateTime64(9) CODEC(Delta, ZSTD(1)),
     TraceId String CODEC(ZSTD(1)),
     SpanId String CODEC(ZSTD(1)),
     TraceFlags UInt32 CODEC(ZSTD(1)),
     SeverityText LowCardinality(String) CODEC(ZSTD(1)),
     SeverityNumber Int32 CODEC(ZSTD(1)),
     ServiceName LowCardinality(String) CODEC(ZSTD(1)),
     Body String CODEC(ZSTD(1)),
     ResourceAttributes Map(LowCardinality(String), String) CODEC(ZSTD(1)),
     LogAttributes Map(LowCardinality(String), String) CODEC(ZSTD(1)),
     INDEX idx_trace_id TraceId TYPE bloom_filter(0.001) GRANULARITY 1,
     INDEX idx_res_attr_key mapKeys(ResourceAttributes) TYPE bloom_filter(0.01) GRANULARITY 1,
     INDEX idx_res_attr_value mapValues(ResourceAttributes) TYPE bloom_filter(0.01) GRANULARITY 1,
     INDEX idx_log_attr_key mapKeys(LogAttributes) TYPE bloom_filter(0.01) GRANULARITY 1,
     INDEX idx_log_attr_value mapValues(LogAttributes) TYPE bloom_filter(0.01) GRANULARITY 1,
     INDEX idx_body Body TYPE tokenbf_v1(32768, 3, 0) GRANULARITY 1
) ENGINE @merge_tree
TTL toDateTime(Timestamp) + toIntervalSecond(@ttl_seconds)
PARTITION BY toDate(Timestamp)
ORDER BY (ServiceName, SeverityText, toUnixTimestamp(Timestamp), TraceId)
SETTINGS index_granularity=8192, ttl_only_drop_parts = 1"#,
    ),
    (
        Signal::Logs,
        r#"
CREATE TABLE IF NOT EXISTS otel_logs_service_name_severity_text @on_cluster (
    ServiceName LowCardinality(String) CODEC(ZSTD(1)),
    SeverityText LowCardinality(String) CODEC(ZSTD(1)),
    LastSeen DateTime64(9) CODEC(Delta, ZSTD(1))
)
ENGINE @replacing_merge_tree
PRIMARY KEY (ServiceName, SeverityText)
TTL toDateTime(LastSeen) + toIntervalSecond(@ttl_seconds)
PARTITION BY toDate(LastSeen)"#,
    ),
    (
        Signal::Logs,
        r#"
CREATE MATERIALIZED VIEW IF NOT EXISTS otel_logs_service_name_severity_text_mv @on_cluster TO otel_logs_service_name_severity_text AS
SELECT ServiceName, SeverityText, max(Timestamp) AS LastSeen FROM otel_logs group by ServiceName, SeverityText"#,
    ),
    (
        Signal::Traces,
        r#"
CREATE TABLE IF NOT EXISTS otel_traces @on_cluster (
     Timestamp DateTime64(9) CODEC(Delta, ZSTD(1)),
     TraceId String CODEC(ZSTD(1)),
     SpanId String CODEC(ZSTD(1)),
     ParentSpanId String CODEC(ZSTD(1)),
     TraceState String CODEC(ZSTD(1)),
     SpanName LowCardinality(String) CODEC(ZSTD(1)),
     SpanKind LowCardinality(String) CODEC(ZSTD(1)),
     ServiceName LowCardinality(String) CODEC(ZSTD(1)),
     ResourceAttributes Map(LowCardinality(String), String) CODEC(ZSTD(1)),
     SpanAttributes Map(LowCardinality(String), String) CODEC(ZSTD(1)),
     Duration Int64 CODEC(ZSTD(1)),
     StatusCode LowCardinality(String) CODEC(ZSTD(1)),
     StatusMessage String CODEC(ZSTD(1)),
     Events Nested (
         Timestamp DateTime64(9),
         Name LowCardinality(String),
         Attributes Map(LowCardinality(String), String)
     ) CODEC(ZSTD(1)),
     Links Nested (
         TraceId String,
         SpanId String,
         TraceState String,
         Attributes Map(LowCardinality(String), String)
     ) CODEC(ZSTD(1)),
     INDEX idx_trace_id TraceId TYPE bloom_filter(0.001) GRANULARITY 1,
     INDEX idx_res_attr_key mapKeys(ResourceAttributes) TYPE bloom_filter(0.01) GRANULARITY 1,
     INDEX idx_res_attr_value mapValues(ResourceAttributes) TYPE bloom_filter(0.01) GRANULARITY 1,
     INDEX idx_span_attr_key mapKeys(SpanAttributes) TYPE bloom_filter(0.01) GRANULARITY 1,
     INDEX idx_span_attr_value mapValues(SpanAttributes) TYPE bloom_filter(0.01) GRANULARITY 1,
     INDEX idx_duration Duration TYPE minmax GRANULARITY 1
) ENGINE @merge_tree
TTL toDateTime(Timestamp) + toIntervalSecond(@ttl_seconds)
PARTITION BY toDate(Timestamp)
ORDER BY (ServiceName, SpanName, toUnixTimestamp(Timestamp), TraceId)
SETTINGS index_granularity=8192, ttl_only_drop_parts = 1"#,
    ),
    (
        Signal::Traces,
        "ALTER TABLE otel_traces @on_cluster ADD COLUMN IF NOT EXISTS NetSockPeerAddr LowCardinality(String) MATERIALIZED SpanAttributes['net.sock.peer.addr'] CODEC(ZSTD(1))",
    ),
    (
        Signal::Traces,
        r#"
CREATE TABLE IF NOT EXISTS otel_traces_trace_id_ts @on_cluster (
     TraceId String CODEC(ZSTD(1)),
     Start DateTime64(9) CODEC(Delta, ZSTD(1)),
     End DateTime64(9) CODEC(Delta, ZSTD(1)),
     INDEX idx_trace_id TraceId TYPE bloom_filter(0.01) GRANULARITY 1
) ENGINE @merge_tree
TTL toDateTime(Start) + toIntervalSecond(@ttl_seconds)
ORDER BY (TraceId, toUnixTimestamp(Start))
SETTINGS index_granularity=8192"#,
    ),
    (
        Signal::Traces,
        r#"
CREATE MATERIALIZED VIEW IF NOT EXISTS otel_traces_trace_id_ts_mv @on_cluster TO otel_traces_trace_id_ts AS
SELECT TraceId, min(Timestamp) as Start, max(Timestamp) as End
FROM otel_traces
WHERE TraceId!=''
GROUP BY TraceId"#,
    ),
    (
        Signal::Traces,
        r#"
CREATE TABLE IF NOT EXISTS otel_traces_service_name @on_cluster (
    ServiceName LowCardinality(String) CODEC(ZSTD(1)),
    LastSeen DateTime64(9) CODEC(Delta, ZSTD(1))
)
ENGINE @replacing_merge_tree
PRIMARY KEY (ServiceName)
TTL toDateTime(LastSeen) + toIntervalSecond(@ttl_seconds)
PARTITION BY toDate(LastSeen)"#,
    ),
    (
        Signal::Traces,
        r#"
CREATE MATERIALIZED VIEW IF NOT EXISTS otel_traces_service_name_mv @on_cluster TO otel_traces_service_name AS
SELECT ServiceName, max(Timestamp) AS LastSeen FROM otel_traces group by ServiceName"#,
    ),
    (
        Signal::Profiles,
        r#"
CREATE TABLE IF NOT EXISTS profiling_stacks @on_cluster (
    ServiceName LowCardinality(String) CODEC(ZSTD(1)),
    Hash UInt64 CODEC(ZSTD(1)),
    LastSeen DateTime64(9) CODEC(Delta, ZSTD(1)),
    Stack Array(String) CODEC(ZSTD(1))
)
ENGINE @replacing_merge_tree
PRIMARY KEY (ServiceName, Hash)
TTL toDateTime(LastSeen) + toIntervalSecond(@ttl_seconds)
PARTITION BY toDate(LastSeen)
ORDER BY (ServiceName, Hash)"#,
    ),
    (
        Signal::Profiles,
        r#"
CREATE TABLE IF NOT EXISTS profiling_samples @on_cluster (
    ServiceName LowCardinality(String) CODEC(ZSTD(1)),
    Type LowCardinality(String) CODEC(ZSTD(1)),
    Start DateTime64(9) CODEC(Delta, ZSTD(1)),
    End DateTime64(9) CODEC(Delta, ZSTD(1)),
    Labels Map(LowCardinality(String), String) CODEC(ZSTD(1)),
    StackHash UInt64 CODEC(ZSTD(1)),
    Value Int64 CODEC(ZSTD(1))
) ENGINE @merge_tree
TTL toDateTime(Start) + toIntervalSecond(@ttl_seconds)
PARTITION BY toDate(Start)
ORDER BY (ServiceName, Type, toUnixTimestamp(Start), toUnixTimestamp(End))"#,
    ),
    (
        Signal::Profiles,
        r#"
CREATE TABLE IF NOT EXISTS profiling_profiles @on_cluster (
    ServiceName LowCardinality(String) CODEC(ZSTD(1)),
    Type LowCardinality(String) CODEC(ZSTD(1)),
    LastSeen DateTime64(9) CODEC(Delta, ZSTD(1))
)
ENGINE @replacing_merge_tree
PRIMARY KEY (ServiceName, Type)
TTL toDateTime(LastSeen) + toIntervalSecond(@ttl_seconds)
PARTITION BY toDate(LastSeen)"#,
    ),
    (
        Signal::Profiles,
        r#"
CREATE MATERIALIZED VIEW IF NOT EXISTS profiling_profiles_mv @on_cluster TO profiling_profiles AS
SELECT ServiceName, Type, max(End) AS LastSeen FROM profiling_samples group by ServiceName, Type"#,
    ),
    (
        Signal::Metrics,
        r#"
CREATE TABLE IF NOT EXISTS metrics @on_cluster (
    MetricName LowCardinality(String) CODEC(ZSTD(1)),
    Labels Map(LowCardinality(String), String) CODEC(ZSTD(1)),
    Timestamp DateTime64(3) CODEC(Delta, ZSTD(1)),
    MetricHash UInt64 CODEC(ZSTD(1)),
    Value Float64 CODEC(ZSTD(1))
) ENGINE @merge_tree
TTL toDateTime(Timestamp) + toIntervalSecond(@ttl_seconds)
PARTITION BY toDate(Timestamp)
ORDER BY (MetricName, MetricHash, toUnixTimestamp(Timestamp))
SETTINGS index_granularity=8192, ttl_only_drop_parts = 1"#,
    ),
    (
        Signal::Metrics,
        r#"
CREATE TABLE IF NOT EXISTS metrics_metadata @on_cluster (
    MetricFamilyName LowCardinality(String) CODEC(ZSTD(1)),
    Type LowCardinality(String) CODEC(ZSTD(1)),
    Help String CODEC(ZSTD(1)),
    Unit LowCardinality(String) CODEC(ZSTD(1))
)
ENGINE @replacing_merge_tree
ORDER BY (MetricFamilyName)"#,
    ),
];

const DISTRIBUTED_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS otel_logs_distributed ON CLUSTER @cluster AS otel_logs
        ENGINE = Distributed(@cluster, currentDatabase(), otel_logs, rand())",
    "CREATE TABLE IF NOT EXISTS otel_logs_service_name_severity_text_distributed ON CLUSTER @cluster AS otel_logs_service_name_severity_text
        ENGINE = Distributed(@cluster, currentDatabase(), otel_logs_service_name_severity_text)",
    "CREATE TABLE IF NOT EXISTS otel_traces_distributed ON CLUSTER @cluster AS otel_traces
        ENGINE = Distributed(@cluster, currentDatabase(), otel_traces, cityHash64(TraceId))",
    "CREATE TABLE IF NOT EXISTS otel_traces_trace_id_ts_distributed ON CLUSTER @cluster AS otel_traces_trace_id_ts
        ENGINE = Distributed(@cluster, currentDatabase(), otel_traces_trace_id_ts)",
    "CREATE TABLE IF NOT EXISTS otel_traces_service_name_distributed ON CLUSTER @cluster AS otel_traces_service_name
        ENGINE = Distributed(@cluster, currentDatabase(), otel_traces_service_name)",
    "CREATE TABLE IF NOT EXISTS profiling_stacks_distributed ON CLUSTER @cluster AS profiling_stacks
        ENGINE = Distributed(@cluster, currentDatabase(), profiling_stacks, Hash)",
    "CREATE TABLE IF NOT EXISTS profiling_samples_distributed ON CLUSTER @cluster AS profiling_samples
        ENGINE = Distributed(@cluster, currentDatabase(), profiling_samples, StackHash)",
    "CREATE TABLE IF NOT EXISTS profiling_profiles_distributed ON CLUSTER @cluster AS profiling_profiles
        ENGINE = Distributed(@cluster, currentDatabase(), profiling_profiles)",
    "CREATE TABLE IF NOT EXISTS metrics_distributed ON CLUSTER @cluster AS metrics
        ENGINE = Distributed(@cluster, currentDatabase(), metrics, MetricHash)",
    "CREATE TABLE IF NOT EXISTS metrics_metadata_distributed ON CLUSTER @cluster AS metrics_metadata
        ENGINE = Distributed(@cluster, currentDatabase(), metrics_metadata)",
];
