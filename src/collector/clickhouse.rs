// ============================================================================
// CLICKHOUSE HTTP CLIENT
// ============================================================================
// Statements and `FORMAT JSONColumns` inserts over the ClickHouse HTTP
// interface, plus detection of the server topology (single node, cloud or
// named cluster) that decides between local and `_distributed` tables.
// ============================================================================

use std::collections::BTreeSet;
use std::time::Duration as StdDuration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client as HttpClient;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::ClickHouseConfig;
use crate::error::CollectorError;

pub type Row = Map<String, Value>;

static TABLE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@@table_([A-Za-z0-9_]+)@@").expect("table placeholder regex should compile"));

/// Replaces `@@table_<name>@@` with `<name>` or `<name>_distributed`.
pub fn replace_tables(query: &str, distributed: bool) -> String {
    let replacement = if distributed { "${1}_distributed" } else { "${1}" };
    TABLE_PLACEHOLDER.replace_all(query, replacement).into_owned()
}

/// Where statements run: a single server, ClickHouse Cloud, or a named cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    pub cluster: Option<String>,
    pub cloud: bool,
}

impl Topology {
    /// Substitutes `@cluster` and `@on_cluster`.
    pub fn apply(&self, query: &str) -> String {
        match &self.cluster {
            Some(c) => query
                .replace("@on_cluster", &format!("ON CLUSTER {c}"))
                .replace("@cluster", c),
            None => query.replace("@on_cluster", ""),
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.cluster.is_some()
    }
}

/// Picks the cluster used for DDL out of `SHOW CLUSTERS`.
pub fn choose_cluster(clusters: &BTreeSet<String>) -> Result<Option<String>, CollectorError> {
    match clusters.len() {
        0 => Ok(None),
        1 => Ok(clusters.iter().next().cloned()),
        _ if clusters.contains("coroot") => Ok(Some("coroot".to_string())),
        _ if clusters.contains("default") => Ok(Some("default".to_string())),
        _ => Err(CollectorError::clickhouse(
            r#"multiple ClickHouse clusters found, but neither "coroot" nor "default" cluster found"#,
        )),
    }
}

#[derive(Clone)]
pub struct ClickHouseClient {
    http: HttpClient,
    cfg: ClickHouseConfig,
    topology: Topology,
}

impl ClickHouseClient {
    pub fn new(cfg: &ClickHouseConfig) -> Result<Self, CollectorError> {
        let http = HttpClient::builder()
            .timeout(StdDuration::from_secs(30))
            .connect_timeout(StdDuration::from_secs(10))
            .danger_accept_invalid_certs(cfg.tls_skip_verify)
            .build()
            .map_err(|e| CollectorError::clickhouse(e.to_string()))?;
        Ok(Self {
            http,
            cfg: cfg.clone(),
            topology: Topology::default(),
        })
    }

    /// Connects and detects the topology.
    pub async fn connect(cfg: &ClickHouseConfig) -> Result<Self, CollectorError> {
        let mut client = Self::new(cfg)?;
        client.topology = client.detect_topology().await?;
        Ok(client)
    }

    /// Same credentials against another replica of the cluster.
    pub fn for_host(&self, host: &str) -> Self {
        let port = self.cfg.address.rsplit_once(':').map(|(_, p)| p).unwrap_or("8123");
        let mut cfg = self.cfg.clone();
        cfg.address = format!("{host}:{port}");
        Self {
            http: self.http.clone(),
            cfg,
            topology: self.topology.clone(),
        }
    }

    /// Same server and topology, statements scoped to `database`.
    pub fn with_database(&self, database: &str) -> Self {
        let mut client = self.clone();
        client.cfg.database = database.to_string();
        client
    }

    pub fn address(&self) -> &str {
        &self.cfg.address
    }

    pub fn database(&self) -> &str {
        &self.cfg.database
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn request(&self, database: &str, query: &str, body: Vec<u8>) -> Result<String, CollectorError> {
        let url = self.cfg.http_url();
        let mut req = self
            .http
            .post(&url)
            .query(&[("database", database), ("query", query)])
            .body(body);
        let auth = self.cfg.basic_auth();
        if !auth.user.is_empty() {
            req = req.basic_auth(auth.user, Some(auth.password));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CollectorError::clickhouse(format!("{}: {e}", self.cfg.address)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| CollectorError::clickhouse(format!("{}: {e}", self.cfg.address)))?;
        if !status.is_success() {
            return Err(CollectorError::clickhouse(format!(
                "{} responded with {}: {}",
                self.cfg.address,
                status.as_u16(),
                text.trim()
            )));
        }
        Ok(text)
    }

    /// Runs a statement with the cluster placeholders substituted.
    pub async fn exec(&self, query: &str) -> Result<(), CollectorError> {
        let query = self.topology.apply(query);
        debug!(target: "cerebro::collector", address = %self.cfg.address, query = %query.trim(), "exec");
        self.request(&self.cfg.database, &query, Vec::new()).await.map(|_| ())
    }

    /// Runs a statement against the `default` database, used before the
    /// project database exists.
    pub async fn exec_in_default(&self, query: &str) -> Result<(), CollectorError> {
        let query = self.topology.apply(query);
        self.request("default", &query, Vec::new()).await.map(|_| ())
    }

    /// Runs a query and parses its `JSONEachRow` output.
    pub async fn query_rows(&self, query: &str) -> Result<Vec<Row>, CollectorError> {
        let query = format!("{} FORMAT JSONEachRow", query.trim_end());
        let text = self.request(&self.cfg.database, &query, Vec::new()).await?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<Row>(l).map_err(|e| CollectorError::clickhouse(format!("bad row: {e}"))))
            .collect()
    }

    /// Inserts a `JSONColumns` body into `table`, which may be a
    /// `@@table_x@@` placeholder.
    pub async fn insert(&self, table: &str, body: Vec<u8>) -> Result<(), CollectorError> {
        let table = replace_tables(table, self.topology.is_distributed());
        let query = format!("INSERT INTO {table} FORMAT JSONColumns");
        self.request(&self.cfg.database, &query, body).await.map(|_| ())
    }

    async fn detect_topology(&self) -> Result<Topology, CollectorError> {
        let rows = self.query_rows("EXISTS system.zookeeper").await?;
        let exists = rows.first().and_then(|r| r.get("result")).and_then(as_u64).unwrap_or(0);
        if exists != 1 {
            return Ok(Topology::default());
        }

        let rows = self
            .query_rows("SELECT value FROM system.settings WHERE name = 'cloud_mode_engine'")
            .await?;
        let mode = rows.first().and_then(|r| r.get("value")).and_then(as_u64).unwrap_or(0);
        if mode >= 2 {
            info!(target: "cerebro::collector", address = %self.cfg.address, "ClickHouse cloud instance");
            return Ok(Topology {
                cluster: None,
                cloud: true,
            });
        }

        let clusters: BTreeSet<String> = self
            .query_rows("SHOW CLUSTERS")
            .await?
            .iter()
            .filter_map(|r| r.get("cluster").and_then(Value::as_str).map(str::to_string))
            .collect();
        let cluster = choose_cluster(&clusters)?;
        if let Some(c) = &cluster {
            info!(target: "cerebro::collector", address = %self.cfg.address, cluster = %c, "ClickHouse cluster detected");
        }
        Ok(Topology { cluster, cloud: false })
    }
}

/// ClickHouse quotes 64-bit integers in JSON output by default.
pub fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_replace_tables() {
        let q = "INSERT INTO @@table_otel_traces@@ SELECT * FROM @@table_profiling_stacks@@";
        assert_eq!(replace_tables(q, false), "INSERT INTO otel_traces SELECT * FROM profiling_stacks");
        assert_eq!(
            replace_tables(q, true),
            "INSERT INTO otel_traces_distributed SELECT * FROM profiling_stacks_distributed"
        );
        assert_eq!(replace_tables("@@table_metrics_metadata@@", true), "metrics_metadata_distributed");
    }

    #[test]
    fn test_topology_placeholders() {
        let q = "CREATE TABLE t @on_cluster ENGINE = Distributed(@cluster, currentDatabase(), t)";
        let single = Topology::default();
        assert_eq!(single.apply(q), "CREATE TABLE t  ENGINE = Distributed(@cluster, currentDatabase(), t)");
        let clustered = Topology {
            cluster: Some("coroot".into()),
            cloud: false,
        };
        assert_eq!(
            clustered.apply(q),
            "CREATE TABLE t ON CLUSTER coroot ENGINE = Distributed(coroot, currentDatabase(), t)"
        );
    }

    #[test]
    fn test_choose_cluster() {
        let set = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        assert_eq!(choose_cluster(&set(&[])).unwrap(), None);
        assert_eq!(choose_cluster(&set(&["main"])).unwrap().as_deref(), Some("main"));
        assert_eq!(choose_cluster(&set(&["a", "coroot", "default"])).unwrap().as_deref(), Some("coroot"));
        assert_eq!(choose_cluster(&set(&["a", "default"])).unwrap().as_deref(), Some("default"));
        assert!(choose_cluster(&set(&["a", "b"])).is_err());
    }

    #[test]
    fn test_for_host_keeps_port() {
        let client = ClickHouseClient::new(&ClickHouseConfig {
            address: "clickhouse:8123".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.for_host("replica-2").address(), "replica-2:8123");
        let scoped = client.with_database("coroot_p1");
        assert_eq!(scoped.database(), "coroot_p1");
        assert_eq!(client.database(), "default");
    }

    #[test]
    fn test_as_u64() {
        assert_eq!(as_u64(&serde_json::json!(1)), Some(1));
        assert_eq!(as_u64(&serde_json::json!("18446744073709551615")), Some(u64::MAX));
        assert_eq!(as_u64(&serde_json::json!(null)), None);
    }
}
