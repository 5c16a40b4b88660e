// ============================================================================
// OTLP COLLECTOR
// ============================================================================
// Receives traces, logs, metrics and profiles, resolves the project from the
// api key, appends rows to per-project per-signal batches and flushes them
// to ClickHouse once the project's tables have been migrated.
// ============================================================================

pub mod attributes;
pub mod batch;
pub mod clickhouse;
pub mod decode;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod http;
pub mod logs;
pub mod metrics;
pub mod migration;
pub mod profiles;
pub mod space_manager;
pub mod traces;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use dashmap::DashMap;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use parking_lot::Mutex;
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ClickHouseConfig, CollectorConfig, SpaceManagerConfig};
use crate::constants::MIGRATION_TIMEOUT_SECS;
use crate::error::CollectorError;
use crate::model::{Project, ProjectId, ProjectRegistry};

use self::batch::{Batch, Columns, Sink};
use self::clickhouse::ClickHouseClient;
use self::migration::{Backoff, Ttls};
use self::profiles::Profile;

// ----------------------------------------------------------------------------
// 1. Signals
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Signal {
    Traces,
    Logs,
    Profiles,
    Metrics,
}

impl Signal {
    pub const ALL: [Signal; 4] = [Signal::Traces, Signal::Logs, Signal::Profiles, Signal::Metrics];

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Logs => "logs",
            Signal::Profiles => "profiles",
            Signal::Metrics => "metrics",
        }
    }

    fn columns(self) -> Vec<Columns> {
        match self {
            Signal::Traces => traces::columns(),
            Signal::Logs => logs::columns(),
            Signal::Profiles => profiles::columns(),
            Signal::Metrics => metrics::columns(),
        }
    }
}

// ----------------------------------------------------------------------------
// 2. Storage backend
// ----------------------------------------------------------------------------

/// Where project tables live.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Creates or updates the tables of a project.
    async fn migrate(&self, project_id: &ProjectId) -> Result<(), CollectorError>;

    async fn insert(&self, project_id: &ProjectId, table: &str, body: Vec<u8>) -> Result<(), CollectorError>;

    /// Frees disk space if the backend is running out of it.
    async fn check_disk_space(&self, _cfg: &SpaceManagerConfig) -> Result<(), CollectorError> {
        Ok(())
    }
}

/// Database holding the tables of a project on the shared ClickHouse.
pub fn project_database(project_id: &ProjectId) -> String {
    format!("coroot_{project_id}")
}

/// ClickHouse over HTTP, one database per project. The connection and
/// topology are established lazily and retried on the next call after a
/// failure.
pub struct ClickHouseStorage {
    cfg: ClickHouseConfig,
    ttls: Ttls,
    server: OnceCell<ClickHouseClient>,
    projects: DashMap<ProjectId, ClickHouseClient>,
}

impl ClickHouseStorage {
    pub fn new(cfg: ClickHouseConfig, ttls: Ttls) -> Self {
        Self {
            cfg,
            ttls,
            server: OnceCell::new(),
            projects: DashMap::new(),
        }
    }

    async fn server(&self) -> Result<&ClickHouseClient, CollectorError> {
        self.server
            .get_or_try_init(|| ClickHouseClient::connect(&self.cfg))
            .await
    }

    async fn client(&self, project_id: &ProjectId) -> Result<ClickHouseClient, CollectorError> {
        if let Some(c) = self.projects.get(project_id) {
            return Ok(c.value().clone());
        }
        let client = self.server().await?.with_database(&project_database(project_id));
        Ok(self.projects.entry(project_id.clone()).or_insert(client).value().clone())
    }
}

#[async_trait]
impl Storage for ClickHouseStorage {
    async fn migrate(&self, project_id: &ProjectId) -> Result<(), CollectorError> {
        let client = self.client(project_id).await?;
        migration::migrate(&client, &self.ttls).await
    }

    async fn insert(&self, project_id: &ProjectId, table: &str, body: Vec<u8>) -> Result<(), CollectorError> {
        self.client(project_id).await?.insert(table, body).await
    }

    async fn check_disk_space(&self, cfg: &SpaceManagerConfig) -> Result<(), CollectorError> {
        let server = self.server().await?;
        let databases: BTreeSet<String> = self.projects.iter().map(|e| e.value().database().to_string()).collect();
        space_manager::run(server, cfg, &databases).await
    }
}

/// Batch sink of one project: refuses inserts until the tables exist.
struct ProjectSink {
    project_id: ProjectId,
    shared: Arc<Shared>,
}

#[async_trait]
impl Sink for ProjectSink {
    async fn insert(&self, table: &str, body: Vec<u8>) -> Result<(), CollectorError> {
        if !self.shared.migration_done.contains_key(&self.project_id) {
            return Err(CollectorError::TablesNotReady {
                project_id: self.project_id.to_string(),
            });
        }
        self.shared.storage.insert(&self.project_id, table, body).await
    }
}

struct Shared {
    storage: Arc<dyn Storage>,
    migration_done: DashMap<ProjectId, ()>,
}

// ----------------------------------------------------------------------------
// 3. Collector
// ----------------------------------------------------------------------------

pub struct Collector {
    cfg: CollectorConfig,
    projects: Arc<ProjectRegistry>,
    shared: Arc<Shared>,
    batches: DashMap<(ProjectId, Signal), Arc<Batch>>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    projects_changed: Notify,
}

impl Collector {
    pub fn new(cfg: CollectorConfig, projects: Arc<ProjectRegistry>, storage: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            projects,
            shared: Arc::new(Shared {
                storage,
                migration_done: DashMap::new(),
            }),
            batches: DashMap::new(),
            tickers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            projects_changed: Notify::new(),
        })
    }

    /// Resolves the project of an ingestion request.
    pub fn get_project(&self, api_key: &str) -> Result<Arc<Project>, CollectorError> {
        let projects = self.projects.list();
        if api_key.is_empty() {
            if projects.len() == 1 {
                return Ok(projects[0].clone());
            }
            if let Some(p) = projects.iter().find(|p| p.name == "default") {
                return Ok(p.clone());
            }
            return Err(CollectorError::UnknownApiKey);
        }
        projects
            .iter()
            .find(|p| p.has_api_key(api_key))
            .cloned()
            .ok_or(CollectorError::UnknownApiKey)
    }

    pub fn is_migrated(&self, project_id: &ProjectId) -> bool {
        self.shared.migration_done.contains_key(project_id)
    }

    fn batch(&self, project_id: &ProjectId, signal: Signal) -> Arc<Batch> {
        let key = (project_id.clone(), signal);
        if let Some(b) = self.batches.get(&key) {
            return b.clone();
        }
        self.batches
            .entry(key)
            .or_insert_with(|| {
                let sink = Arc::new(ProjectSink {
                    project_id: project_id.clone(),
                    shared: self.shared.clone(),
                });
                let b = Batch::new(signal, project_id.clone(), self.cfg.batch_limit, signal.columns(), sink);
                let ticker = b.spawn_ticker(self.cfg.batch_timeout, self.shutdown.child_token());
                self.tickers.lock().push(ticker);
                b
            })
            .clone()
    }

    pub async fn ingest_traces(&self, project_id: &ProjectId, req: &ExportTraceServiceRequest) -> usize {
        let mut n = 0;
        self.batch(project_id, Signal::Traces)
            .add(|t| n = traces::append(t, req))
            .await;
        n
    }

    pub async fn ingest_logs(&self, project_id: &ProjectId, req: &ExportLogsServiceRequest) -> usize {
        let mut n = 0;
        self.batch(project_id, Signal::Logs).add(|t| n = logs::append(t, req)).await;
        n
    }

    pub async fn ingest_metrics(&self, project_id: &ProjectId, req: &ExportMetricsServiceRequest) -> usize {
        let mut n = 0;
        self.batch(project_id, Signal::Metrics)
            .add(|t| n = metrics::append(t, req))
            .await;
        n
    }

    pub async fn ingest_profile(
        &self,
        project_id: &ProjectId,
        service_name: &str,
        labels: &BTreeMap<String, String>,
        profile: &Profile,
    ) -> usize {
        let mut n = 0;
        self.batch(project_id, Signal::Profiles)
            .add(|t| n = profiles::append(t, service_name, labels, profile))
            .await;
        n
    }

    /// Wakes the migration loop after the project list changed.
    pub fn projects_changed(&self) {
        self.projects_changed.notify_one();
    }

    /// Migrates every project whose tables are not ready yet; returns false
    /// if any migration failed.
    pub async fn migrate_pending(&self) -> bool {
        let mut ok = true;
        let configured: HashSet<ProjectId> = self.projects.list().iter().map(|p| p.id.clone()).collect();
        self.shared.migration_done.retain(|id, _| configured.contains(id));
        for id in configured {
            if self.is_migrated(&id) {
                continue;
            }
            let res = tokio::time::timeout(
                StdDuration::from_secs(MIGRATION_TIMEOUT_SECS),
                self.shared.storage.migrate(&id),
            )
            .await
            .unwrap_or_else(|_| {
                Err(CollectorError::MigrationFailed {
                    message: format!("timed out after {MIGRATION_TIMEOUT_SECS}s"),
                })
            });
            match res {
                Ok(()) => {
                    info!(target: "cerebro::collector", project = %id, "clickhouse tables are ready");
                    self.shared.migration_done.insert(id, ());
                }
                Err(e) => {
                    error!(target: "cerebro::collector", project = %id, error = %e, "failed to create or update clickhouse tables");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Keeps project tables migrated: retries failures with backoff and
    /// re-runs whenever the project list changes.
    pub async fn run_migrations(self: Arc<Self>) {
        let mut backoff = Backoff::default();
        loop {
            let delay = if self.migrate_pending().await {
                backoff.reset();
                None
            } else {
                let d = backoff.next_delay();
                warn!(target: "cerebro::collector", next_attempt = %humantime::format_duration(d), "clickhouse tables migration failed");
                Some(d)
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.projects_changed.notified() => {}
                _ = async {
                    match delay {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
    }

    pub async fn check_disk_space(&self, cfg: &SpaceManagerConfig) {
        if !cfg.enabled {
            return;
        }
        if let Err(e) = self.shared.storage.check_disk_space(cfg).await {
            error!(target: "cerebro::collector", error = %e, "space manager failed");
        }
    }

    /// Stops the tickers; each flushes its batch one last time.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let tickers: Vec<_> = std::mem::take(&mut *self.tickers.lock());
        for t in tickers {
            if let Err(e) = t.await {
                error!(target: "cerebro::collector", error = %e, "batch ticker panicked");
            }
        }
        info!(target: "cerebro::collector", "collector closed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::CollectorConfig;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct MemoryStorage {
        pub(crate) inserts: Mutex<Vec<(ProjectId, String, serde_json::Value)>>,
        pub(crate) migrations: AtomicUsize,
        pub(crate) fail_migrations: AtomicBool,
    }

    #[async_trait]
    impl Storage for MemoryStorage {
        async fn migrate(&self, _project_id: &ProjectId) -> Result<(), CollectorError> {
            self.migrations.fetch_add(1, Ordering::SeqCst);
            if self.fail_migrations.load(Ordering::SeqCst) {
                return Err(CollectorError::clickhouse("connection refused"));
            }
            Ok(())
        }

        async fn insert(&self, project_id: &ProjectId, table: &str, body: Vec<u8>) -> Result<(), CollectorError> {
            let body = serde_json::from_slice(&body).map_err(|e| CollectorError::decode(e.to_string()))?;
            self.inserts.lock().push((project_id.clone(), table.to_string(), body));
            Ok(())
        }
    }

    impl MemoryStorage {
        pub(crate) fn tables(&self) -> Vec<(String, String)> {
            self.inserts
                .lock()
                .iter()
                .map(|(p, t, _)| (p.to_string(), t.clone()))
                .collect()
        }
    }

    pub(crate) fn project(name: &str, keys: &[&str]) -> Project {
        Project {
            id: name.into(),
            name: name.into(),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        }
    }

    pub(crate) fn collector(projects: Vec<Project>, storage: Arc<MemoryStorage>) -> Arc<Collector> {
        let cfg = CollectorConfig {
            batch_limit: 1,
            batch_timeout: StdDuration::from_secs(3600),
        };
        Collector::new(cfg, Arc::new(ProjectRegistry::new(projects)), storage)
    }

    #[test]
    fn test_tenancy() {
        let storage = Arc::new(MemoryStorage::default());
        let single = collector(vec![project("only", &["k1"])], storage.clone());
        assert_eq!(single.get_project("").unwrap().name, "only");
        assert_eq!(single.get_project("k1").unwrap().name, "only");
        assert!(matches!(single.get_project("nope"), Err(CollectorError::UnknownApiKey)));

        let many = collector(
            vec![project("prod", &["k1"]), project("default", &[]), project("staging", &["k2"])],
            storage.clone(),
        );
        assert_eq!(many.get_project("").unwrap().name, "default");
        assert_eq!(many.get_project("k2").unwrap().name, "staging");

        let no_default = collector(vec![project("a", &["k1"]), project("b", &["k2"])], storage);
        assert!(matches!(no_default.get_project(""), Err(CollectorError::UnknownApiKey)));
    }

    #[tokio::test]
    async fn test_rows_are_dropped_until_migrated() {
        let storage = Arc::new(MemoryStorage::default());
        let c = collector(vec![project("p1", &["k1"])], storage.clone());
        let p1 = ProjectId::new("p1");

        assert_eq!(c.ingest_traces(&p1, &traces::tests::request()).await, 1);
        assert!(storage.tables().is_empty());

        assert!(c.migrate_pending().await);
        assert!(c.is_migrated(&p1));
        assert_eq!(c.ingest_traces(&p1, &traces::tests::request()).await, 1);
        assert_eq!(storage.tables(), vec![("p1".to_string(), traces::TABLE.to_string())]);

        // already migrated projects are skipped
        assert!(c.migrate_pending().await);
        assert_eq!(storage.migrations.load(Ordering::SeqCst), 1);
        c.close().await;
    }

    #[tokio::test]
    async fn test_failed_migration_is_retried() {
        let storage = Arc::new(MemoryStorage::default());
        storage.fail_migrations.store(true, Ordering::SeqCst);
        let c = collector(vec![project("p1", &[])], storage.clone());
        assert!(!c.migrate_pending().await);
        assert!(!c.is_migrated(&"p1".into()));

        storage.fail_migrations.store(false, Ordering::SeqCst);
        assert!(c.migrate_pending().await);
        assert_eq!(storage.migrations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_flushes_pending_rows() {
        let storage = Arc::new(MemoryStorage::default());
        let cfg = CollectorConfig {
            batch_limit: 100,
            batch_timeout: StdDuration::from_secs(3600),
        };
        let c = Collector::new(
            cfg,
            Arc::new(ProjectRegistry::new(vec![project("p1", &[])])),
            storage.clone(),
        );
        c.migrate_pending().await;
        c.ingest_logs(&"p1".into(), &logs::tests::request()).await;
        assert!(storage.tables().is_empty());
        c.close().await;
        assert_eq!(storage.tables(), vec![("p1".to_string(), logs::TABLE.to_string())]);
    }

    /// ClickHouse stand-in recording the `database` of every statement.
    async fn clickhouse_server() -> (String, Arc<Mutex<Vec<(String, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let app = axum::Router::new().fallback(
            move |axum::extract::Query(params): axum::extract::Query<std::collections::HashMap<String, String>>| {
                let s = s.clone();
                async move {
                    let query = params.get("query").cloned().unwrap_or_default();
                    let database = params.get("database").cloned().unwrap_or_default();
                    s.lock().push((database, query.clone()));
                    if query.contains("system.zookeeper") {
                        "{\"result\":0}\n"
                    } else {
                        ""
                    }
                }
            },
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr.to_string(), seen)
    }

    #[tokio::test]
    async fn test_projects_write_to_own_databases() {
        let (address, seen) = clickhouse_server().await;
        let storage = ClickHouseStorage::new(
            ClickHouseConfig {
                address,
                ..Default::default()
            },
            Ttls::from_config(&crate::config::ObserveConfig::default()),
        );
        let (a, b) = (ProjectId::new("tenant_a"), ProjectId::new("tenant_b"));
        storage.migrate(&a).await.unwrap();
        storage.insert(&a, "@@table_otel_logs@@", b"{}".to_vec()).await.unwrap();
        storage.insert(&b, "@@table_otel_logs@@", b"{}".to_vec()).await.unwrap();

        let seen = seen.lock().clone();
        let inserts: Vec<&str> = seen
            .iter()
            .filter(|(_, q)| q.starts_with("INSERT"))
            .map(|(db, _)| db.as_str())
            .collect();
        assert_eq!(inserts, vec!["coroot_tenant_a", "coroot_tenant_b"]);
        assert!(seen
            .iter()
            .any(|(db, q)| db == "default" && q.contains("CREATE DATABASE IF NOT EXISTS `coroot_tenant_a`")));
        assert!(seen
            .iter()
            .filter(|(_, q)| q.trim_start().starts_with("CREATE TABLE"))
            .all(|(db, _)| db == "coroot_tenant_a"));
    }

    #[test]
    fn test_signal_names() {
        let names: Vec<&str> = Signal::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["traces", "logs", "profiles", "metrics"]);
    }
}
