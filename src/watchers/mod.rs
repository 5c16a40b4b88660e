// ============================================================================
// WATCHERS
// ============================================================================
// Derives deployments, incidents and alerts from the world model every time
// the metric cache finishes a back-fill iteration for a project.
// ============================================================================

pub mod alerts;
pub mod deployments;
pub mod incidents;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, CacheClient};
use crate::collector::Collector;
use crate::config::{SpaceManagerConfig, WatchersConfig};
use crate::constants::{SPACE_MANAGER_INTERVAL, UPDATES_CHANNEL_CAPACITY, WATCHER_WINDOW};
use crate::db::Db;
use crate::error::ObserveResult;
use crate::logging::PerfTimer;
use crate::model::{Project, ProjectId, ProjectRegistry, World};
use crate::notifications::Notifier;
use crate::prom::MetricSourceFactory;
use crate::timeseries::{Duration, Time};

use self::alerts::AlertEvaluator;
use self::deployments::DeploymentWatcher;
use self::incidents::IncidentWatcher;

const ITERATION_SLOW_MS: u64 = 10_000;

// ----------------------------------------------------------------------------
// 1. World source
// ----------------------------------------------------------------------------

/// Builds the world model of a project from cached metrics. The auditor
/// output is expected to be part of the returned world.
#[async_trait]
pub trait WorldSource: Send + Sync {
    async fn load_world(
        &self,
        project: &Project,
        cache: &CacheClient,
        from: Time,
        to: Time,
        step: Duration,
    ) -> ObserveResult<Option<World>>;
}

// ----------------------------------------------------------------------------
// 2. Watcher loop
// ----------------------------------------------------------------------------

pub struct Watchers {
    db: Arc<Db>,
    projects: Arc<ProjectRegistry>,
    cache: Arc<Cache>,
    worlds: Arc<dyn WorldSource>,
    cfg: WatchersConfig,
    collector: Option<Arc<Collector>>,
    space_manager: SpaceManagerConfig,
    deployments: DeploymentWatcher,
    incidents: IncidentWatcher,
    alerts: tokio::sync::Mutex<AlertEvaluator>,
    /// Projects queued for processing; further updates are coalesced.
    pending: Mutex<HashSet<ProjectId>>,
    last_space_check: Mutex<Option<Instant>>,
}

impl Watchers {
    pub fn new(
        db: Arc<Db>,
        projects: Arc<ProjectRegistry>,
        cache: Arc<Cache>,
        worlds: Arc<dyn WorldSource>,
        notifier: Arc<Notifier>,
        sources: Arc<dyn MetricSourceFactory>,
        cfg: WatchersConfig,
    ) -> Self {
        Self {
            deployments: DeploymentWatcher::new(db.clone(), notifier.clone()),
            incidents: IncidentWatcher::new(db.clone(), notifier.clone()),
            alerts: tokio::sync::Mutex::new(AlertEvaluator::new(db.clone(), notifier, sources)),
            db,
            projects,
            cache,
            worlds,
            cfg,
            collector: None,
            space_manager: SpaceManagerConfig::default(),
            pending: Mutex::new(HashSet::new()),
            last_space_check: Mutex::new(None),
        }
    }

    /// Runs the ClickHouse space manager from the watcher loop.
    pub fn with_collector(mut self, collector: Arc<Collector>, space_manager: SpaceManagerConfig) -> Self {
        self.collector = Some(collector);
        self.space_manager = space_manager;
        self
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let (tx, rx) = flume::bounded::<ProjectId>(UPDATES_CHANNEL_CAPACITY);

        let this = self.clone();
        let token = shutdown.clone();
        let consumer = tokio::spawn(async move {
            let updates = this.cache.updates();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = updates.recv_async() => match res {
                        Ok(project_id) => {
                            this.enqueue(project_id, &tx);
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        let this = self;
        let worker = tokio::spawn(async move {
            info!(target: "cerebro::watchers", "watchers started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = rx.recv_async() => match res {
                        Ok(project_id) => this.process(&project_id).await,
                        Err(_) => break,
                    },
                }
            }
            info!(target: "cerebro::watchers", "watchers stopped");
        });

        vec![consumer, worker]
    }

    /// Queues a project unless it is already waiting. Returns false when the
    /// update was coalesced or dropped.
    fn enqueue(&self, project_id: ProjectId, tx: &flume::Sender<ProjectId>) -> bool {
        if !self.pending.lock().insert(project_id.clone()) {
            return false;
        }
        if tx.try_send(project_id.clone()).is_err() {
            self.pending.lock().remove(&project_id);
            warn!(target: "cerebro::watchers", project = %project_id, "watcher queue is full, dropping update");
            return false;
        }
        true
    }

    async fn process(&self, project_id: &ProjectId) {
        self.pending.lock().remove(project_id);
        if !self.db.get_primary_lock() {
            debug!(target: "cerebro::watchers", project = %project_id, "not the primary replica: skipping");
            return;
        }
        if let Err(e) = self.handle_project_update(project_id).await {
            error!(
                target: "cerebro::watchers",
                project = %project_id,
                category = e.category(),
                hint = ?e.recovery_hint(),
                error = %e,
                "watcher iteration failed"
            );
        }
        self.maybe_check_disk_space().await;
    }

    pub async fn handle_project_update(&self, project_id: &ProjectId) -> ObserveResult<()> {
        let Some(project) = self.projects.get(project_id) else {
            debug!(target: "cerebro::watchers", project = %project_id, "unknown project");
            return Ok(());
        };
        let client = self.cache.client(project_id);
        let to = client.get_to();
        if to.is_zero() {
            return Ok(());
        }
        let step = client.get_step()?;
        let from = to - WATCHER_WINDOW;

        let timer = PerfTimer::with_threshold("watchers.iteration", ITERATION_SLOW_MS);
        let Some(world) = self.worlds.load_world(&project, &client, from, to, step).await? else {
            debug!(target: "cerebro::watchers", project = %project_id, "no world for the window");
            return Ok(());
        };

        let now = Time::now();
        let deployments = async {
            if self.cfg.check_deployments {
                self.deployments.check(&project, &world).await;
            }
        };
        let alerts = async {
            self.alerts.lock().await.check(&project, &world, now).await;
        };
        tokio::join!(self.incidents.check(&project, &world, now), deployments, alerts);

        info!(
            target: "cerebro::watchers",
            project = %project_id,
            applications = world.applications.len(),
            elapsed_ms = timer.stop(),
            "iteration done"
        );
        Ok(())
    }

    async fn maybe_check_disk_space(&self) {
        let Some(collector) = &self.collector else {
            return;
        };
        let interval = self.space_manager.interval.max(SPACE_MANAGER_INTERVAL.to_std());
        {
            let mut last = self.last_space_check.lock();
            if last.is_some_and(|t| t.elapsed() < interval) {
                return;
            }
            *last = Some(Instant::now());
        }
        collector.check_disk_space(&self.space_manager).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{test_cache, write_test_chunk, NoSources};
    use crate::config::NotificationsConfig;
    use crate::model::project::PrometheusIntegration;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeWorlds {
        calls: Mutex<Vec<(Time, Time, Duration)>>,
    }

    #[async_trait]
    impl WorldSource for FakeWorlds {
        async fn load_world(
            &self,
            _project: &Project,
            _cache: &CacheClient,
            from: Time,
            to: Time,
            step: Duration,
        ) -> ObserveResult<Option<World>> {
            self.calls.lock().push((from, to, step));
            Ok(Some(World::new(from, to, step)))
        }
    }

    fn project() -> Project {
        Project {
            id: ProjectId::new("p1"),
            name: "prod".into(),
            prometheus: Some(PrometheusIntegration {
                url: "http://127.0.0.1:9".into(),
                refresh_interval: std::time::Duration::from_secs(30),
                tls_skip_verify: false,
                basic_auth: None,
                extra_selector: String::new(),
                custom_headers: Vec::new(),
                remote_write_url: String::new(),
            }),
            ..Default::default()
        }
    }

    fn watchers(dir: &std::path::Path) -> (Arc<Watchers>, Arc<Cache>, Arc<FakeWorlds>) {
        let projects = Arc::new(ProjectRegistry::new(vec![project()]));
        let cache = test_cache(dir, vec![project()]);
        let db = Arc::new(Db::open_in_memory().unwrap());
        let notifier = Notifier::new(db.clone(), projects.clone(), NotificationsConfig::default()).unwrap();
        let worlds = Arc::new(FakeWorlds::default());
        let w = Watchers::new(
            db,
            projects,
            cache.clone(),
            worlds.clone(),
            notifier,
            Arc::new(NoSources),
            WatchersConfig::default(),
        );
        (Arc::new(w), cache, worlds)
    }

    #[tokio::test]
    async fn test_update_loads_last_hour() {
        let dir = tempfile::tempdir().unwrap();
        let (w, cache, worlds) = watchers(dir.path());
        let step = Duration(30);
        write_test_chunk(&cache, "p1", "up", Time(36_000), 240, step, true, 1.0);

        let pid = ProjectId::new("p1");
        w.handle_project_update(&pid).await.unwrap();

        let to = cache.client(&pid).get_to();
        assert_eq!(to, Time(36_000) + step * 239 - Duration(30));
        assert_eq!(*worlds.calls.lock(), vec![(to - Duration::HOUR, to, step)]);
    }

    #[tokio::test]
    async fn test_update_without_chunks_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (w, _cache, worlds) = watchers(dir.path());
        w.handle_project_update(&ProjectId::new("p1")).await.unwrap();
        w.handle_project_update(&ProjectId::new("unknown")).await.unwrap();
        assert!(worlds.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pending_updates_are_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let (w, _cache, _worlds) = watchers(dir.path());
        let (tx, rx) = flume::bounded(UPDATES_CHANNEL_CAPACITY);

        assert!(w.enqueue(ProjectId::new("p1"), &tx));
        assert!(!w.enqueue(ProjectId::new("p1"), &tx));
        assert!(w.enqueue(ProjectId::new("p2"), &tx));
        assert_eq!(rx.len(), 2);

        let first = rx.recv().unwrap();
        w.pending.lock().remove(&first);
        assert!(w.enqueue(first, &tx));
    }

    #[tokio::test]
    async fn test_full_queue_drops_update() {
        let dir = tempfile::tempdir().unwrap();
        let (w, _cache, _worlds) = watchers(dir.path());
        let (tx, _rx) = flume::bounded(1);

        assert!(w.enqueue(ProjectId::new("p1"), &tx));
        assert!(!w.enqueue(ProjectId::new("p2"), &tx));
        assert!(!w.pending.lock().contains(&ProjectId::new("p2")));
    }
}
