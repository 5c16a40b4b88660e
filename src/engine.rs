// ============================================================================
// ENGINE
// ============================================================================
// Wires the metric cache, the OTLP collector, the watchers and the notifier
// together, serves the HTTP (and optionally gRPC) endpoints and coordinates a
// graceful shutdown.
// ============================================================================

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use axum::Router;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cache::{Cache, StateDb};
use crate::collector::migration::Ttls;
use crate::collector::{self, ClickHouseStorage, Collector};
use crate::config::{ConfigManager, ObserveConfig};
use crate::constants::VERSION;
use crate::db::Db;
use crate::error::{ErrorContext, NetworkError, ObserveResult};
use crate::model::ProjectRegistry;
use crate::notifications::Notifier;
use crate::prom::PromClientFactory;
use crate::watchers::{Watchers, WorldSource};

const SHUTDOWN_TIMEOUT: StdDuration = StdDuration::from_secs(30);

// ----------------------------------------------------------------------------
// 1. Engine state
// ----------------------------------------------------------------------------

pub struct Engine {
    config: Arc<ConfigManager>,
    worlds: Option<Arc<dyn WorldSource>>,
    shutdown: CancellationToken,
    running: AtomicBool,
    started: Instant,
}

impl Engine {
    pub fn new(config: ObserveConfig) -> Self {
        Self::with_manager(ConfigManager::new(config))
    }

    /// Engine whose configuration can be re-read on SIGHUP.
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> ObserveResult<Self> {
        Ok(Self::with_manager(ConfigManager::from_file(path)?))
    }

    fn with_manager(config: ConfigManager) -> Self {
        Self {
            config: Arc::new(config),
            worlds: None,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Enables the watchers; without a world source they stay off.
    pub fn with_world_source(mut self, worlds: Arc<dyn WorldSource>) -> Self {
        self.worlds = Some(worlds);
        self
    }

    pub fn config(&self) -> Arc<ObserveConfig> {
        self.config.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Relaxed)
    }

    pub fn uptime(&self) -> StdDuration {
        self.started.elapsed()
    }

    pub fn shutdown(&self) {
        info!(target: "cerebro::engine", "shutdown requested");
        self.shutdown.cancel();
    }

    pub async fn run(&self) -> ObserveResult<()> {
        let config = self.config.get();
        config.validate()?;
        info!(
            target: "cerebro::engine",
            version = VERSION,
            data_dir = %config.data_dir.display(),
            projects = config.projects.len(),
            "starting"
        );
        self.running.store(true, AtomicOrdering::Release);

        fs::create_dir_all(&config.data_dir)?;
        let db_path = config.db_path();
        let db = Arc::new(Db::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?);
        let projects = Arc::new(ProjectRegistry::new(config.effective_projects()));
        let sources = Arc::new(PromClientFactory::new());

        let state_path = config.data_dir.join("cache_state.db");
        let state = StateDb::open(&state_path).with_context(|| format!("failed to open {}", state_path.display()))?;
        let cache = Cache::new(
            config.cache.clone(),
            config.cache_dir(),
            state,
            projects.clone(),
            sources.clone(),
        )?;
        let notifier = Notifier::new(db.clone(), projects.clone(), config.notifications.clone())?;

        let collector = config.global_clickhouse.as_ref().map(|ch| {
            let storage = Arc::new(ClickHouseStorage::new(ch.clone(), Ttls::from_config(&config)));
            Collector::new(config.collector.clone(), projects.clone(), storage)
        });
        if collector.is_none() {
            info!(target: "cerebro::engine", "global_clickhouse is not set: otlp ingestion disabled");
        }

        let listener = tokio::net::TcpListener::bind(&config.listen_address)
            .await
            .map_err(|e| NetworkError::Serve {
                addr: config.listen_address.clone(),
                message: e.to_string(),
            })?;
        info!(target: "cerebro::engine", addr = %config.listen_address, "http listening");

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.extend(cache.spawn(self.shutdown.child_token()));
        handles.push(notifier.spawn(self.shutdown.child_token()));

        let watchers = match (&self.worlds, config.watchers.enabled) {
            (Some(worlds), true) => {
                let mut w = Watchers::new(
                    db.clone(),
                    projects.clone(),
                    cache.clone(),
                    worlds.clone(),
                    notifier.clone(),
                    sources.clone(),
                    config.watchers.clone(),
                );
                if let Some(c) = &collector {
                    w = w.with_collector(c.clone(), config.clickhouse_space_manager.clone());
                }
                Some(Arc::new(w))
            }
            (None, true) => {
                warn!(target: "cerebro::engine", "no world source configured: watchers disabled");
                None
            }
            _ => None,
        };

        if let Some(c) = &collector {
            handles.push(tokio::spawn(c.clone().run_migrations()));
            if watchers.is_none() {
                handles.push(spawn_space_manager(c.clone(), &config, self.shutdown.child_token()));
            }
            #[cfg(feature = "grpc")]
            if !config.grpc_listen_address.is_empty() {
                let addr = config
                    .grpc_listen_address
                    .parse::<std::net::SocketAddr>()
                    .map_err(|e| NetworkError::Serve {
                        addr: config.grpc_listen_address.clone(),
                        message: e.to_string(),
                    })?;
                let (c, token) = (c.clone(), self.shutdown.child_token());
                handles.push(tokio::spawn(async move {
                    if let Err(e) = collector::grpc::serve(c, addr, token).await {
                        error!(target: "cerebro::engine", error = %e, "grpc server failed");
                    }
                }));
            }
        }
        if let Some(w) = watchers {
            handles.extend(w.spawn(self.shutdown.child_token()));
        }

        handles.push(self.spawn_signal_handler(projects.clone(), collector.clone()));

        let app = build_router(collector.clone(), &config.url_base_path);

        let token = self.shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .map_err(|e| NetworkError::Serve {
                addr: config.listen_address.clone(),
                message: e.to_string(),
            });
        if let Err(e) = &served {
            error!(target: "cerebro::engine", error = %e, "http server failed");
        }

        self.stop(collector, handles).await;
        served?;
        Ok(())
    }

    async fn stop(&self, collector: Option<Arc<Collector>>, handles: Vec<JoinHandle<()>>) {
        info!(target: "cerebro::engine", "starting graceful shutdown");
        let started = Instant::now();
        self.shutdown.cancel();
        self.running.store(false, AtomicOrdering::Release);

        if let Some(c) = collector {
            c.close().await;
        }
        let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(handles)).await;
        if joined.is_err() {
            warn!(target: "cerebro::engine", timeout = ?SHUTDOWN_TIMEOUT, "background tasks did not stop in time");
        }
        info!(
            target: "cerebro::engine",
            duration_ms = started.elapsed().as_millis() as u64,
            "shutdown complete"
        );
    }

    /// SIGTERM and SIGINT stop the engine, SIGHUP reloads the project list.
    fn spawn_signal_handler(&self, projects: Arc<ProjectRegistry>, collector: Option<Arc<Collector>>) -> JoinHandle<()> {
        let token = self.shutdown.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let (mut sigterm, mut sigint, mut sighup) = match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::hangup()),
            ) {
                (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
                _ => {
                    error!(target: "cerebro::engine", "failed to install signal handlers");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sigterm.recv() => {
                        info!(target: "cerebro::engine", "received SIGTERM");
                        break;
                    }
                    _ = sigint.recv() => {
                        info!(target: "cerebro::engine", "received SIGINT");
                        break;
                    }
                    _ = sighup.recv() => match config.reload() {
                        Ok(cfg) => {
                            projects.replace(cfg.effective_projects());
                            if let Some(c) = &collector {
                                c.projects_changed();
                            }
                            info!(target: "cerebro::engine", projects = cfg.projects.len(), "configuration reloaded");
                        }
                        Err(e) => error!(target: "cerebro::engine", error = %e, "failed to reload configuration"),
                    },
                }
            }
            token.cancel();
        })
    }
}

fn spawn_space_manager(collector: Arc<Collector>, config: &ObserveConfig, shutdown: CancellationToken) -> JoinHandle<()> {
    let cfg = config.clickhouse_space_manager.clone();
    tokio::spawn(async move {
        if !cfg.enabled {
            return;
        }
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => collector.check_disk_space(&cfg).await,
            }
        }
    })
}

// ----------------------------------------------------------------------------
// 2. HTTP routes
// ----------------------------------------------------------------------------

/// OTLP receiver (when a collector runs) plus `/metrics` and `/health`,
/// mounted under `base_path`.
pub fn build_router(collector: Option<Arc<Collector>>, base_path: &str) -> Router {
    let app = match collector {
        Some(c) => collector::http::router(c),
        None => collector::http::status_router(),
    };
    let app = app.layer(TraceLayer::new_for_http());
    let base = base_path.trim_end_matches('/');
    if base.is_empty() {
        return app;
    }
    if base.starts_with('/') {
        Router::new().nest(base, app)
    } else {
        Router::new().nest(&format!("/{base}"), app)
    }
}
