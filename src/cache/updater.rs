// ============================================================================
// CACHE UPDATER
// ============================================================================
// One worker per project with a metric source. Every refresh interval the
// worker reconciles query states with the expected queries and downloads
// the missing hour-aligned intervals of each query.
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queries::{expected_queries, ExpectedQuery};
use super::{chunk_file_name, chunk_jitter, query_id, Cache, QueryState};
use crate::chunk::{self, ChunkMeta};
use crate::constants::{CHUNK_DURATION, DEFAULT_REFRESH_INTERVAL, QUERY_TIMEOUT, UPDATER_INTERVAL_SECS};
use crate::error::{ObserveError, ObserveResult};
use crate::model::{MetricValues, Project, ProjectId};
use crate::prom::MetricSource;
use crate::telemetry::metrics;
use crate::timeseries::{Duration, Time};

// ----------------------------------------------------------------------------
// 1. Intervals
// ----------------------------------------------------------------------------

/// Inclusive range of point timestamps covered by one download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    pub from: Time,
    pub to: Time,
}

impl Interval {
    /// The interval covers its whole chunk.
    pub fn is_finalized(&self, step: Duration) -> bool {
        self.to == self.from + CHUNK_DURATION - step
    }
}

/// Splits `(last_saved, now]` into chunk-aligned intervals.
///
/// Chunk boundaries are hours shifted by `jitter`. The first interval starts
/// at the boundary preceding the first missing point, so a partially
/// downloaded chunk is fetched again as a whole.
pub fn calc_intervals(last_saved: Time, step: Duration, now: Time, jitter: Duration) -> Vec<Interval> {
    let to = now.truncate(step);
    let from = last_saved + step;
    if to < from {
        return Vec::new();
    }
    let from = from.truncate(step);

    let mut res = Vec::new();
    let mut f = (from - jitter).truncate(CHUNK_DURATION) + jitter;
    while f <= to {
        let end = (f + CHUNK_DURATION).min(to) - step;
        if f <= end {
            res.push(Interval { from: f, to: end });
        }
        f += CHUNK_DURATION;
    }
    res
}

// ----------------------------------------------------------------------------
// 2. Project workers
// ----------------------------------------------------------------------------

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps exactly one worker running for every project with a metric source.
pub(crate) async fn run(cache: Arc<Cache>, shutdown: CancellationToken) {
    let mut workers: HashMap<ProjectId, Worker> = HashMap::new();
    let mut ticker = tokio::time::interval(StdDuration::from_secs(UPDATER_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut actual = HashSet::new();
        for project in cache.projects.list().iter() {
            if cache.sources.source(project).is_none() {
                continue;
            }
            actual.insert(project.id.clone());
            if workers.get(&project.id).is_some_and(|w| !w.handle.is_finished()) {
                continue;
            }
            info!(target: "cerebro::cache", project = %project.id, "starting cache updater");
            let token = shutdown.child_token();
            let handle = tokio::spawn(worker(cache.clone(), project.id.clone(), token.clone()));
            workers.insert(project.id.clone(), Worker { token, handle });
        }

        workers.retain(|id, w| {
            if actual.contains(id) {
                return true;
            }
            info!(target: "cerebro::cache", project = %id, "stopping cache updater");
            w.token.cancel();
            false
        });
    }
    for w in workers.values() {
        w.token.cancel();
    }
}

async fn worker(cache: Arc<Cache>, project_id: ProjectId, token: CancellationToken) {
    loop {
        let started = Instant::now();
        let Some(project) = cache.projects.get(&project_id) else {
            return;
        };
        let Some(source) = cache.sources.source(&project) else {
            return;
        };
        let step = project
            .prometheus
            .as_ref()
            .map(|p| p.step())
            .unwrap_or(DEFAULT_REFRESH_INTERVAL);

        match update_project(&cache, &project, source, step, &token).await {
            Ok(()) => {
                debug!(
                    target: "cerebro::cache",
                    project = %project_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "cache refreshed"
                );
                cache.publish_update(&project_id);
            }
            Err(e) => error!(target: "cerebro::cache", project = %project_id, error = %e, "cache refresh failed"),
        }

        let pause = step.to_std().saturating_sub(started.elapsed());
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// One refresh iteration of a project.
pub(crate) async fn update_project(
    cache: &Arc<Cache>,
    project: &Project,
    source: Arc<dyn MetricSource>,
    step: Duration,
    token: &CancellationToken,
) -> ObserveResult<()> {
    let now = Time::now();
    let backfill = Duration::from_std(cache.config().backfill_window);
    let mut states = cache.state.load(&project.id)?;

    let mut actual = Vec::new();
    for q in expected_queries(project) {
        let state = match states.remove(&q.query) {
            Some(s) => s,
            None => {
                let s = QueryState {
                    project_id: project.id.clone(),
                    query: q.query.clone(),
                    last_ts: now - backfill,
                    last_error: String::new(),
                };
                cache.state.save(&s)?;
                s
            }
        };
        actual.push((q, state));
    }
    for obsolete in states.into_values() {
        if let Err(e) = cache.state.delete(&obsolete) {
            warn!(target: "cerebro::cache", project = %project.id, error = %e, "failed to delete obsolete query state");
        }
    }

    stream::iter(actual)
        .for_each_concurrent(cache.config().query_concurrency, |(q, state)| {
            let source = source.clone();
            async move { download(cache, source, step, q, state, token).await }
        })
        .await;

    if token.is_cancelled() {
        return Err(ObserveError::ShuttingDown);
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 3. Download
// ----------------------------------------------------------------------------

async fn download(
    cache: &Arc<Cache>,
    source: Arc<dyn MetricSource>,
    step: Duration,
    q: ExpectedQuery,
    mut state: QueryState,
    token: &CancellationToken,
) {
    let project_id = state.project_id.clone();
    let qid = query_id(&q.query);
    let jitter = chunk_jitter(&project_id, if q.is_recording_rule { "" } else { &qid });
    let points_count = (CHUNK_DURATION / step) as usize;

    for interval in calc_intervals(state.last_ts, step, Time::now() - step, jitter) {
        if token.is_cancelled() {
            return;
        }
        let res = tokio::time::timeout(
            QUERY_TIMEOUT.to_std(),
            source.query_range(&q.query, interval.from, interval.to, step),
        )
        .await;
        let values = match res {
            Ok(Ok(values)) => values,
            Ok(Err(e)) => return save_error(cache, &mut state, e.to_string()),
            Err(_) => return save_error(cache, &mut state, format!("timed out after {}", QUERY_TIMEOUT)),
        };

        let meta = match write_chunk(cache, &project_id, &qid, interval, points_count, step, values).await {
            Ok(meta) => meta,
            Err(e) => {
                error!(target: "cerebro::cache", project = %project_id, query = %q.query, error = %e, "failed to write chunk");
                return;
            }
        };
        cache.insert_chunk(&project_id, &qid, meta);
        metrics().cache_chunks_written.inc();

        state.last_ts = interval.to;
        state.last_error.clear();
        if let Err(e) = cache.state.save(&state) {
            error!(target: "cerebro::cache", project = %project_id, error = %e, "failed to save query state");
            return;
        }
    }
}

fn save_error(cache: &Cache, state: &mut QueryState, message: String) {
    warn!(target: "cerebro::cache", project = %state.project_id, query = %state.query, error = %message, "query failed");
    metrics().cache_query_errors.inc();
    state.last_error = message;
    if let Err(e) = cache.state.save(state) {
        error!(target: "cerebro::cache", project = %state.project_id, error = %e, "failed to save query state");
    }
}

async fn write_chunk(
    cache: &Cache,
    project_id: &ProjectId,
    qid: &str,
    interval: Interval,
    points_count: usize,
    step: Duration,
    values: Vec<MetricValues>,
) -> ObserveResult<ChunkMeta> {
    let dir = cache.project_dir(project_id);
    let path = dir.join(chunk_file_name(project_id, qid, interval.from, points_count, step));
    let finalized = interval.is_finalized(step);

    // the metric name is dropped so recording rules and plain queries share a shape
    let values: Vec<MetricValues> = values
        .into_iter()
        .map(|mut mv| {
            if mv.labels.remove("__name__").is_some() {
                MetricValues::new(mv.labels, mv.values)
            } else {
                mv
            }
        })
        .collect();
    let metrics_count = values.len() as u32;

    let write_path = path.clone();
    tokio::task::spawn_blocking(move || -> ObserveResult<()> {
        fs::create_dir_all(&dir)?;
        chunk::write(&write_path, interval.from, points_count, step, finalized, &values)?;
        Ok(())
    })
    .await
    .map_err(|e| ObserveError::Internal(format!("chunk writer panicked: {e}")))??;

    Ok(ChunkMeta {
        path,
        from: interval.from,
        points_count: points_count as u32,
        step,
        finalized,
        metrics_count,
        created: Time::now(),
    })
}
