//! Read side of the cache, scoped to one project.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{query_id, Cache};
use crate::chunk;
use crate::constants::DEFAULT_REFRESH_INTERVAL;
use crate::error::{CacheError, ObserveError, ObserveResult};
use crate::model::{MetricValues, ProjectId};
use crate::prom::MetricSource;
use crate::timeseries::{Duration, Time};

/// Download health of a project.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStatus {
    /// First non-empty error of the project's query states.
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct CacheClient {
    cache: Arc<Cache>,
    project_id: ProjectId,
    refresh_interval: Duration,
}

impl CacheClient {
    pub(crate) fn new(cache: Arc<Cache>, project_id: ProjectId) -> Self {
        let refresh_interval = cache
            .projects
            .get(&project_id)
            .and_then(|p| p.prometheus.as_ref().map(|p| p.step()))
            .unwrap_or(DEFAULT_REFRESH_INTERVAL);
        Self {
            cache,
            project_id,
            refresh_interval,
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// Merges every chunk of `query` intersecting `[from, to]` into series
    /// shaped as `(from, points, step)`. Corrupted chunks are skipped.
    pub fn query_range_blocking(&self, query: &str, from: Time, to: Time, step: Duration) -> ObserveResult<Vec<MetricValues>> {
        let from = from.truncate(step);
        let to = to.truncate(step);
        if to < from {
            return Ok(Vec::new());
        }
        let points_count = ((to - from) / step) as usize + 1;

        let index = self.cache.index.read();
        let project = index.get(&self.project_id).ok_or_else(|| CacheError::ProjectNotFound {
            project_id: self.project_id.to_string(),
        })?;
        let q = project
            .queries
            .get(&query_id(query))
            .ok_or_else(|| CacheError::QueryNotFound {
                query: query.to_string(),
            })?;

        let mut chunks: Vec<_> = q.chunks.values().filter(|c| c.intersects(from, to)).collect();
        // later chunks overwrite earlier ones
        chunks.sort_by_key(|c| (c.from, c.created));

        let mut res = HashMap::new();
        for c in chunks {
            if let Err(e) = chunk::read(&c.path, from, points_count, step, &mut res, chunk::fill_any) {
                if e.is_corruption() {
                    error!(target: "cerebro::cache", path = %c.path.display(), error = %e, "skipping corrupted chunk");
                    continue;
                }
                return Err(e.into());
            }
        }
        Ok(res.into_values().collect())
    }

    /// Step of the most recently downloaded chunk.
    pub fn get_step(&self) -> ObserveResult<Duration> {
        self.cache
            .project_step(&self.project_id)
            .ok_or_else(|| ObserveError::NotFound(format!("project {}", self.project_id)))
    }

    /// Time up to which every given query is fully cached: the minimum over
    /// queries of their latest chunk end, minus the refresh interval. Zero if
    /// any query has no data yet.
    pub fn last_update_time(&self, queries: &[&str]) -> Time {
        let index = self.cache.index.read();
        let Some(project) = index.get(&self.project_id) else {
            return Time::ZERO;
        };
        let mut min: Option<Time> = None;
        for q in queries {
            let latest = project
                .queries
                .get(&query_id(q))
                .and_then(|q| q.chunks.values().map(|c| c.to()).max());
            let Some(latest) = latest else {
                return Time::ZERO;
            };
            min = Some(min.map_or(latest, |m| m.min(latest)));
        }
        match min {
            Some(t) => t - self.refresh_interval,
            None => Time::ZERO,
        }
    }

    /// Latest time any chunk of the project reaches, minus the refresh interval.
    pub fn get_to(&self) -> Time {
        let index = self.cache.index.read();
        let latest = index
            .get(&self.project_id)
            .and_then(|p| p.queries.values().flat_map(|q| q.chunks.values()).map(|c| c.to()).max());
        match latest {
            Some(t) => t - self.refresh_interval,
            None => Time::ZERO,
        }
    }

    pub fn status(&self) -> ObserveResult<CacheStatus> {
        let error = self.cache.state.last_error(&self.project_id)?;
        Ok(CacheStatus { error })
    }
}

#[async_trait]
impl MetricSource for CacheClient {
    async fn query_range(&self, query: &str, from: Time, to: Time, step: Duration) -> ObserveResult<Vec<MetricValues>> {
        let client = self.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || client.query_range_blocking(&query, from, to, step))
            .await
            .map_err(|e| {
                warn!(target: "cerebro::cache", error = %e, "cache reader panicked");
                ObserveError::Internal(e.to_string())
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::cache::tests::{test_cache, write_test_chunk};
    use crate::cache::QueryState;
    use crate::model::project::PrometheusIntegration;
    use crate::model::Project;

    fn project() -> Project {
        Project {
            id: "p1".into(),
            name: "p1".into(),
            prometheus: Some(PrometheusIntegration {
                url: "http://prometheus:9090".into(),
                refresh_interval: std::time::Duration::from_secs(30),
                tls_skip_verify: false,
                basic_auth: None,
                extra_selector: String::new(),
                custom_headers: vec![],
                remote_write_url: String::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_query_range_merges_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), vec![project()]);
        let step = Duration(30);
        write_test_chunk(&cache, "p1", "up", Time(3600), 120, step, true, 1.0);
        write_test_chunk(&cache, "p1", "up", Time(7200), 120, step, false, 2.0);
        write_test_chunk(&cache, "p1", "up", Time(36000), 120, step, false, 5.0);

        let client = cache.client(&"p1".into());
        let res = client.query_range_blocking("up", Time(7170), Time(7260), step).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].values.to_string(), "TimeSeries(7170, 4, 30, [1 2 2 2])");

        let err = client.query_range_blocking("node_info", Time(0), Time(7200), step).unwrap_err();
        assert!(matches!(err, ObserveError::Cache(CacheError::QueryNotFound { .. })));
        let err = cache
            .client(&"nope".into())
            .query_range_blocking("up", Time(0), Time(7200), step)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_corrupted_chunk_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), vec![project()]);
        let step = Duration(30);
        write_test_chunk(&cache, "p1", "up", Time(3600), 120, step, true, 1.0);
        let broken = write_test_chunk(&cache, "p1", "up", Time(7200), 120, step, true, 2.0);
        let bytes = fs::read(&broken.path).unwrap();
        fs::write(&broken.path, &bytes[..40]).unwrap();

        let res = cache
            .client(&"p1".into())
            .query_range_blocking("up", Time(3600), Time(10770), step)
            .unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].values.get(Time(3600)), 1.0);
        assert!(res[0].values.get(Time(7200)).is_nan());
    }

    #[test]
    fn test_update_times() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), vec![project()]);
        let step = Duration(30);
        write_test_chunk(&cache, "p1", "up", Time(3600), 120, step, true, 1.0);
        write_test_chunk(&cache, "p1", "node_info", Time(3600), 60, step, false, 1.0);

        let client = cache.client(&"p1".into());
        assert_eq!(client.get_step().unwrap(), step);
        assert_eq!(client.last_update_time(&["up", "node_info"]), Time(3600 + 59 * 30 - 30));
        assert_eq!(client.last_update_time(&["up", "missing"]), Time::ZERO);
        assert_eq!(client.get_to(), Time(3600 + 119 * 30 - 30));
    }

    #[test]
    fn test_status() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), vec![project()]);
        let client = cache.client(&"p1".into());
        assert_eq!(client.status().unwrap(), CacheStatus::default());
        cache
            .state
            .save(&QueryState {
                project_id: "p1".into(),
                query: "up".into(),
                last_ts: Time(0),
                last_error: "bad gateway".into(),
            })
            .unwrap();
        assert_eq!(client.status().unwrap().error.as_deref(), Some("bad gateway"));
    }

    #[tokio::test]
    async fn test_metric_source_impl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), vec![project()]);
        write_test_chunk(&cache, "p1", "up", Time(3600), 120, Duration(30), true, 1.0);
        let source: Arc<dyn MetricSource> = Arc::new(cache.client(&"p1".into()));
        let res = source.query_range("up", Time(3600), Time(3690), Duration(30)).await.unwrap();
        assert_eq!(res[0].values.to_string(), "TimeSeries(3600, 4, 30, [1 1 1 1])");
    }
}
