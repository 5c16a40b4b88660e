//! Cache garbage collection: expired chunks and deleted projects.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Cache, QUARANTINE_DIR};
use crate::model::ProjectId;
use crate::timeseries::{Duration, Time};

pub(crate) async fn run(cache: Arc<Cache>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(cache.config().gc_interval);
    // the first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let cache = cache.clone();
        let res = tokio::task::spawn_blocking(move || collect(&cache, Time::now())).await;
        if let Err(e) = res {
            error!(target: "cerebro::cache", error = %e, "cache gc panicked");
        }
    }
}

/// One GC pass at `now`.
pub(crate) fn collect(cache: &Cache, now: Time) {
    let started = Instant::now();
    let deleted_projects = delete_obsolete_projects(cache);
    let deleted_chunks = delete_expired_chunks(cache, now - Duration::from_std(cache.config().ttl));
    info!(
        target: "cerebro::cache",
        deleted_projects,
        deleted_chunks,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "cache gc done"
    );
}

/// Projects present on disk, in the index or in the state DB but no longer
/// configured.
fn delete_obsolete_projects(cache: &Cache) -> usize {
    let configured: HashSet<ProjectId> = cache.projects.list().iter().map(|p| p.id.clone()).collect();

    let mut known: HashSet<ProjectId> = cache.index.read().keys().cloned().collect();
    match cache.state.projects() {
        Ok(ids) => known.extend(ids),
        Err(e) => warn!(target: "cerebro::cache", error = %e, "failed to list query states"),
    }
    if let Ok(entries) = fs::read_dir(cache.dir()) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != QUARANTINE_DIR && entry.path().is_dir() {
                known.insert(ProjectId::new(name));
            }
        }
    }

    let mut deleted = 0;
    for id in known.difference(&configured) {
        info!(target: "cerebro::cache", project = %id, "deleting cache of deleted project");
        cache.index.write().remove(id);
        if let Err(e) = cache.state.delete_project(id) {
            error!(target: "cerebro::cache", project = %id, error = %e, "failed to delete query states");
        }
        let dir = cache.project_dir(id);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                error!(target: "cerebro::cache", project = %id, error = %e, "failed to delete project dir");
            }
        }
        deleted += 1;
    }
    deleted
}

fn delete_expired_chunks(cache: &Cache, min_ts: Time) -> usize {
    let mut expired: Vec<(ProjectId, String, PathBuf)> = Vec::new();
    {
        let index = cache.index.read();
        for (project_id, project) in index.iter() {
            for (query_id, query) in &project.queries {
                for (path, meta) in &query.chunks {
                    if meta.from + meta.duration() < min_ts {
                        expired.push((project_id.clone(), query_id.clone(), path.clone()));
                    }
                }
            }
        }
    }
    if expired.is_empty() {
        return 0;
    }

    let mut deleted = 0;
    let mut index = cache.index.write();
    for (project_id, query_id, path) in expired {
        let Some(project) = index.get_mut(&project_id) else {
            continue;
        };
        let Some(query) = project.queries.get_mut(&query_id) else {
            continue;
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                query.chunks.remove(&path);
                deleted += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                query.chunks.remove(&path);
            }
            Err(e) => error!(target: "cerebro::cache", path = %path.display(), error = %e, "failed to delete chunk"),
        }
        if query.chunks.is_empty() {
            project.queries.remove(&query_id);
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{test_cache, write_test_chunk};
    use crate::cache::{query_id, QueryState};
    use crate::model::Project;

    fn project(id: &str) -> Project {
        Project {
            id: id.into(),
            name: id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_expired_chunks_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), vec![project("p1")]);
        let now = Time(100 * 86400);
        let ttl = Duration::from_std(cache.config().ttl);
        let old = write_test_chunk(&cache, "p1", "up", now - ttl - Duration::DAY, 120, Duration(30), true, 1.0);
        let fresh = write_test_chunk(&cache, "p1", "up", now - Duration::HOUR, 120, Duration(30), true, 1.0);
        write_test_chunk(&cache, "p1", "node_info", now - ttl - Duration::DAY, 120, Duration(30), true, 1.0);

        collect(&cache, now);

        assert!(!old.path.exists());
        assert!(fresh.path.exists());
        let index = cache.index.read();
        let queries = &index[&ProjectId::new("p1")].queries;
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[&query_id("up")].chunks.len(), 1);
    }

    #[test]
    fn test_deleted_projects_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), vec![project("p1")]);
        let now = Time::now();
        write_test_chunk(&cache, "p1", "up", now - Duration::HOUR, 120, Duration(30), true, 1.0);
        write_test_chunk(&cache, "gone", "up", now - Duration::HOUR, 120, Duration(30), true, 1.0);
        cache
            .state
            .save(&QueryState {
                project_id: "gone-too".into(),
                query: "up".into(),
                last_ts: now,
                last_error: String::new(),
            })
            .unwrap();
        fs::create_dir_all(dir.path().join(QUARANTINE_DIR)).unwrap();

        collect(&cache, now);

        assert!(dir.path().join("p1").exists());
        assert!(!dir.path().join("gone").exists());
        assert!(dir.path().join(QUARANTINE_DIR).exists());
        assert_eq!(cache.chunks_count(&"gone".into()), 0);
        assert_eq!(cache.state.projects().unwrap(), Vec::<ProjectId>::new());
        assert_eq!(cache.chunks_count(&"p1".into()), 1);
    }
}
