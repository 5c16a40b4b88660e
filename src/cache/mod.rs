// ============================================================================
// METRIC CACHE
// ============================================================================
// Local on-disk store of range-query results. Chunks live under
// `<dir>/<projectId>/` and are indexed in memory; background tasks back-fill
// from the metric source, compact hourly chunks and expire old ones.
// ============================================================================

pub mod client;
pub mod compaction;
pub mod gc;
pub mod queries;
pub mod state;
pub mod updater;

use std::collections::HashMap;
use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use md5::{Digest, Md5};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chunk::{self, ChunkMeta};
use crate::config::CacheConfig;
use crate::constants::{CHUNK_DURATION, UPDATES_CHANNEL_CAPACITY};
use crate::error::ObserveResult;
use crate::model::{ProjectId, ProjectRegistry};
use crate::prom::MetricSourceFactory;
use crate::timeseries::{Duration, Time};

pub use client::CacheClient;
pub use state::{QueryState, StateDb};

const QUARANTINE_DIR: &str = "quarantine";

// ----------------------------------------------------------------------------
// 1. Index
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct QueryData {
    pub(crate) chunks: HashMap<PathBuf, ChunkMeta>,
}

#[derive(Debug, Default)]
pub(crate) struct ProjectData {
    /// Step of the most recent chunk.
    pub(crate) step: Duration,
    latest_from: Time,
    pub(crate) queries: HashMap<String, QueryData>,
}

impl ProjectData {
    fn insert(&mut self, query_id: &str, meta: ChunkMeta) {
        if meta.from >= self.latest_from {
            self.latest_from = meta.from;
            self.step = meta.step;
        }
        self.queries
            .entry(query_id.to_string())
            .or_default()
            .chunks
            .insert(meta.path.clone(), meta);
    }
}

pub(crate) type Index = HashMap<ProjectId, ProjectData>;

/// md5 hex of the query text.
pub fn query_id(query: &str) -> String {
    hex::encode(Md5::digest(query.as_bytes()))
}

/// Per `(project, query)` offset of chunk boundaries, whole minutes in
/// `[0, chunk duration)`. Recording rules share the key of the project.
pub fn chunk_jitter(project_id: &ProjectId, query_id: &str) -> Duration {
    let sum = fnv32a(format!("{}-{}", project_id, query_id).as_bytes());
    let minutes = (CHUNK_DURATION / Duration::MINUTE) as u32;
    Duration::MINUTE * (sum % minutes) as i64
}

fn fnv32a(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter().fold(OFFSET, |h, b| (h ^ *b as u32).wrapping_mul(PRIME))
}

/// `<projectId>-<queryId>-<from>-<pointsCount>-<step>.db`
pub fn chunk_file_name(project_id: &ProjectId, query_id: &str, from: Time, points_count: usize, step: Duration) -> String {
    format!("{}-{}-{}-{}-{}.db", project_id, query_id, from.0, points_count, step.0)
}

/// Inverse of [`chunk_file_name`]; the project id may itself contain dashes.
pub fn parse_chunk_file_name(name: &str) -> Option<(ProjectId, String, Time, u32, Duration)> {
    let stem = name.strip_suffix(".db")?;
    let mut parts = stem.rsplitn(5, '-');
    let step = parts.next()?.parse::<i64>().ok()?;
    let points_count = parts.next()?.parse::<u32>().ok()?;
    let from = parts.next()?.parse::<i64>().ok()?;
    let query_id = parts.next()?;
    let project_id = parts.next()?;
    if project_id.is_empty() || step <= 0 {
        return None;
    }
    Some((
        ProjectId::new(project_id),
        query_id.to_string(),
        Time(from),
        points_count,
        Duration(step),
    ))
}

// ----------------------------------------------------------------------------
// 2. Cache
// ----------------------------------------------------------------------------

pub struct Cache {
    dir: PathBuf,
    cfg: CacheConfig,
    pub(crate) index: RwLock<Index>,
    pub(crate) state: StateDb,
    pub(crate) projects: Arc<ProjectRegistry>,
    pub(crate) sources: Arc<dyn MetricSourceFactory>,
    updates_tx: flume::Sender<ProjectId>,
    updates_rx: flume::Receiver<ProjectId>,
}

impl Cache {
    /// Opens the cache directory and loads the chunk index from disk.
    pub fn new(
        cfg: CacheConfig,
        dir: PathBuf,
        state: StateDb,
        projects: Arc<ProjectRegistry>,
        sources: Arc<dyn MetricSourceFactory>,
    ) -> ObserveResult<Arc<Self>> {
        fs::create_dir_all(&dir)?;
        let (updates_tx, updates_rx) = flume::bounded(UPDATES_CHANNEL_CAPACITY);
        let cache = Self {
            dir,
            cfg,
            index: RwLock::new(HashMap::new()),
            state,
            projects,
            sources,
            updates_tx,
            updates_rx,
        };
        cache.load_index()?;
        Ok(Arc::new(cache))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn project_dir(&self, project_id: &ProjectId) -> PathBuf {
        self.dir.join(project_id.as_str())
    }

    fn load_index(&self) -> ObserveResult<()> {
        let started = std::time::Instant::now();
        let mut index = Index::new();
        let mut count = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || entry.file_name() == QUARANTINE_DIR {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let name = file.file_name().to_string_lossy().into_owned();
                let Some((project_id, query_id, ..)) = parse_chunk_file_name(&name) else {
                    continue;
                };
                let path = file.path();
                match chunk::read_meta(&path) {
                    Ok(meta) => {
                        index.entry(project_id).or_default().insert(&query_id, meta);
                        count += 1;
                    }
                    Err(e) => {
                        error!(target: "cerebro::cache", path = %path.display(), error = %e, "failed to read chunk meta");
                        if self.cfg.quarantine_corrupt_chunks && e.is_corruption() {
                            self.quarantine(&path);
                        }
                    }
                }
            }
        }
        info!(
            target: "cerebro::cache",
            chunks = count,
            projects = index.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cache loaded from disk"
        );
        *self.index.write() = index;
        Ok(())
    }

    /// Moves an undecodable chunk aside for inspection.
    pub(crate) fn quarantine(&self, path: &Path) {
        let dir = self.dir.join(QUARANTINE_DIR);
        let Some(name) = path.file_name() else {
            return;
        };
        let res = fs::create_dir_all(&dir).and_then(|_| fs::rename(path, dir.join(name)));
        match res {
            Ok(()) => warn!(target: "cerebro::cache", path = %path.display(), "chunk quarantined"),
            Err(e) => error!(target: "cerebro::cache", path = %path.display(), error = %e, "failed to quarantine chunk"),
        }
    }

    /// Adds or replaces a chunk in the index.
    pub(crate) fn insert_chunk(&self, project_id: &ProjectId, query_id: &str, meta: ChunkMeta) {
        self.index
            .write()
            .entry(project_id.clone())
            .or_default()
            .insert(query_id, meta);
    }

    /// Jitter of a query; recording rules of the project use the shared key.
    pub fn query_jitter(&self, project_id: &ProjectId, query_id: &str) -> Duration {
        let is_rr = self
            .projects
            .get(project_id)
            .map(|p| p.recording_rules.iter().any(|q| self::query_id(q) == query_id))
            .unwrap_or(false);
        chunk_jitter(project_id, if is_rr { "" } else { query_id })
    }

    pub fn project_step(&self, project_id: &ProjectId) -> Option<Duration> {
        self.index.read().get(project_id).map(|p| p.step)
    }

    /// Project ids published after every completed back-fill iteration.
    pub fn updates(&self) -> flume::Receiver<ProjectId> {
        self.updates_rx.clone()
    }

    pub(crate) fn publish_update(&self, project_id: &ProjectId) {
        if self.updates_tx.try_send(project_id.clone()).is_err() {
            warn!(target: "cerebro::cache", project = %project_id, "updates channel is full, dropping update");
        }
    }

    pub fn client(self: &Arc<Self>, project_id: &ProjectId) -> CacheClient {
        CacheClient::new(self.clone(), project_id.clone())
    }

    /// Number of indexed chunks of a project.
    pub fn chunks_count(&self, project_id: &ProjectId) -> usize {
        self.index
            .read()
            .get(project_id)
            .map(|p| p.queries.values().map(|q| q.chunks.len()).sum())
            .unwrap_or(0)
    }

    /// Spawns the updater, compaction and GC loops.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(updater::run(self.clone(), shutdown.clone())),
            tokio::spawn(compaction::run(self.clone(), shutdown.clone())),
            tokio::spawn(gc::run(self.clone(), shutdown)),
        ]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{MetricValues, Project};
    use crate::prom::MetricSource;
    use crate::timeseries::TimeSeries;

    pub(crate) struct NoSources;

    impl MetricSourceFactory for NoSources {
        fn source(&self, _: &Project) -> Option<Arc<dyn MetricSource>> {
            None
        }
    }

    pub(crate) fn test_cache(dir: &Path, projects: Vec<Project>) -> Arc<Cache> {
        Cache::new(
            CacheConfig::default(),
            dir.to_path_buf(),
            StateDb::open_in_memory().unwrap(),
            Arc::new(ProjectRegistry::new(projects)),
            Arc::new(NoSources),
        )
        .unwrap()
    }

    /// Writes a chunk with one series `{job="x"}` holding `value` everywhere.
    pub(crate) fn write_test_chunk(
        cache: &Cache,
        project: &str,
        query: &str,
        from: Time,
        points_count: usize,
        step: Duration,
        finalized: bool,
        value: f32,
    ) -> ChunkMeta {
        let project_id = ProjectId::new(project);
        let qid = query_id(query);
        let dir = cache.project_dir(&project_id);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(chunk_file_name(&project_id, &qid, from, points_count, step));
        let labels = [("job".to_string(), "x".to_string())].into_iter().collect();
        let mv = MetricValues::new(labels, TimeSeries::with_value(from, points_count, step, value));
        chunk::write(&path, from, points_count, step, finalized, &[mv]).unwrap();
        let meta = chunk::read_meta(&path).unwrap();
        cache.insert_chunk(&project_id, &qid, meta.clone());
        meta
    }

    #[test]
    fn test_jitter_is_whole_minutes_within_chunk() {
        let p = ProjectId::new("p1");
        for q in ["up", "node_info", "rate(x[$RANGE])", ""] {
            let j = chunk_jitter(&p, &query_id(q));
            assert!(j >= Duration::ZERO && j < CHUNK_DURATION);
            assert_eq!(j.0 % 60, 0);
        }
    }

    #[test]
    fn test_fnv32a() {
        assert_eq!(fnv32a(b""), 0x811c9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c292c);
        assert_eq!(fnv32a(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_query_id() {
        assert_eq!(query_id("up"), "46f1a0bd5592a2f9244ca321b129902a");
    }

    #[test]
    fn test_chunk_file_name_round_trip() {
        let p = ProjectId::new("my-project");
        let name = chunk_file_name(&p, "abc", Time(1605258720), 120, Duration(30));
        assert_eq!(name, "my-project-abc-1605258720-120-30.db");
        let (pid, qid, from, pc, step) = parse_chunk_file_name(&name).unwrap();
        assert_eq!(pid, p);
        assert_eq!(qid, "abc");
        assert_eq!((from, pc, step), (Time(1605258720), 120, Duration(30)));
        assert!(parse_chunk_file_name("junk.db").is_none());
        assert!(parse_chunk_file_name("p-q-1-2-3.tmp").is_none());
    }

    #[test]
    fn test_index_is_loaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = test_cache(dir.path(), vec![]);
            write_test_chunk(&cache, "p1", "up", Time(3600), 120, Duration(30), true, 1.0);
            write_test_chunk(&cache, "p1", "up", Time(7200), 240, Duration(15), false, 1.0);
        }
        fs::write(dir.path().join("p1").join("p1-bad-0-1-30.db"), b"\x04short").unwrap();

        let cache = test_cache(dir.path(), vec![]);
        assert_eq!(cache.chunks_count(&"p1".into()), 2);
        assert_eq!(cache.project_step(&"p1".into()), Some(Duration(15)));
        // corrupt file is skipped but left in place
        assert!(dir.path().join("p1").join("p1-bad-0-1-30.db").exists());
    }

    #[test]
    fn test_quarantine_corrupt_chunks() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("p1")).unwrap();
        fs::write(dir.path().join("p1").join("p1-bad-0-1-30.db"), b"\x02legacy-chunk-bytes-here-padded").unwrap();
        let cfg = CacheConfig {
            quarantine_corrupt_chunks: true,
            ..CacheConfig::default()
        };
        let cache = Cache::new(
            cfg,
            dir.path().to_path_buf(),
            StateDb::open_in_memory().unwrap(),
            Arc::new(ProjectRegistry::new(vec![])),
            Arc::new(NoSources),
        )
        .unwrap();
        assert_eq!(cache.chunks_count(&"p1".into()), 0);
        assert!(dir.path().join(QUARANTINE_DIR).join("p1-bad-0-1-30.db").exists());
    }

    #[test]
    fn test_recording_rules_share_jitter() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project {
            id: "p1".into(),
            name: "p1".into(),
            recording_rules: vec!["sum(rate(x[$RANGE]))".into()],
            ..Default::default()
        };
        let cache = test_cache(dir.path(), vec![project]);
        let p = ProjectId::new("p1");
        assert_eq!(
            cache.query_jitter(&p, &query_id("sum(rate(x[$RANGE]))")),
            chunk_jitter(&p, "")
        );
        assert_eq!(cache.query_jitter(&p, &query_id("up")), chunk_jitter(&p, &query_id("up")));
    }

    #[test]
    fn test_updates_channel() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), vec![]);
        let rx = cache.updates();
        cache.publish_update(&"p1".into());
        assert_eq!(rx.try_recv().unwrap(), ProjectId::new("p1"));
    }
}
