// ============================================================================
// COMPACTION
// ============================================================================
// Merges finalized chunks of one duration into a chunk of a larger duration:
// four 1h chunks into a 4h chunk, three 4h chunks into a 12h chunk.
// ============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{chunk_file_name, Cache};
use crate::chunk::{self, ChunkMeta};
use crate::error::{ObserveError, ObserveResult};
use crate::model::ProjectId;
use crate::telemetry::metrics;
use crate::timeseries::{Duration, Time};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Compactor {
    pub src: Duration,
    pub dst: Duration,
}

impl Compactor {
    /// Label value of the `compacted_chunks` counter, e.g. `1h->4h`.
    pub fn name(&self) -> String {
        format!("{}->{}", self.src, self.dst)
    }
}

pub const COMPACTORS: [Compactor; 2] = [
    Compactor {
        src: Duration::HOUR,
        dst: Duration(4 * 3600),
    },
    Compactor {
        src: Duration(4 * 3600),
        dst: Duration(12 * 3600),
    },
];

#[derive(Clone, Debug)]
pub struct CompactionTask {
    pub compactor: Compactor,
    pub project_id: ProjectId,
    pub query_id: String,
    pub dst_from: Time,
    pub src: Vec<ChunkMeta>,
}

/// Groups complete source chunks by their destination chunk; a group is a
/// task once it holds every source chunk of the destination.
pub fn calc_compaction_tasks<'a>(
    compactor: Compactor,
    jitter: Duration,
    chunks: impl IntoIterator<Item = &'a ChunkMeta>,
) -> Vec<(Time, Vec<ChunkMeta>)> {
    let mut groups: BTreeMap<Time, Vec<ChunkMeta>> = BTreeMap::new();
    for c in chunks {
        if !c.finalized || c.duration() != compactor.src {
            continue;
        }
        let dst_from = (c.from - jitter).truncate(compactor.dst) + jitter;
        groups.entry(dst_from).or_default().push(c.clone());
    }
    let need = (compactor.dst / compactor.src) as usize;
    groups.into_iter().filter(|(_, src)| src.len() == need).collect()
}

/// Periodically plans compaction tasks and feeds them to the workers.
pub(crate) async fn run(cache: Arc<Cache>, shutdown: CancellationToken) {
    let workers = cache.config().compaction_workers.max(1);
    let (tx, rx) = flume::bounded::<CompactionTask>(0);
    for _ in 0..workers {
        let cache = cache.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            while let Ok(task) = rx.recv_async().await {
                let cache = cache.clone();
                let res = tokio::task::spawn_blocking(move || compact(&cache, task)).await;
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(target: "cerebro::compaction", error = %e, "compaction failed"),
                    Err(e) => error!(target: "cerebro::compaction", error = %e, "compaction worker panicked"),
                }
            }
        });
    }
    info!(target: "cerebro::compaction", workers, "compaction started");

    let mut ticker = tokio::time::interval(cache.config().compaction_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let tasks = plan(&cache);
        let total = tasks.len();
        for (i, task) in tasks.into_iter().enumerate() {
            metrics().pending_compactions.set((total - i - 1) as i64);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                res = tx.send_async(task) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn plan(cache: &Cache) -> Vec<CompactionTask> {
    let index = cache.index.read();
    let mut tasks = Vec::new();
    for (project_id, project) in index.iter() {
        for (query_id, query) in &project.queries {
            let jitter = cache.query_jitter(project_id, query_id);
            for compactor in COMPACTORS {
                for (dst_from, src) in calc_compaction_tasks(compactor, jitter, query.chunks.values()) {
                    tasks.push(CompactionTask {
                        compactor,
                        project_id: project_id.clone(),
                        query_id: query_id.clone(),
                        dst_from,
                        src,
                    });
                }
            }
        }
    }
    tasks
}

fn sources_indexed(cache: &Cache, task: &CompactionTask) -> bool {
    let index = cache.index.read();
    let Some(q) = index
        .get(&task.project_id)
        .and_then(|p| p.queries.get(&task.query_id))
    else {
        return false;
    };
    task.src.iter().all(|s| q.chunks.contains_key(&s.path))
}

/// Deletes a compacted chunk that never made it into the index.
fn remove_orphan(path: &std::path::Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            warn!(target: "cerebro::compaction", path = %path.display(), error = %e, "failed to delete orphaned chunk");
            false
        }
    }
}

/// Reads the source chunks into one destination chunk, then swaps them in
/// the index under the write lock.
pub(crate) fn compact(cache: &Cache, mut task: CompactionTask) -> ObserveResult<()> {
    if task.src.is_empty() {
        return Err(ObserveError::Internal("no source chunks".to_string()));
    }
    if !sources_indexed(cache, &task) {
        debug!(target: "cerebro::compaction", query = %task.query_id, "source chunks are gone, skipping");
        return Ok(());
    }
    let started = Instant::now();
    task.src.sort_by_key(|c| c.from);
    let step = task
        .src
        .iter()
        .map(|c| c.step)
        .max()
        .unwrap_or(Duration::MINUTE);
    let points_count = (task.compactor.dst / step) as usize;

    let mut series = std::collections::HashMap::new();
    for src in &task.src {
        chunk::read(&src.path, task.dst_from, points_count, step, &mut series, chunk::fill_any)?;
    }
    let metrics_list: Vec<_> = series.into_values().collect();

    let path = cache
        .project_dir(&task.project_id)
        .join(chunk_file_name(&task.project_id, &task.query_id, task.dst_from, points_count, step));
    chunk::write(&path, task.dst_from, points_count, step, true, &metrics_list)?;
    let meta = ChunkMeta {
        path: path.clone(),
        from: task.dst_from,
        points_count: points_count as u32,
        step,
        finalized: true,
        metrics_count: metrics_list.len() as u32,
        created: Time::now(),
    };

    let mut index = cache.index.write();
    let query = index
        .get_mut(&task.project_id)
        .and_then(|p| p.queries.get_mut(&task.query_id));
    let Some(query) = query.filter(|q| task.src.iter().all(|s| q.chunks.contains_key(&s.path))) else {
        drop(index);
        remove_orphan(&path);
        return Ok(());
    };
    for src in &task.src {
        if src.path == path {
            continue;
        }
        if let Err(e) = fs::remove_file(&src.path) {
            warn!(target: "cerebro::compaction", path = %src.path.display(), error = %e, "failed to delete chunk");
        }
        query.chunks.remove(&src.path);
    }
    query.chunks.insert(path, meta);
    drop(index);

    metrics()
        .compacted_chunks
        .with_label_values(&[task.compactor.name().as_str()])
        .inc();
    info!(
        target: "cerebro::compaction",
        project = %task.project_id,
        query = %task.query_id,
        compactor = %task.compactor.name(),
        sources = task.src.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "chunks compacted"
    );
    Ok(())
}
