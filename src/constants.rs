// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and limits of the core.
// ============================================================================

use crate::timeseries::Duration;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FULL_NAME: &str = "Cerebro Observability Core";

// ----------------------------------------------------------------------------
// Metric cache
// ----------------------------------------------------------------------------

/// Canonical duration of a freshly downloaded chunk
pub const CHUNK_DURATION: Duration = Duration::HOUR;

/// Parallel range queries per project worker
pub const QUERY_CONCURRENCY: usize = 10;

/// Upper bound for a single range query against the metric source
pub const QUERY_TIMEOUT: Duration = Duration(5 * 60);

/// How far back a freshly discovered query is back-filled
pub const DEFAULT_BACKFILL_WINDOW: Duration = Duration::DAY;

/// Interval of the top-level updater that spawns project workers
pub const UPDATER_INTERVAL_SECS: u64 = 1;

/// Capacity of the cache updates channel consumed by the watchers
pub const UPDATES_CHANNEL_CAPACITY: usize = 1000;

/// Default scrape interval when none is configured
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration(30);

// ----------------------------------------------------------------------------
// Chunk codec
// ----------------------------------------------------------------------------

/// Version produced by the writer
pub const CHUNK_VERSION: u8 = 4;

/// Size of the fixed little-endian header
pub const CHUNK_HEADER_SIZE: usize = 26;

/// Longest span a chunk header may describe
pub const CHUNK_MAX_DURATION: Duration = Duration(7 * 24 * 3600);

/// Upper bound of raw floats in one LZ4 block
pub const CHUNK_MAX_BLOCK_SIZE: usize = 1 << 20;

/// Maximum number of distinct label values per chunk (24-bit index)
pub const CHUNK_MAX_LABEL_VALUES: usize = 1 << 24;

// ----------------------------------------------------------------------------
// Collector
// ----------------------------------------------------------------------------

/// Header carrying the project api key on every ingestion request
pub const API_KEY_HEADER: &str = "x-api-key";

pub const DEFAULT_BATCH_LIMIT: usize = 10_000;
pub const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 5;

pub const MIGRATION_TIMEOUT_SECS: u64 = 60;
pub const MIGRATION_BACKOFF_MIN_SECS: u64 = 60;
pub const MIGRATION_BACKOFF_MAX_SECS: u64 = 600;
pub const MIGRATION_BACKOFF_FACTOR: u32 = 2;

/// Space manager never runs more often than this from the watcher loop
pub const SPACE_MANAGER_INTERVAL: Duration = Duration::HOUR;

// ----------------------------------------------------------------------------
// Watchers
// ----------------------------------------------------------------------------

/// Window of the world loaded for each project update
pub const WATCHER_WINDOW: Duration = Duration::HOUR;

/// Pending alerts that were never promoted are dropped after this age
pub const PENDING_ALERT_TTL: Duration = Duration(30 * 60);

pub const DEPLOYMENT_METRICS_SHIFT: Duration = Duration(10 * 60);
pub const DEPLOYMENT_METRICS_WINDOW: Duration = Duration(30 * 60);

/// Deployments still rolling out after this are reported as stuck
pub const DEPLOYMENT_STUCK_AFTER: Duration = Duration(30 * 60);

/// Only deployments started within this window produce notifications
pub const DEPLOYMENT_NOTIFICATION_WINDOW: Duration = Duration::DAY;

pub const LOG_PATTERN_MIN_COUNT: f32 = 10.0;
pub const LOG_PATTERN_MAX_ALERTS_PER_APP: usize = 20;

pub const PROMQL_EVALUATION_TIMEOUT_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Notifications
// ----------------------------------------------------------------------------

pub const NOTIFICATION_SEND_TIMEOUT_SECS: u64 = 30;
pub const NOTIFICATION_RETRY_INTERVAL_SECS: u64 = 60;
pub const NOTIFICATION_RETRY_WINDOW: Duration = Duration::HOUR;

// ----------------------------------------------------------------------------
// Buffer pool
// ----------------------------------------------------------------------------

/// Small buffer size (4KB)
pub const SMALL_BUFFER_SIZE: usize = 4 * 1024;

/// Medium buffer size (64KB)
pub const MEDIUM_BUFFER_SIZE: usize = 64 * 1024;

/// Large buffer size (1MB plus LZ4 worst-case overhead)
pub const LARGE_BUFFER_SIZE: usize = (1 << 20) + (1 << 16);

/// Maximum number of pooled buffers per tier
pub const POOL_SIZE: usize = 256;
