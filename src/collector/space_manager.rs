// ============================================================================
// CLICKHOUSE SPACE MANAGER
// ============================================================================
// When a local disk of a ClickHouse host runs over the usage threshold, drops
// the oldest partition of every signal table that keeps more than the
// minimum number of partitions. Every replica of a cluster is checked on its
// own; ClickHouse Cloud manages its own storage and is skipped.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};

use tracing::{error, info};

use super::clickhouse::{as_u64, ClickHouseClient, Row};
use crate::config::SpaceManagerConfig;
use crate::error::CollectorError;

#[derive(Clone, Debug, PartialEq)]
pub struct DiskInfo {
    pub name: String,
    pub disk_type: String,
    pub total_space: u64,
    pub free_space: u64,
}

impl DiskInfo {
    pub fn usage_percent(&self) -> f64 {
        if self.total_space == 0 {
            return 0.0;
        }
        self.total_space.saturating_sub(self.free_space) as f64 / self.total_space as f64 * 100.0
    }

    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            name: row.get("name")?.as_str()?.to_string(),
            disk_type: row.get("type")?.as_str()?.to_string(),
            total_space: as_u64(row.get("total_space")?)?,
            free_space: as_u64(row.get("free_space")?)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionInfo {
    pub database: String,
    pub table: String,
    pub partition_id: String,
}

impl PartitionInfo {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            database: row.get("database")?.as_str()?.to_string(),
            table: row.get("table")?.as_str()?.to_string(),
            partition_id: row.get("partition_id")?.as_str()?.to_string(),
        })
    }
}

/// Local disks whose integer usage percent exceeds the threshold.
pub fn disks_over_threshold(disks: &[DiskInfo], threshold_percent: u64) -> Vec<&DiskInfo> {
    disks
        .iter()
        .filter(|d| d.disk_type == "Local")
        .filter(|d| {
            let usage = d.usage_percent();
            info!(target: "cerebro::collector", disk = %d.name, usage = %format!("{usage:.2}"), threshold_percent, "disk usage");
            usage as u64 > threshold_percent
        })
        .collect()
}

/// The oldest partition of each table holding more than `min_partitions`.
/// `partitions` must be ordered oldest first.
pub fn partitions_to_drop(partitions: Vec<PartitionInfo>, min_partitions: u64) -> Vec<PartitionInfo> {
    let mut by_table: BTreeMap<(String, String), Vec<PartitionInfo>> = BTreeMap::new();
    for p in partitions {
        by_table.entry((p.database.clone(), p.table.clone())).or_default().push(p);
    }
    by_table
        .into_iter()
        .filter_map(|((db, table), parts)| {
            if parts.len() as u64 <= min_partitions {
                info!(target: "cerebro::collector", table = %format!("{db}.{table}"), partitions = parts.len(), min_partitions, "keeping minimum partitions");
                return None;
            }
            parts.into_iter().next()
        })
        .collect()
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

async fn cleanup_host(
    client: &ClickHouseClient,
    cfg: &SpaceManagerConfig,
    databases: &BTreeSet<String>,
) -> Result<(), CollectorError> {
    info!(target: "cerebro::collector", address = client.address(), "space manager check");
    let disks: Vec<DiskInfo> = client
        .query_rows("SELECT name, type, total_space, free_space FROM system.disks")
        .await?
        .iter()
        .filter_map(DiskInfo::from_row)
        .collect();

    let dbs = databases.iter().map(|d| quote(d)).collect::<Vec<_>>().join(", ");
    for disk in disks_over_threshold(&disks, cfg.usage_threshold_percent) {
        info!(target: "cerebro::collector", disk = %disk.name, "disk usage exceeds threshold, dropping old partitions");
        let query = format!(
            "SELECT p.database, p.table, p.partition_id FROM system.parts p \
             WHERE p.active = 1 AND p.min_time > 0 AND p.disk_name = {} AND p.database IN ({dbs}) \
             AND (p.table LIKE 'otel_%' OR p.table LIKE 'profiling_%') \
             ORDER BY p.min_time ASC",
            quote(&disk.name)
        );
        let partitions: Vec<PartitionInfo> = client
            .query_rows(&query)
            .await?
            .iter()
            .filter_map(PartitionInfo::from_row)
            .collect();
        for p in partitions_to_drop(partitions, cfg.min_partitions) {
            info!(target: "cerebro::collector", partition = %p.partition_id, table = %format!("{}.{}", p.database, p.table), "dropping partition");
            let stmt = format!(
                "ALTER TABLE {}.{} DROP PARTITION ID {}",
                p.database,
                p.table,
                quote(&p.partition_id)
            );
            if let Err(e) = client.exec(&stmt).await {
                error!(target: "cerebro::collector", partition = %p.partition_id, table = %p.table, error = %e, "failed to drop partition");
            }
        }
    }
    Ok(())
}

/// Checks one ClickHouse server, or every replica of its cluster.
pub async fn run(
    client: &ClickHouseClient,
    cfg: &SpaceManagerConfig,
    databases: &BTreeSet<String>,
) -> Result<(), CollectorError> {
    if client.topology().cloud {
        info!(target: "cerebro::collector", address = client.address(), "space manager is disabled for ClickHouse Cloud");
        return Ok(());
    }
    if databases.is_empty() {
        return Ok(());
    }
    let Some(cluster) = &client.topology().cluster else {
        return cleanup_host(client, cfg, databases).await;
    };

    let hosts: BTreeSet<String> = client
        .query_rows(&format!(
            "SELECT host_name FROM system.clusters WHERE cluster = {}",
            quote(cluster)
        ))
        .await?
        .iter()
        .filter_map(|r| r.get("host_name").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    if hosts.is_empty() {
        return cleanup_host(client, cfg, databases).await;
    }
    for host in hosts {
        let replica = client.for_host(&host);
        match cleanup_host(&replica, cfg, databases).await {
            Ok(()) => info!(target: "cerebro::collector", replica = %replica.address(), "space manager check done"),
            Err(e) => error!(target: "cerebro::collector", replica = %replica.address(), error = %e, "space manager check failed"),
        }
    }
    Ok(())
}
