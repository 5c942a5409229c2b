//! Operational read model
//!
//! A point-in-time view of queue pressure and cache coverage, recomputed
//! from the store on every call. Nothing here is cached: the snapshot is
//! meant for health endpoints and dashboards, which would rather pay two
//! cheap queries than read stale numbers.

use anyhow::Result;
use serde::Serialize;

use crate::store::backup::BackupStats;
use crate::store::queue::QueueStats;
use crate::store::Store;

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub queue: QueueStats,
    pub backups: BackupStats,
}

pub async fn health_snapshot(store: &Store) -> Result<HealthSnapshot> {
    let queue = store.queue_stats_async().await?;
    let backups = store.backup_coverage_async().await?;
    Ok(HealthSnapshot { queue, backups })
}

#[cfg(test)]
mod tests {
    use super::*;

    use url::Url;

    use crate::planning::Planning;

    #[tokio::test]
    async fn snapshot_reflects_current_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("pantry.sqlite")).unwrap();
        store
            .upsert_planning(&Planning::new(
                "a",
                "grp",
                "Maths",
                Some(Url::parse("https://ade.example.edu/feed.ics").unwrap()),
            ))
            .unwrap();
        store.enqueue_refresh("a", 7).unwrap();

        let snapshot = health_snapshot(&store).await.unwrap();
        assert_eq!(snapshot.queue.depth, 1);
        assert_eq!(snapshot.queue.ready, 1);
        assert_eq!(snapshot.queue.max_pending_priority, Some(7));
        assert_eq!(snapshot.backups.plannings_total, 1);
        assert_eq!(snapshot.backups.missing, 1);
    }

    #[tokio::test]
    async fn snapshot_serializes_with_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("pantry.sqlite")).unwrap();

        let snapshot = health_snapshot(&store).await.unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["queue"]["maxPendingPriority"].is_null());
        assert_eq!(json["backups"]["planningsTotal"], 0);
    }
}
