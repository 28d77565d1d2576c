//! Subscription reconciler
//!
//! A background loop that diffs the canonical set of subscribed
//! (connection, tag) pairs against what each live driver is actively
//! polling, and forces removals of stragglers. Idempotent and
//! best-effort: failures log and the loop continues.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::manager::ConnectionManager;
use crate::core::store::MetaStore;

/// Wake at most this often regardless of the configured interval, so
/// shutdown and interval changes take effect promptly
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(30);

pub struct Reconciler {
    manager: Arc<ConnectionManager>,
    store: Arc<MetaStore>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(manager: Arc<ConnectionManager>, store: Arc<MetaStore>, interval_s: u64) -> Self {
        Self {
            manager,
            store,
            interval: Duration::from_secs(interval_s.max(1)),
        }
    }

    /// Start the background loop
    pub fn start(self, token: CancellationToken) -> JoinHandle<()> {
        info!("Reconciler running every {:?}", self.interval);
        tokio::spawn(async move {
            loop {
                // Sleep in bounded slices
                let mut remaining = self.interval;
                while !remaining.is_zero() {
                    let slice = remaining.min(MAX_SLEEP_SLICE);
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!("Reconciler stopped");
                            return;
                        }
                        _ = tokio::time::sleep(slice) => {}
                    }
                    remaining = remaining.saturating_sub(slice);
                }

                if let Err(e) = self.run_once().await {
                    warn!("Reconcile pass failed: {}", e);
                }
            }
        })
    }

    /// One reconciliation pass
    ///
    /// Removes every tag a driver is polling that the canonical set no
    /// longer contains. At worst this races an in-flight re-add, which
    /// the next reload corrects.
    pub async fn run_once(&self) -> crate::error::Result<usize> {
        let canonical = self.store.subscribed_pairs().await?;
        let empty = HashSet::new();
        let mut removed = 0usize;

        for id in self.manager.connection_ids() {
            let Some(entry) = self.manager.get(&id) else { continue };
            let wanted = canonical.get(&id).unwrap_or(&empty);
            let active = entry.driver.list_active_tag_ids().await;
            for tag_id in active.difference(wanted) {
                match entry.driver.remove_tag(*tag_id).await {
                    Ok(()) => {
                        removed += 1;
                        info!("{}: reconciler removed tag {}", id, tag_id);
                    },
                    Err(e) => warn!("{}: reconcile remove {} failed: {}", id, tag_id, e),
                }
            }
        }
        if removed > 0 {
            debug!("Reconcile pass removed {} tags", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::drivers::Driver;
    use crate::core::manager::tests::test_manager;
    use crate::core::manager::ConfigEvent;
    use edge_model::ConnectionConfig;
    use std::time::Duration as StdDuration;

    async fn seeded() -> (
        Arc<ConnectionManager>,
        Arc<crate::core::manager::tests::MockFactory>,
        Arc<MetaStore>,
    ) {
        let (manager, factory, _, store) = test_manager().await;
        sqlx::query("INSERT INTO poll_groups (id, rate_ms, enabled) VALUES (1, 1000, 1)")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tags (id, connection_id, path, name, kind, poll_group_id)
             VALUES (41, 'plc-1', 'MW0', 'a', 'INT16', 1),
                    (42, 'plc-1', 'MW2', 'b', 'INT16', 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let config: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "id": "plc-1", "type": "s7", "enabled": true, "host": "h"
        }))
        .unwrap();
        manager
            .apply_config(ConfigEvent::Upsert(config))
            .await
            .unwrap();

        // Wait for the boot subscription load
        for _ in 0..50 {
            if let Some(driver) = factory.last_driver() {
                if driver.list_active_tag_ids().await.len() == 2 {
                    break;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        (manager, factory, store)
    }

    /// Reconciler cleanup scenario: the driver polls tag 42, the
    /// canonical set no longer contains it, so remove_tag(42) runs
    /// within one pass and the driver stops reporting it.
    #[tokio::test]
    async fn test_straggler_removed() {
        let (manager, factory, store) = seeded().await;
        sqlx::query("DELETE FROM tags WHERE id = 42")
            .execute(store.pool())
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::clone(&manager), store, 60);
        let removed = reconciler.run_once().await.unwrap();
        assert_eq!(removed, 1);

        let driver = factory.last_driver().unwrap();
        assert!(driver.removed.lock().unwrap().contains(&42));
        assert!(!driver.list_active_tag_ids().await.contains(&42));
        // Tag 41 untouched
        assert!(driver.list_active_tag_ids().await.contains(&41));
    }

    /// Invariant: after a pass, active ids are a subset of canonical.
    #[tokio::test]
    async fn test_idempotent_and_subset() {
        let (manager, factory, store) = seeded().await;
        sqlx::query("UPDATE tags SET subscribe = 0 WHERE id = 41")
            .execute(store.pool())
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::clone(&manager), store.clone(), 60);
        reconciler.run_once().await.unwrap();
        // Second pass removes nothing further
        let removed = reconciler.run_once().await.unwrap();
        assert_eq!(removed, 0);

        let canonical = store.subscribed_pairs().await.unwrap();
        let driver = factory.last_driver().unwrap();
        let active = driver.list_active_tag_ids().await;
        let empty = HashSet::new();
        let wanted = canonical.get("plc-1").unwrap_or(&empty);
        assert!(active.is_subset(wanted));
    }

    #[tokio::test]
    async fn test_background_loop_stops_on_cancel() {
        let (manager, _, store) = seeded().await;
        let reconciler = Reconciler::new(manager, store, 1);
        let token = CancellationToken::new();
        let handle = reconciler.start(token.clone());

        token.cancel();
        tokio::time::timeout(StdDuration::from_secs(2), handle)
            .await
            .expect("loop exits after cancel")
            .unwrap();
    }
}
