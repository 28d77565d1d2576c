//! Multi-rate poll scheduler
//!
//! Per connection, one ticker task per active poll group. Each tick takes
//! an immutable snapshot of the group's tag list, invokes the driver's
//! batched read path, and runs change detection on the results. Ticks
//! never overlap for the same group; an overrunning read makes subsequent
//! ticks skip (no queuing).

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use edge_model::{Observation, TagConfig, TagRef};

use crate::core::change::{should_publish, LastSeen};
use crate::core::drivers::{GroupPlan, TagReading};

/// Batched read path a polling driver exposes to its scheduler
#[async_trait]
pub trait GroupReader: Send + Sync + 'static {
    /// Read every tag in the snapshot; failed tags come back with
    /// quality -1 rather than being dropped
    async fn read_group(&self, tags: &[TagConfig]) -> Vec<TagReading>;
}

struct GroupRuntime {
    group_id: i64,
    tags: Arc<RwLock<Vec<TagConfig>>>,
    handle: JoinHandle<()>,
}

/// Per-connection poll scheduler
pub struct PollScheduler {
    connection_id: String,
    reader: Arc<dyn GroupReader>,
    sink: mpsc::Sender<Observation>,
    groups: RwLock<Vec<GroupRuntime>>,
    last_seen: Arc<DashMap<i64, LastSeen>>,
    skipped_ticks: Arc<AtomicU64>,
    token: RwLock<CancellationToken>,
}

impl PollScheduler {
    pub fn new(
        connection_id: impl Into<String>,
        reader: Arc<dyn GroupReader>,
        sink: mpsc::Sender<Observation>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            reader,
            sink,
            groups: RwLock::new(Vec::new()),
            last_seen: Arc::new(DashMap::new()),
            skipped_ticks: Arc::new(AtomicU64::new(0)),
            token: RwLock::new(CancellationToken::new()),
        }
    }

    /// Ticks skipped because the previous execution was still running
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }

    /// Replace the scheduler state atomically: stop all tickers, swap the
    /// group map, restart. The first tick of each new group fires
    /// immediately to seed values.
    pub async fn apply(&self, plans: Vec<GroupPlan>) {
        self.stop().await;

        let token = CancellationToken::new();
        let mut runtimes = Vec::with_capacity(plans.len());
        for plan in plans {
            if !plan.group.enabled || plan.tags.is_empty() {
                continue;
            }
            let tags = Arc::new(RwLock::new(plan.tags));
            let handle = tokio::spawn(Self::run_group(
                self.connection_id.clone(),
                plan.group.id,
                Duration::from_millis(plan.group.rate_ms.max(10)),
                Arc::clone(&tags),
                Arc::clone(&self.reader),
                self.sink.clone(),
                Arc::clone(&self.last_seen),
                Arc::clone(&self.skipped_ticks),
                token.clone(),
            ));
            runtimes.push(GroupRuntime {
                group_id: plan.group.id,
                tags,
                handle,
            });
        }

        debug!("{}: scheduler armed ({} groups)", self.connection_id, runtimes.len());
        *self.groups.write().await = runtimes;
        *self.token.write().await = token;
    }

    /// Stop every ticker; in-flight reads are cancelled without emitting
    pub async fn stop(&self) {
        self.token.read().await.cancel();
        let mut groups = self.groups.write().await;
        for runtime in groups.drain(..) {
            runtime.handle.abort();
        }
    }

    /// Tag ids currently assigned to any group
    pub async fn active_tag_ids(&self) -> HashSet<i64> {
        let groups = self.groups.read().await;
        let mut ids = HashSet::new();
        for runtime in groups.iter() {
            for tag in runtime.tags.read().await.iter() {
                ids.insert(tag.id);
            }
        }
        ids
    }

    /// Remove one tag from whichever group holds it; takes effect on the
    /// next tick of that group
    pub async fn remove_tag(&self, tag_id: i64) -> bool {
        let groups = self.groups.read().await;
        for runtime in groups.iter() {
            let mut tags = runtime.tags.write().await;
            let before = tags.len();
            tags.retain(|t| t.id != tag_id);
            if tags.len() != before {
                self.last_seen.remove(&tag_id);
                debug!(
                    "{}: tag {} removed from group {}",
                    self.connection_id, tag_id, runtime.group_id
                );
                return true;
            }
        }
        false
    }

    /// Tag configs currently scheduled, for one-shot reads
    pub async fn find_tags(&self, tag_ids: &[i64]) -> Vec<TagConfig> {
        let wanted: HashSet<i64> = tag_ids.iter().copied().collect();
        let groups = self.groups.read().await;
        let mut found = Vec::new();
        for runtime in groups.iter() {
            for tag in runtime.tags.read().await.iter() {
                if wanted.contains(&tag.id) {
                    found.push(tag.clone());
                }
            }
        }
        found
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_group(
        connection_id: String,
        group_id: i64,
        rate: Duration,
        tags: Arc<RwLock<Vec<TagConfig>>>,
        reader: Arc<dyn GroupReader>,
        sink: mpsc::Sender<Observation>,
        last_seen: Arc<DashMap<i64, LastSeen>>,
        skipped: Arc<AtomicU64>,
        token: CancellationToken,
    ) {
        let in_flight = Arc::new(AtomicBool::new(false));
        let mut interval = tokio::time::interval(rate);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut consecutive_skips = 0u32;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("{}: group {} ticker stopped", connection_id, group_id);
                    return;
                }
                // First tick fires immediately, seeding initial values
                _ = interval.tick() => {}
            }

            if in_flight.load(Ordering::Acquire) {
                skipped.fetch_add(1, Ordering::Relaxed);
                consecutive_skips += 1;
                if consecutive_skips == 5 {
                    warn!(
                        "{}: group {} overrunning, {} consecutive ticks skipped",
                        connection_id, group_id, consecutive_skips
                    );
                }
                continue;
            }
            consecutive_skips = 0;
            in_flight.store(true, Ordering::Release);

            // Snapshot at tick start; adds/removes take effect next tick
            let snapshot = tags.read().await.clone();
            let reader = Arc::clone(&reader);
            let sink = sink.clone();
            let last_seen = Arc::clone(&last_seen);
            let token = token.clone();
            let in_flight = Arc::clone(&in_flight);
            let connection_id = connection_id.clone();

            tokio::spawn(async move {
                let readings = reader.read_group(&snapshot).await;
                if !token.is_cancelled() {
                    emit_readings(&connection_id, &snapshot, readings, &last_seen, &sink).await;
                }
                in_flight.store(false, Ordering::Release);
            });
        }
    }
}

/// Run change detection over a batch of readings and forward the
/// publishable ones to the sink
pub(crate) async fn emit_readings(
    connection_id: &str,
    tags: &[TagConfig],
    readings: Vec<TagReading>,
    last_seen: &DashMap<i64, LastSeen>,
    sink: &mpsc::Sender<Observation>,
) {
    let now = Utc::now();
    for reading in readings {
        let Some(tag) = tags.iter().find(|t| t.id == reading.tag_id) else {
            continue;
        };
        let publish = {
            let prev = last_seen.get(&reading.tag_id);
            should_publish(
                prev.as_deref(),
                &reading.value,
                reading.quality,
                now,
                &tag.policy,
            )
        };
        if !publish {
            continue;
        }
        last_seen.insert(
            reading.tag_id,
            LastSeen::new(reading.value.clone(), reading.quality, now),
        );
        let obs = Observation {
            connection_id: connection_id.to_string(),
            tag: TagRef::Id(reading.tag_id),
            ts: now,
            value: reading.value,
            quality: reading.quality,
        };
        if sink.send(obs).await.is_err() {
            // Emitter gone; nothing useful left to do
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_model::{ChangePolicy, DataKind, PollGroup, Quality, TagStatus, Value};
    use std::sync::Mutex;
    use std::time::Instant;

    struct MockReader {
        delay: Duration,
        value: Mutex<f64>,
        read_starts: Mutex<Vec<Instant>>,
    }

    impl MockReader {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                value: Mutex::new(1.0),
                read_starts: Mutex::new(Vec::new()),
            }
        }

        fn bump(&self) {
            *self.value.lock().unwrap() += 1.0;
        }

        fn reads(&self) -> usize {
            self.read_starts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GroupReader for MockReader {
        async fn read_group(&self, tags: &[TagConfig]) -> Vec<TagReading> {
            self.read_starts.lock().unwrap().push(Instant::now());
            tokio::time::sleep(self.delay).await;
            let value = *self.value.lock().unwrap();
            tags.iter()
                .map(|t| TagReading::good(t.id, Value::Float(value)))
                .collect()
        }
    }

    fn tag(id: i64, enabled_policy: bool) -> TagConfig {
        TagConfig {
            id,
            connection_id: "c1".into(),
            path: format!("T{}", id),
            name: format!("tag-{}", id),
            kind: DataKind::Real,
            poll_group_id: 1,
            subscribe: true,
            unit: None,
            policy: ChangePolicy {
                enabled: enabled_policy,
                ..ChangePolicy::default()
            },
            status: TagStatus::Active,
        }
    }

    fn plan(rate_ms: u64, tags: Vec<TagConfig>) -> GroupPlan {
        GroupPlan {
            group: PollGroup {
                id: 1,
                rate_ms,
                enabled: true,
            },
            tags,
        }
    }

    #[tokio::test]
    async fn test_seed_tick_fires_immediately() {
        let reader = Arc::new(MockReader::new(Duration::from_millis(1)));
        let (tx, mut rx) = mpsc::channel(64);
        let scheduler = PollScheduler::new("c1", reader.clone(), tx);

        scheduler.apply(vec![plan(10_000, vec![tag(1, false)])]).await;

        let obs = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("seed observation within 500ms")
            .unwrap();
        assert_eq!(obs.tag, TagRef::Id(1));
        assert_eq!(obs.quality, Quality::Good);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_overrun_skips_ticks_without_queuing() {
        // Group at 50ms, read takes 180ms: ticks overlap and must skip
        let reader = Arc::new(MockReader::new(Duration::from_millis(180)));
        let (tx, _rx) = mpsc::channel(1024);
        let scheduler = PollScheduler::new("c1", reader.clone(), tx);

        scheduler.apply(vec![plan(50, vec![tag(1, false)])]).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        scheduler.stop().await;

        // ~500ms / 180ms -> at most 3-4 reads; without skipping there
        // would be ~10
        let reads = reader.reads();
        assert!(reads <= 4, "reads = {}", reads);
        assert!(scheduler.skipped_ticks() >= 2);
    }

    #[tokio::test]
    async fn test_change_detection_suppresses_duplicates() {
        let reader = Arc::new(MockReader::new(Duration::from_millis(1)));
        let (tx, mut rx) = mpsc::channel(1024);
        let scheduler = PollScheduler::new("c1", reader.clone(), tx);

        // Policy enabled: constant value publishes once then suppresses
        scheduler.apply(vec![plan(20, vec![tag(1, true)])]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 1, "constant value should publish once");

        // A value change publishes again
        reader.bump();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 1, "changed value should publish once more");
    }

    #[tokio::test]
    async fn test_remove_tag_takes_effect() {
        let reader = Arc::new(MockReader::new(Duration::from_millis(1)));
        let (tx, _rx) = mpsc::channel(1024);
        let scheduler = PollScheduler::new("c1", reader.clone(), tx);

        scheduler
            .apply(vec![plan(10_000, vec![tag(1, false), tag(2, false)])])
            .await;
        assert_eq!(scheduler.active_tag_ids().await.len(), 2);

        assert!(scheduler.remove_tag(2).await);
        let ids = scheduler.active_tag_ids().await;
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&1));
        assert!(!scheduler.remove_tag(99).await);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_empty_subscription_stops_all_tickers() {
        let reader = Arc::new(MockReader::new(Duration::from_millis(1)));
        let (tx, mut rx) = mpsc::channel(1024);
        let scheduler = PollScheduler::new("c1", reader.clone(), tx);

        scheduler.apply(vec![plan(20, vec![tag(1, false)])]).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        scheduler.apply(Vec::new()).await;
        while rx.try_recv().is_ok() {}
        let reads_after_stop = reader.reads();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(reader.reads(), reads_after_stop);
        assert!(scheduler.active_tag_ids().await.is_empty());
        scheduler.stop().await;
    }
}
