use crate::attributes::{compile, Compiled};
use crate::dates::{midnight, months_back};
use crate::error::ReconcileError;
use crate::helper::EdataHelper;
use crate::home_assistant::HomeAssistantAPI;
use crate::meter::{MeterHandle, MeterStatus};
use crate::statistics::{Checkpoints, Reconciler};
use crate::storage::DatasetStorage;
use crate::streams::StreamKind;
use chrono::{Duration, Local, Months, NaiveDateTime};
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Fetch window `[since, until]` for a cycle running at `now`
pub fn fetch_window(
    checkpoints: &Checkpoints,
    now: NaiveDateTime,
    months: u32,
) -> (NaiveDateTime, NaiveDateTime) {
    let today = midnight(now.date());
    let floor = midnight(months_back(now.date(), months));
    let until = today - Duration::minutes(1);

    let energy = checkpoints.get(&StreamKind::Consumption(None)).map(|c| c.start);
    let power = checkpoints.get(&StreamKind::Maximeter(None)).map(|c| c.start);
    let since = match (energy, power) {
        (Some(energy), Some(power)) => {
            let month_ago = now.checked_sub_months(Months::new(1)).unwrap_or(floor);
            energy.min(power).min(month_ago).max(floor)
        }
        _ => floor,
    };
    (since, until)
}

/// Polls the provider for one meter and keeps its statistics and summary current
pub struct MeterCoordinator {
    helper: EdataHelper,
    reconciler: Reconciler,
    handle: MeterHandle,
    storage: DatasetStorage,
    home_assistant: Option<HomeAssistantAPI>,
    months_back: u32,
    update_interval: StdDuration,
    first_run: bool,
    rebuild_pending: bool,
}

impl MeterCoordinator {
    pub fn new(
        helper: EdataHelper,
        reconciler: Reconciler,
        handle: MeterHandle,
        storage: DatasetStorage,
    ) -> Self {
        Self {
            helper,
            reconciler,
            handle,
            storage,
            home_assistant: None,
            months_back: 12,
            update_interval: StdDuration::from_secs(60 * 60),
            first_run: true,
            rebuild_pending: false,
        }
    }

    pub fn with_home_assistant(mut self, api: HomeAssistantAPI) -> Self {
        self.home_assistant = Some(api);
        self
    }

    pub fn with_months_back(mut self, months: u32) -> Self {
        self.months_back = months;
        self
    }

    pub fn with_update_interval(mut self, update_interval: StdDuration) -> Self {
        self.update_interval = update_interval;
        self
    }

    /// Wipes and regenerates the statistics on the next cycle
    pub fn schedule_rebuild(&mut self) {
        self.rebuild_pending = true;
    }

    pub fn handle(&self) -> &MeterHandle {
        &self.handle
    }

    pub fn helper(&self) -> &EdataHelper {
        &self.helper
    }

    /// Spawns the coordinator in its own task
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(
            "Starting coordinator for {} every {:?}",
            self.handle.scups(),
            self.update_interval
        );
        let mut update_interval = interval(self.update_interval);

        loop {
            update_interval.tick().await;
            if let Err(e) = self.update().await {
                error!("Update of {} failed: {:#}", self.handle.scups(), e);
            }
        }
    }

    /// Runs one cycle now; failures leave the meter in the error state
    pub async fn update(&mut self) -> anyhow::Result<()> {
        let now = Local::now().naive_local();
        match self.cycle(now).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.handle.set_status(MeterStatus::Error);
                self.publish_state().await;
                Err(e)
            }
        }
    }

    /// Clears and fully regenerates the statistics right away
    pub async fn recreate_statistics(&mut self) -> anyhow::Result<()> {
        warn!("Recreating statistics for {}", self.handle.scups());
        self.schedule_rebuild();
        self.update().await
    }

    pub async fn cycle(&mut self, now: NaiveDateTime) -> anyhow::Result<()> {
        let scups = self.handle.scups().to_string();

        if self.first_run {
            if !self.reconciler.check_integrity().await? {
                warn!(
                    "Inconsistent stored data for {}, attempting to autofix it by wiping and rebuilding stats",
                    scups
                );
                self.rebuild_pending = true;
            }
            self.first_run = false;
        }

        // A pending rebuild fetches from the floor; streams are only cleared once the data validates
        let checkpoints = if self.rebuild_pending {
            Checkpoints::new()
        } else {
            self.reconciler.checkpoints().await?
        };
        let (since, until) = fetch_window(&checkpoints, now, self.months_back);
        if let Err(e) = self.helper.update(since, until).await {
            // Stored data is still reconciled when the provider is unreachable
            warn!("Cannot fetch new data for {}: {}", scups, e);
        }

        let mut rebuilt = self.rebuild_pending;
        let result = if self.rebuild_pending {
            self.reconciler.rebuild(self.helper.data()).await
        } else {
            self.reconciler.reconcile(self.helper.data()).await
        };
        match result {
            Ok(written) => debug!("{} statistic records written for {}", written, scups),
            Err(e) if e.is_inconsistent() => {
                warn!(
                    "Inconsistent stored data for {}, attempting to autofix it by wiping and rebuilding stats",
                    scups
                );
                debug!("{}", e);
                self.reconciler.rebuild(self.helper.data()).await?;
                rebuilt = true;
            }
            Err(e) => return Err(e.into()),
        }
        self.rebuild_pending = false;

        let compiled = match self.compile(now).await {
            Err(e) if e.is_inconsistent() && !rebuilt => {
                warn!(
                    "Inconsistent stored data for {}, attempting to autofix it by wiping and rebuilding stats",
                    scups
                );
                self.reconciler.rebuild(self.helper.data()).await?;
                self.compile(now).await?
            }
            result => result?,
        };

        let data = self.helper.data();
        self.handle.publish(compiled, &data.supplies, &data.contracts);
        self.storage.save(data).await?;
        self.publish_state().await;
        Ok(())
    }

    async fn compile(&self, now: NaiveDateTime) -> Result<Compiled, ReconcileError> {
        compile(
            self.reconciler.store(),
            self.reconciler.streams(),
            self.helper.cups(),
            self.helper.data(),
            now,
        )
        .await
    }

    async fn publish_state(&self) {
        let Some(api) = &self.home_assistant else {
            return;
        };
        let view = self.handle.view();
        if let Err(e) = api
            .publish_meter(self.handle.scups(), view.status(), &view.attributes())
            .await
        {
            warn!("Cannot publish {} to Home Assistant: {}", self.handle.scups(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::test_support::{at, consumption, FakeProvider, CUPS};
    use crate::provider::MaxPowerPoint;
    use crate::error::StoreError;
    use crate::store::{
        Checkpoint, Granularity, MemoryStatsStore, StatisticRecord, StatisticRows, StatsStore,
        TimeRange,
    };
    use crate::streams::{StreamMetadata, StreamSet};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn checkpoint(start: NaiveDateTime) -> Checkpoint {
        Checkpoint {
            start,
            end: start + Duration::hours(1),
            sum: Some(1.0),
        }
    }

    #[test]
    fn test_fetch_window_without_checkpoints() {
        let (since, until) = fetch_window(&Checkpoints::new(), at(3, 20, 12), 12);
        assert_eq!(since, at(3, 1, 0) - Months::new(12));
        assert_eq!(until, at(3, 19, 23) + Duration::minutes(59));
    }

    #[test]
    fn test_fetch_window_uses_oldest_checkpoint() {
        let mut checkpoints = Checkpoints::new();
        checkpoints.insert(StreamKind::Consumption(None), checkpoint(at(3, 18, 23)));
        checkpoints.insert(StreamKind::Maximeter(None), checkpoint(at(3, 10, 14)));
        // The previous month is always fetched again
        let (since, _) = fetch_window(&checkpoints, at(3, 20, 12), 12);
        assert_eq!(since, at(2, 20, 12));

        checkpoints.insert(StreamKind::Maximeter(None), checkpoint(at(1, 5, 0)));
        let (since, _) = fetch_window(&checkpoints, at(3, 20, 12), 12);
        assert_eq!(since, at(1, 5, 0));

        // Never older than the configured floor
        let (since, _) = fetch_window(&checkpoints, at(3, 20, 12), 1);
        assert_eq!(since, at(2, 1, 0));
    }

    #[test]
    fn test_fetch_window_with_partial_checkpoints() {
        let mut checkpoints = Checkpoints::new();
        checkpoints.insert(StreamKind::Consumption(None), checkpoint(at(3, 18, 23)));
        let (since, _) = fetch_window(&checkpoints, at(3, 20, 12), 2);
        assert_eq!(since, at(1, 1, 0));
    }

    fn provider() -> Arc<FakeProvider> {
        Arc::new(FakeProvider::new(
            (0..48)
                .map(|h| consumption(at(3, 17, 0) + Duration::hours(h), 0.5))
                .collect(),
            vec![MaxPowerPoint {
                datetime: at(3, 18, 10),
                value_kw: 3.2,
            }],
        ))
    }

    fn coordinator(
        store: Arc<MemoryStatsStore>,
        dir: &std::path::Path,
    ) -> MeterCoordinator {
        coordinator_with(store, provider(), dir)
    }

    fn coordinator_with(
        store: Arc<dyn StatsStore>,
        provider: Arc<FakeProvider>,
        dir: &std::path::Path,
    ) -> MeterCoordinator {
        let helper = EdataHelper::new(provider, CUPS, None, None, None);
        let reconciler = Reconciler::new(store, StreamSet::new("78EV", false, false));
        MeterCoordinator::new(
            helper,
            reconciler,
            MeterHandle::new(CUPS, "78EV"),
            DatasetStorage::new(dir, CUPS, "78EV"),
        )
    }

    #[tokio::test]
    async fn test_cycle_publishes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStatsStore::new());
        let mut coordinator = coordinator(store.clone(), dir.path());
        let view = coordinator.handle().view();
        assert_eq!(view.status(), MeterStatus::Loading);

        coordinator.cycle(at(3, 20, 12)).await.unwrap();

        assert_eq!(view.status(), MeterStatus::Ready);
        let attributes = view.attributes();
        assert_eq!(attributes.yesterday_kwh, None);
        assert_eq!(attributes.max_power_kw, Some(3.2));
        assert_eq!(attributes.last_registered_date, Some(at(3, 19, 0)));
        assert_eq!(store.records("edata:78ev_consumption").len(), 48);

        let stored = DatasetStorage::new(dir.path(), CUPS, "78EV")
            .load()
            .await
            .unwrap();
        assert_eq!(stored.consumptions.len(), 48);

        // A second cycle finds nothing new to write
        coordinator.cycle(at(3, 20, 13)).await.unwrap();
        assert_eq!(store.records("edata:78ev_consumption").len(), 48);
    }

    #[tokio::test]
    async fn test_corrupt_statistics_are_rebuilt_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStatsStore::new());
        let streams = StreamSet::new("78EV", false, false);
        let id = streams.id(StreamKind::Consumption(None));
        store
            .insert(
                &streams.metadata(StreamKind::Consumption(None)),
                &[
                    StatisticRecord::cumulative(at(3, 17, 1), 1.0, 10.0),
                    StatisticRecord::cumulative(at(3, 18, 1), 1.0, 2.0),
                ],
            )
            .await
            .unwrap();

        let mut coordinator = coordinator(store.clone(), dir.path());
        coordinator.cycle(at(3, 20, 12)).await.unwrap();

        let records = store.records(&id);
        assert_eq!(records.len(), 48);
        assert_eq!(records.last().and_then(|r| r.sum), Some(24.0));
        assert_eq!(coordinator.handle().status(), MeterStatus::Ready);
    }

    #[tokio::test]
    async fn test_recreate_statistics_keeps_the_same_sums() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStatsStore::new());
        let mut coordinator = coordinator(store.clone(), dir.path());
        coordinator.cycle(at(3, 20, 12)).await.unwrap();
        let before = store.records("edata:78ev_consumption");

        coordinator.schedule_rebuild();
        coordinator.cycle(at(3, 20, 13)).await.unwrap();
        assert_eq!(store.records("edata:78ev_consumption"), before);
    }

    #[tokio::test]
    async fn test_invalid_reading_keeps_stored_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStatsStore::new());
        let provider = provider();
        let mut coordinator = coordinator_with(store.clone(), provider.clone(), dir.path());
        coordinator.cycle(at(3, 20, 12)).await.unwrap();
        let before = store.records("edata:78ev_consumption");
        assert_eq!(before.len(), 48);

        provider
            .consumptions
            .lock()
            .unwrap()
            .push(consumption(at(3, 19, 0), -0.01));
        assert!(coordinator.cycle(at(3, 20, 13)).await.is_err());
        assert_eq!(store.records("edata:78ev_consumption"), before);
        assert!(!store.list("edata:78ev").await.unwrap().is_empty());

        // A scheduled rebuild refuses the same data instead of wiping
        coordinator.schedule_rebuild();
        assert!(coordinator.cycle(at(3, 20, 14)).await.is_err());
        assert_eq!(store.records("edata:78ev_consumption"), before);
    }

    /// Memory store whose first query fails
    struct FlakyStore {
        inner: MemoryStatsStore,
        failed: AtomicBool,
    }

    #[async_trait]
    impl StatsStore for FlakyStore {
        async fn last(&self, stream_id: &str) -> Result<Option<Checkpoint>, StoreError> {
            self.inner.last(stream_id).await
        }

        async fn query(
            &self,
            stream_ids: &[String],
            range: TimeRange,
            granularity: Granularity,
        ) -> Result<StatisticRows, StoreError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("recorder restarting".to_string()));
            }
            self.inner.query(stream_ids, range, granularity).await
        }

        async fn insert(
            &self,
            metadata: &StreamMetadata,
            records: &[StatisticRecord],
        ) -> Result<(), StoreError> {
            self.inner.insert(metadata, records).await
        }

        async fn clear(&self, stream_ids: &[String]) -> Result<(), StoreError> {
            self.inner.clear(stream_ids).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_integrity_check_retried_after_store_failure() {
        let dir = tempfile::tempdir().unwrap();
        let streams = StreamSet::new("78EV", false, false);
        let id = streams.id(StreamKind::Consumption(None));
        let store = Arc::new(FlakyStore {
            inner: MemoryStatsStore::new(),
            failed: AtomicBool::new(false),
        });
        store
            .insert(
                &streams.metadata(StreamKind::Consumption(None)),
                &[
                    StatisticRecord::cumulative(at(3, 17, 1), 1.0, 10.0),
                    StatisticRecord::cumulative(at(3, 18, 1), 1.0, 2.0),
                ],
            )
            .await
            .unwrap();

        let mut coordinator = coordinator_with(store.clone(), provider(), dir.path());
        assert!(coordinator.cycle(at(3, 20, 12)).await.is_err());

        coordinator.cycle(at(3, 20, 13)).await.unwrap();
        let records = store.inner.records(&id);
        assert_eq!(records.len(), 48);
        assert_eq!(records.last().and_then(|r| r.sum), Some(24.0));
        assert_eq!(coordinator.handle().status(), MeterStatus::Ready);
    }
}
