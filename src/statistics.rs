//! Incremental long-term statistics for one meter.
//!
//! Each pass reads the checkpoint of every active stream, keeps only the raw
//! points that start at or after the checkpoint's end and appends them with
//! running sums continued from the stored ones. Nothing is written unless the
//! whole batch is consistent; inconsistent input is reported so the caller can
//! wipe and rebuild the meter.

use crate::dates::truncate_hour;
use crate::error::{ReconcileError, StoreError};
use crate::helper::Dataset;
use crate::store::{Checkpoint, Granularity, StatisticRecord, StatsStore, TimeRange};
use crate::streams::{StreamKind, StreamSet};
use crate::tariff::{maximeter_tariff, tariff_at};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type Checkpoints = HashMap<StreamKind, Checkpoint>;

type Batch = BTreeMap<StreamKind, Vec<StatisticRecord>>;

/// One raw point split into the values it contributes to each stream
type Contribution = (NaiveDateTime, Vec<(StreamKind, f64)>);

pub struct Reconciler {
    store: Arc<dyn StatsStore>,
    streams: StreamSet,
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

impl Reconciler {
    pub fn new(store: Arc<dyn StatsStore>, streams: StreamSet) -> Self {
        Self { store, streams }
    }

    pub fn streams(&self) -> &StreamSet {
        &self.streams
    }

    pub fn store(&self) -> &dyn StatsStore {
        self.store.as_ref()
    }

    fn inconsistent(&self, kind: StreamKind, at: NaiveDateTime, reason: &str) -> ReconcileError {
        ReconcileError::Inconsistent {
            stream: self.streams.id(kind),
            at,
            reason: reason.to_string(),
        }
    }

    fn invalid(&self, kind: StreamKind, at: NaiveDateTime, reason: &str) -> ReconcileError {
        ReconcileError::InvalidInput {
            stream: self.streams.id(kind),
            at,
            reason: reason.to_string(),
        }
    }

    /// Last persisted bucket of every active stream that has one
    pub async fn checkpoints(&self) -> Result<Checkpoints, StoreError> {
        let mut checkpoints = Checkpoints::new();
        for kind in self.streams.all() {
            if let Some(checkpoint) = self.store.last(&self.streams.id(kind)).await? {
                checkpoints.insert(kind, checkpoint);
            }
        }
        Ok(checkpoints)
    }

    /// Appends every not yet persisted point of `dataset`; returns the number of records written
    pub async fn reconcile(&self, dataset: &Dataset) -> Result<usize, ReconcileError> {
        let checkpoints = self.checkpoints().await?;
        let active = self.streams.all();
        if !checkpoints.is_empty() && checkpoints.len() < active.len() {
            for kind in active.iter().filter(|k| !checkpoints.contains_key(k)) {
                warn!("Statistic '{}' is missing", self.streams.id(*kind));
            }
        }
        let batch = self.plan(&checkpoints, dataset)?;
        self.write(&batch).await
    }

    /// Records every stream needs on top of `checkpoints`; nothing is written
    fn plan(&self, checkpoints: &Checkpoints, dataset: &Dataset) -> Result<Batch, ReconcileError> {
        let mut batch = Batch::new();
        self.accumulate(
            checkpoints,
            StreamKind::Consumption(None),
            consumption_contributions(dataset),
            &mut batch,
        )?;
        if self.streams.surplus() {
            self.accumulate(
                checkpoints,
                StreamKind::Surplus(None),
                surplus_contributions(dataset),
                &mut batch,
            )?;
        }
        if self.streams.billing() {
            self.accumulate(
                checkpoints,
                StreamKind::Cost(None),
                cost_contributions(dataset),
                &mut batch,
            )?;
        }
        self.peaks(checkpoints, dataset, &mut batch)?;
        Ok(batch)
    }

    async fn write(&self, batch: &Batch) -> Result<usize, ReconcileError> {
        let mut written = 0;
        for (kind, records) in batch {
            if records.is_empty() {
                continue;
            }
            debug!(
                "Importing {} records into {}",
                records.len(),
                self.streams.id(*kind)
            );
            self.store
                .insert(&self.streams.metadata(*kind), records)
                .await?;
            written += records.len();
        }
        if written > 0 {
            info!(
                "Imported {} statistic records for {}",
                written,
                self.streams.scups()
            );
        }
        Ok(written)
    }

    /// Builds running-sum records of one family anchored on its overall stream
    fn accumulate(
        &self,
        checkpoints: &Checkpoints,
        anchor: StreamKind,
        points: Vec<Contribution>,
        batch: &mut Batch,
    ) -> Result<(), ReconcileError> {
        let from = checkpoints.get(&anchor);
        let mut sums: HashMap<StreamKind, f64> = HashMap::new();
        let mut previous: Option<NaiveDateTime> = None;

        for (start, values) in points {
            if previous.is_some_and(|p| start <= p) {
                return Err(self.invalid(anchor, start, "raw series out of order"));
            }
            previous = Some(start);
            if from.is_some_and(|cp| !cp.admits(start)) {
                continue;
            }
            for (kind, value) in values {
                if !value.is_finite() || (value < 0.0 && !allows_negative(kind)) {
                    return Err(self.invalid(kind, start, "negative increment"));
                }
                let checkpoint = checkpoints.get(&kind);
                if checkpoint.is_some_and(|cp| !cp.admits(start)) {
                    return Err(self.inconsistent(kind, start, "point older than stored data"));
                }
                let sum = sums
                    .entry(kind)
                    .or_insert_with(|| checkpoint.and_then(|cp| cp.sum).unwrap_or(0.0));
                *sum += value;
                batch
                    .entry(kind)
                    .or_default()
                    .push(StatisticRecord::cumulative(start, value, *sum));
            }
        }
        Ok(())
    }

    fn peaks(
        &self,
        checkpoints: &Checkpoints,
        dataset: &Dataset,
        batch: &mut Batch,
    ) -> Result<(), ReconcileError> {
        let anchor = StreamKind::Maximeter(None);
        let from = checkpoints.get(&anchor);
        let mut previous: Option<NaiveDateTime> = None;

        for point in &dataset.maximeter {
            if previous.is_some_and(|p| point.datetime <= p) {
                return Err(self.invalid(anchor, point.datetime, "raw series out of order"));
            }
            previous = Some(point.datetime);
            let start = truncate_hour(point.datetime);
            if from.is_some_and(|cp| !cp.admits(start)) {
                continue;
            }
            if !point.value_kw.is_finite() || point.value_kw < 0.0 {
                return Err(self.invalid(anchor, start, "invalid power reading"));
            }
            let tariff = StreamKind::Maximeter(Some(maximeter_tariff(point.datetime)));
            for kind in [anchor, tariff] {
                if checkpoints.get(&kind).is_some_and(|cp| !cp.admits(start)) {
                    return Err(self.inconsistent(kind, start, "point older than stored data"));
                }
                let records = batch.entry(kind).or_default();
                // Readings sharing an hour collapse into that hour's peak
                match records.last_mut() {
                    Some(last) if last.start == start => {
                        if last.max.is_some_and(|max| point.value_kw > max) {
                            *last = StatisticRecord::peak(start, point.value_kw);
                        }
                    }
                    _ => records.push(StatisticRecord::peak(start, point.value_kw)),
                }
            }
        }
        Ok(())
    }

    /// Streams whose running sum must never decrease
    fn monotonic_streams(&self) -> Vec<String> {
        self.streams
            .cumulative()
            .into_iter()
            .filter(|k| !allows_negative(*k))
            .map(|k| self.streams.id(k))
            .collect()
    }

    /// True when no stored day or month bucket has a decreasing sum
    pub async fn check_integrity(&self) -> Result<bool, StoreError> {
        let ids = self.monotonic_streams();
        for granularity in [Granularity::Month, Granularity::Day] {
            let rows = self
                .store
                .query(&ids, TimeRange::everything(), granularity)
                .await?;
            for (id, rows) in &rows {
                let mut last = 0.0;
                for row in rows {
                    let Some(sum) = row.sum else { continue };
                    let increment = round1(sum - last);
                    last = sum;
                    if increment < 0.0 {
                        debug!(
                            "{} decreases by {} at {} ({})",
                            id,
                            increment,
                            row.start,
                            granularity.as_str()
                        );
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Wipes every stream stored for this meter
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let prefix = format!("{}_", self.streams.prefix());
        let to_clear = self.store.list(&prefix).await?;
        if to_clear.is_empty() {
            return Ok(());
        }
        warn!("Clearing statistics for {:?}", to_clear);
        self.store.clear(&to_clear).await
    }

    /// Clears the meter and regenerates every stream from `dataset`.
    ///
    /// The dataset is validated first; invalid source data leaves the stored streams untouched.
    pub async fn rebuild(&self, dataset: &Dataset) -> Result<usize, ReconcileError> {
        let batch = self.plan(&Checkpoints::new(), dataset)?;
        self.clear_all().await?;
        self.write(&batch).await
    }
}

/// Net cost goes below zero in hours where surplus compensation exceeds the bill
pub(crate) fn allows_negative(kind: StreamKind) -> bool {
    matches!(kind, StreamKind::Cost(_))
}

fn consumption_contributions(dataset: &Dataset) -> Vec<Contribution> {
    dataset
        .consumptions
        .iter()
        .map(|c| {
            let tariff = tariff_at(c.datetime);
            (
                c.datetime,
                vec![
                    (StreamKind::Consumption(None), c.value_kwh),
                    (StreamKind::Consumption(Some(tariff)), c.value_kwh),
                ],
            )
        })
        .collect()
}

fn surplus_contributions(dataset: &Dataset) -> Vec<Contribution> {
    dataset
        .consumptions
        .iter()
        .map(|c| {
            let tariff = tariff_at(c.datetime);
            (
                c.datetime,
                vec![
                    (StreamKind::Surplus(None), c.surplus_kwh),
                    (StreamKind::Surplus(Some(tariff)), c.surplus_kwh),
                ],
            )
        })
        .collect()
}

fn cost_contributions(dataset: &Dataset) -> Vec<Contribution> {
    dataset
        .costs
        .iter()
        .map(|c| {
            let tariff = tariff_at(c.datetime);
            let net = c.value_eur;
            (
                c.datetime,
                vec![
                    (StreamKind::PowerCost, c.power_term),
                    (StreamKind::EnergyCost(None), c.energy_term),
                    (StreamKind::EnergyCost(Some(tariff)), c.energy_term),
                    (StreamKind::Cost(None), net),
                    (StreamKind::Cost(Some(tariff)), net),
                ],
            )
        })
        .collect()
}
