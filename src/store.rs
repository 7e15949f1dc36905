//! The statistics store seam.
//!
//! Reconciliation never talks to a concrete database: it goes through [`StatsStore`],
//! which is implemented by the Home Assistant recorder adapter and by
//! [`MemoryStatsStore`] for tests and dry runs.

use crate::dates::{midnight, month_start, next_month, one_hour, truncate_hour};
use crate::error::StoreError;
use crate::streams::StreamMetadata;
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// One hourly record written to a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticRecord {
    pub start: NaiveDateTime,
    pub state: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl StatisticRecord {
    pub fn cumulative(start: NaiveDateTime, state: f64, sum: f64) -> Self {
        Self {
            start,
            state,
            sum: Some(sum),
            mean: None,
            max: None,
        }
    }

    pub fn peak(start: NaiveDateTime, value: f64) -> Self {
        Self {
            start,
            state: value,
            sum: None,
            mean: Some(value),
            max: Some(value),
        }
    }
}

/// A row read back from the store at some aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticRow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub state: Option<f64>,
    pub sum: Option<f64>,
    pub mean: Option<f64>,
    pub max: Option<f64>,
}

/// Last persisted bucket of a stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub sum: Option<f64>,
}

impl Checkpoint {
    /// A raw point belongs after this checkpoint iff it starts at or after `end`
    pub fn admits(&self, start: NaiveDateTime) -> bool {
        start >= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
        }
    }

    pub fn bucket_start(self, dt: NaiveDateTime) -> NaiveDateTime {
        match self {
            Granularity::Hour => truncate_hour(dt),
            Granularity::Day => midnight(dt.date()),
            Granularity::Month => midnight(month_start(dt.date())),
        }
    }

    pub fn bucket_end(self, start: NaiveDateTime) -> NaiveDateTime {
        match self {
            Granularity::Hour => start + one_hour(),
            Granularity::Day => start + Duration::days(1),
            Granularity::Month => midnight(next_month(start.date())),
        }
    }
}

/// Half-open interval `[start, end)`; an open end means "until now"
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
}

impl TimeRange {
    pub fn since(start: NaiveDateTime) -> Self {
        Self { start, end: None }
    }

    pub fn everything() -> Self {
        Self::since(crate::dates::epoch())
    }

    pub fn contains(&self, dt: NaiveDateTime) -> bool {
        dt >= self.start && self.end.map_or(true, |end| dt < end)
    }
}

pub type StatisticRows = HashMap<String, Vec<StatisticRow>>;

#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Last hourly bucket persisted for `stream_id`, if any
    async fn last(&self, stream_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Rows per stream id at the given aggregation, ordered by start
    async fn query(
        &self,
        stream_ids: &[String],
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<StatisticRows, StoreError>;

    /// Imports hourly records, replacing any bucket with the same start
    async fn insert(
        &self,
        metadata: &StreamMetadata,
        records: &[StatisticRecord],
    ) -> Result<(), StoreError>;

    async fn clear(&self, stream_ids: &[String]) -> Result<(), StoreError>;

    /// Known stream ids starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

struct StoredStream {
    metadata: StreamMetadata,
    records: BTreeMap<NaiveDateTime, StatisticRecord>,
}

/// Process-local statistics store
#[derive(Default)]
pub struct MemoryStatsStore {
    streams: Mutex<HashMap<String, StoredStream>>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw hourly records of a stream, for inspection
    pub fn records(&self, stream_id: &str) -> Vec<StatisticRecord> {
        self.lock()
            .get(stream_id)
            .map(|s| s.records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn metadata(&self, stream_id: &str) -> Option<StreamMetadata> {
        self.lock().get(stream_id).map(|s| s.metadata.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredStream>> {
        // A poisoned map still holds consistent per-call writes
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn aggregate(
    records: &BTreeMap<NaiveDateTime, StatisticRecord>,
    range: TimeRange,
    granularity: Granularity,
) -> Vec<StatisticRow> {
    let mut rows: Vec<StatisticRow> = Vec::new();
    let mut means: Vec<(f64, usize)> = Vec::new();

    for record in records.values() {
        let start = granularity.bucket_start(record.start);
        if !range.contains(start) {
            continue;
        }
        match rows.last_mut() {
            Some(row) if row.start == start => {
                row.state = Some(row.state.unwrap_or(0.0) + record.state);
                if record.sum.is_some() {
                    row.sum = record.sum;
                }
                if let Some(mean) = record.mean {
                    if let Some(acc) = means.last_mut() {
                        acc.0 += mean;
                        acc.1 += 1;
                    }
                }
                row.max = match (row.max, record.max) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            _ => {
                rows.push(StatisticRow {
                    start,
                    end: granularity.bucket_end(start),
                    state: Some(record.state),
                    sum: record.sum,
                    mean: record.mean,
                    max: record.max,
                });
                means.push(record.mean.map_or((0.0, 0), |m| (m, 1)));
            }
        }
    }

    for (row, (total, count)) in rows.iter_mut().zip(means) {
        if count > 0 {
            row.mean = Some(total / count as f64);
        }
    }
    rows
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
    async fn last(&self, stream_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .lock()
            .get(stream_id)
            .and_then(|s| s.records.values().next_back())
            .map(|r| Checkpoint {
                start: r.start,
                end: r.start + one_hour(),
                sum: r.sum,
            }))
    }

    async fn query(
        &self,
        stream_ids: &[String],
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<StatisticRows, StoreError> {
        let streams = self.lock();
        Ok(stream_ids
            .iter()
            .filter_map(|id| {
                let stream = streams.get(id)?;
                let rows = aggregate(&stream.records, range, granularity);
                (!rows.is_empty()).then(|| (id.clone(), rows))
            })
            .collect())
    }

    async fn insert(
        &self,
        metadata: &StreamMetadata,
        records: &[StatisticRecord],
    ) -> Result<(), StoreError> {
        let mut streams = self.lock();
        let stream = streams
            .entry(metadata.statistic_id.clone())
            .or_insert_with(|| StoredStream {
                metadata: metadata.clone(),
                records: BTreeMap::new(),
            });
        stream.metadata = metadata.clone();
        for record in records {
            stream
                .records
                .insert(truncate_hour(record.start), record.clone());
        }
        Ok(())
    }

    async fn clear(&self, stream_ids: &[String]) -> Result<(), StoreError> {
        let mut streams = self.lock();
        for id in stream_ids {
            streams.remove(id);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .lock()
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}
