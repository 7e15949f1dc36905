//! Summary attributes and dashboard series derived from the stored statistics.

use crate::dates::{days_in_month, midnight, month_start, months_back};
use crate::error::{ReconcileError, StoreError};
use crate::helper::Dataset;
use crate::statistics::{allows_negative, round1};
use crate::store::{Granularity, StatisticRow, StatsStore, TimeRange};
use crate::streams::{StreamKind, StreamSet};
use crate::tariff::Tariff;
use chrono::{Duration, NaiveDateTime};
use serde_derive::Serialize;
use std::collections::{BTreeMap, HashMap};

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Consumption,
    Surplus,
    Cost,
}

impl Family {
    fn kind(self, tariff: Option<Tariff>) -> StreamKind {
        match self {
            Family::Consumption => StreamKind::Consumption(tariff),
            Family::Surplus => StreamKind::Surplus(tariff),
            Family::Cost => StreamKind::Cost(tariff),
        }
    }

    /// Key suffix used when the series is served, e.g. `value_p1_kWh`
    pub fn unit_key(self) -> &'static str {
        match self {
            Family::Consumption => "kWh",
            Family::Surplus => "surp_kWh",
            Family::Cost => "eur",
        }
    }
}

/// One bucket of a cumulative family split by tariff
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub datetime: NaiveDateTime,
    pub value: f64,
    pub value_p1: f64,
    pub value_p2: f64,
    pub value_p3: f64,
}

impl HistoryEntry {
    fn set(&mut self, tariff: Option<Tariff>, value: f64) {
        match tariff {
            None => self.value = value,
            Some(Tariff::P1) => self.value_p1 = value,
            Some(Tariff::P2) => self.value_p2 = value,
            Some(Tariff::P3) => self.value_p3 = value,
        }
    }

    pub fn tariff_value(&self, tariff: Tariff) -> f64 {
        match tariff {
            Tariff::P1 => self.value_p1,
            Tariff::P2 => self.value_p2,
            Tariff::P3 => self.value_p3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaximeterEntry {
    pub datetime: NaiveDateTime,
    #[serde(rename = "value_kW")]
    pub value_kw: f64,
    #[serde(rename = "value_p1_kW")]
    pub value_p1_kw: f64,
    #[serde(rename = "value_p2_kW")]
    pub value_p2_kw: f64,
}

impl MaximeterEntry {
    pub fn tariff_value(&self, tariff: Tariff) -> f64 {
        match tariff {
            Tariff::P1 => self.value_p1_kw,
            Tariff::P2 => self.value_p2_kw,
            Tariff::P3 => 0.0,
        }
    }
}

/// Series served to the dashboard
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    series: HashMap<(Family, Granularity), Vec<HistoryEntry>>,
    pub maximeter: Vec<MaximeterEntry>,
}

impl History {
    pub fn series(&self, family: Family, granularity: Granularity) -> &[HistoryEntry] {
        self.series
            .get(&(family, granularity))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn find(
        &self,
        family: Family,
        granularity: Granularity,
        datetime: NaiveDateTime,
    ) -> Option<&HistoryEntry> {
        self.series(family, granularity)
            .iter()
            .find(|e| e.datetime == datetime)
    }
}

/// Sensor attributes; unset values are serialised as null
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Attributes {
    pub cups: Option<String>,
    #[serde(rename = "contract_p1_kW")]
    pub contract_p1_kw: Option<f64>,
    #[serde(rename = "contract_p2_kW")]
    pub contract_p2_kw: Option<f64>,
    #[serde(rename = "yesterday_kWh")]
    pub yesterday_kwh: Option<f64>,
    #[serde(rename = "yesterday_hours")]
    pub yesterday_hours: Option<u32>,
    #[serde(rename = "yesterday_p1_kWh")]
    pub yesterday_p1_kwh: Option<f64>,
    #[serde(rename = "yesterday_p2_kWh")]
    pub yesterday_p2_kwh: Option<f64>,
    #[serde(rename = "yesterday_p3_kWh")]
    pub yesterday_p3_kwh: Option<f64>,
    #[serde(rename = "yesterday_surplus_kWh", skip_serializing_if = "Option::is_none")]
    pub yesterday_surplus_kwh: Option<f64>,
    #[serde(rename = "month_kWh")]
    pub month_kwh: Option<f64>,
    #[serde(rename = "month_daily_kWh")]
    pub month_daily_kwh: Option<f64>,
    pub month_days: Option<u32>,
    #[serde(rename = "month_p1_kWh")]
    pub month_p1_kwh: Option<f64>,
    #[serde(rename = "month_p2_kWh")]
    pub month_p2_kwh: Option<f64>,
    #[serde(rename = "month_p3_kWh")]
    pub month_p3_kwh: Option<f64>,
    #[serde(rename = "month_surplus_kWh", skip_serializing_if = "Option::is_none")]
    pub month_surplus_kwh: Option<f64>,
    #[serde(rename = "month_€", skip_serializing_if = "Option::is_none")]
    pub month_eur: Option<f64>,
    #[serde(rename = "last_month_kWh")]
    pub last_month_kwh: Option<f64>,
    #[serde(rename = "last_month_daily_kWh")]
    pub last_month_daily_kwh: Option<f64>,
    pub last_month_days: Option<u32>,
    #[serde(rename = "last_month_p1_kWh")]
    pub last_month_p1_kwh: Option<f64>,
    #[serde(rename = "last_month_p2_kWh")]
    pub last_month_p2_kwh: Option<f64>,
    #[serde(rename = "last_month_p3_kWh")]
    pub last_month_p3_kwh: Option<f64>,
    #[serde(rename = "last_month_surplus_kWh", skip_serializing_if = "Option::is_none")]
    pub last_month_surplus_kwh: Option<f64>,
    #[serde(rename = "last_month_€", skip_serializing_if = "Option::is_none")]
    pub last_month_eur: Option<f64>,
    #[serde(rename = "max_power_kW")]
    pub max_power_kw: Option<f64>,
    pub max_power_date: Option<NaiveDateTime>,
    #[serde(rename = "max_power_mean_kW")]
    pub max_power_mean_kw: Option<f64>,
    #[serde(rename = "max_power_90perc_kW")]
    pub max_power_90perc_kw: Option<f64>,
    pub last_registered_date: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Compiled {
    pub attributes: Attributes,
    pub history: History,
}

/// Percentile with linear interpolation between the closest ranks
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// Turns cumulative rows of every tariff stream into per-bucket increments
fn increments(
    streams: &StreamSet,
    family: Family,
    rows: &HashMap<String, Vec<StatisticRow>>,
) -> Result<Vec<HistoryEntry>, ReconcileError> {
    let mut entries: BTreeMap<NaiveDateTime, HistoryEntry> = BTreeMap::new();
    let tariffs = std::iter::once(None).chain(Tariff::ALL.iter().copied().map(Some));
    for tariff in tariffs {
        let kind = family.kind(tariff);
        let id = streams.id(kind);
        let Some(stream_rows) = rows.get(&id) else {
            continue;
        };
        let mut last = 0.0;
        for row in stream_rows {
            let Some(sum) = row.sum else { continue };
            let increment = sum - last;
            last = sum;
            if round1(increment) < 0.0 && !allows_negative(kind) {
                return Err(ReconcileError::Inconsistent {
                    stream: id,
                    at: row.start,
                    reason: "stored sum decreases".to_string(),
                });
            }
            entries
                .entry(row.start)
                .or_insert_with(|| HistoryEntry {
                    datetime: row.start,
                    ..Default::default()
                })
                .set(tariff, round2(increment));
        }
    }
    Ok(entries.into_values().collect())
}

async fn compile_family(
    store: &dyn StatsStore,
    streams: &StreamSet,
    family: Family,
    history: &mut History,
) -> Result<(), ReconcileError> {
    let ids: Vec<String> = std::iter::once(None)
        .chain(Tariff::ALL.iter().copied().map(Some))
        .map(|t| streams.id(family.kind(t)))
        .collect();
    for granularity in [Granularity::Hour, Granularity::Day, Granularity::Month] {
        let rows = store
            .query(&ids, TimeRange::everything(), granularity)
            .await?;
        let entries = increments(streams, family, &rows)?;
        history.series.insert((family, granularity), entries);
    }
    Ok(())
}

async fn compile_maximeter(
    store: &dyn StatsStore,
    streams: &StreamSet,
) -> Result<Vec<MaximeterEntry>, StoreError> {
    let overall = streams.id(StreamKind::Maximeter(None));
    let p1 = streams.id(StreamKind::Maximeter(Some(Tariff::P1)));
    let p2 = streams.id(StreamKind::Maximeter(Some(Tariff::P2)));
    let rows = store
        .query(
            &[overall.clone(), p1.clone(), p2.clone()],
            TimeRange::everything(),
            Granularity::Hour,
        )
        .await?;

    let mut entries: BTreeMap<NaiveDateTime, MaximeterEntry> = BTreeMap::new();
    for (id, stream_rows) in &rows {
        for row in stream_rows {
            let Some(value) = row.mean.or(row.max) else {
                continue;
            };
            let entry = entries.entry(row.start).or_insert_with(|| MaximeterEntry {
                datetime: row.start,
                ..Default::default()
            });
            let value = round1(value);
            if *id == overall {
                entry.value_kw = value;
            } else if *id == p1 {
                entry.value_p1_kw = value;
            } else if *id == p2 {
                entry.value_p2_kw = value;
            }
        }
    }
    Ok(entries.into_values().collect())
}

fn daily_average(total: Option<f64>, days: Option<u32>) -> Option<f64> {
    match (total, days) {
        (Some(total), Some(days)) if days > 0 => Some(round1(total / days as f64)),
        _ => None,
    }
}

/// Compiles attributes and dashboard series for one meter as of `now`
pub async fn compile(
    store: &dyn StatsStore,
    streams: &StreamSet,
    cups: &str,
    dataset: &Dataset,
    now: NaiveDateTime,
) -> Result<Compiled, ReconcileError> {
    let mut history = History::default();
    compile_family(store, streams, Family::Consumption, &mut history).await?;
    if streams.surplus() {
        compile_family(store, streams, Family::Surplus, &mut history).await?;
    }
    if streams.billing() {
        compile_family(store, streams, Family::Cost, &mut history).await?;
    }
    history.maximeter = compile_maximeter(store, streams).await?;

    let mut attrs = Attributes {
        cups: dataset
            .supplies
            .iter()
            .find(|s| s.cups.eq_ignore_ascii_case(cups))
            .map(|s| s.cups.clone()),
        ..Default::default()
    };
    if let Some(contract) = dataset.contracts.last() {
        attrs.contract_p1_kw = contract.power_p1;
        attrs.contract_p2_kw = contract.power_p2;
    }
    attrs.last_registered_date = store
        .last(&streams.id(StreamKind::Consumption(None)))
        .await?
        .map(|cp| cp.end);

    let today = now.date();
    let yesterday = midnight(today - Duration::days(1));
    if let Some(day) = history.find(Family::Consumption, Granularity::Day, yesterday) {
        attrs.yesterday_kwh = Some(day.value);
        attrs.yesterday_p1_kwh = Some(day.value_p1);
        attrs.yesterday_p2_kwh = Some(day.value_p2);
        attrs.yesterday_p3_kwh = Some(day.value_p3);
        let hours = history
            .series(Family::Consumption, Granularity::Hour)
            .iter()
            .filter(|e| e.datetime.date() == yesterday.date())
            .count();
        attrs.yesterday_hours = Some(hours as u32);
    }
    attrs.yesterday_surplus_kwh = history
        .find(Family::Surplus, Granularity::Day, yesterday)
        .map(|e| e.value);

    let this_month = midnight(month_start(today));
    if let Some(month) = history.find(Family::Consumption, Granularity::Month, this_month) {
        attrs.month_kwh = Some(month.value);
        attrs.month_p1_kwh = Some(month.value_p1);
        attrs.month_p2_kwh = Some(month.value_p2);
        attrs.month_p3_kwh = Some(month.value_p3);
        let days = history
            .series(Family::Consumption, Granularity::Day)
            .iter()
            .filter(|e| e.datetime >= this_month)
            .count();
        attrs.month_days = Some(days as u32);
        attrs.month_daily_kwh = daily_average(attrs.month_kwh, attrs.month_days);
    }
    attrs.month_surplus_kwh = history
        .find(Family::Surplus, Granularity::Month, this_month)
        .map(|e| e.value);
    attrs.month_eur = history
        .find(Family::Cost, Granularity::Month, this_month)
        .map(|e| e.value);

    let last_month = midnight(months_back(today, 1));
    if let Some(month) = history.find(Family::Consumption, Granularity::Month, last_month) {
        attrs.last_month_kwh = Some(month.value);
        attrs.last_month_p1_kwh = Some(month.value_p1);
        attrs.last_month_p2_kwh = Some(month.value_p2);
        attrs.last_month_p3_kwh = Some(month.value_p3);
        attrs.last_month_days = Some(days_in_month(last_month.date()) as u32);
        attrs.last_month_daily_kwh = daily_average(attrs.last_month_kwh, attrs.last_month_days);
    }
    attrs.last_month_surplus_kwh = history
        .find(Family::Surplus, Granularity::Month, last_month)
        .map(|e| e.value);
    attrs.last_month_eur = history
        .find(Family::Cost, Granularity::Month, last_month)
        .map(|e| e.value);

    let values: Vec<f64> = history.maximeter.iter().map(|e| e.value_kw).collect();
    if let Some(peak) = history
        .maximeter
        .iter()
        .reduce(|best, e| if e.value_kw > best.value_kw { e } else { best })
    {
        attrs.max_power_kw = Some(peak.value_kw);
        attrs.max_power_date = Some(peak.datetime);
        attrs.max_power_mean_kw = Some(round1(values.iter().sum::<f64>() / values.len() as f64));
        attrs.max_power_90perc_kw = percentile(&values, 90.0).map(round1);
    }

    Ok(Compiled {
        attributes: attrs,
        history,
    })
}
