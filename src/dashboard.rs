//! Read API for the dashboard card.
//!
//! Messages follow the Home Assistant websocket command shape: a JSON object
//! with an `id` and a `type`, answered by a `result` message echoing the id.

use crate::attributes::{Family, HistoryEntry};
use crate::meter::{MeterRegistry, MeterView};
use crate::store::Granularity;
use crate::tariff::Tariff;
use serde_derive::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{error, warn};

const DEFAULT_RECORDS: usize = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct SeriesQuery {
    pub scups: String,
    #[serde(default)]
    pub records: Option<usize>,
    #[serde(default)]
    pub tariff: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaximeterQuery {
    pub scups: String,
    #[serde(default)]
    pub tariff: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "edata/consumptions/hourly")]
    ConsumptionsHourly(SeriesQuery),
    #[serde(rename = "edata/consumptions/daily")]
    ConsumptionsDaily(SeriesQuery),
    #[serde(rename = "edata/consumptions/monthly")]
    ConsumptionsMonthly(SeriesQuery),
    #[serde(rename = "edata/surplus/daily")]
    SurplusDaily(SeriesQuery),
    #[serde(rename = "edata/surplus/monthly")]
    SurplusMonthly(SeriesQuery),
    #[serde(rename = "edata/costs/daily")]
    CostsDaily(SeriesQuery),
    #[serde(rename = "edata/costs/monthly")]
    CostsMonthly(SeriesQuery),
    #[serde(rename = "edata/maximeter")]
    Maximeter(MaximeterQuery),
}

impl Command {
    fn scups(&self) -> &str {
        match self {
            Command::ConsumptionsHourly(q)
            | Command::ConsumptionsDaily(q)
            | Command::ConsumptionsMonthly(q)
            | Command::SurplusDaily(q)
            | Command::SurplusMonthly(q)
            | Command::CostsDaily(q)
            | Command::CostsMonthly(q) => &q.scups,
            Command::Maximeter(q) => &q.scups,
        }
    }

    fn tariff(&self) -> Option<u8> {
        match self {
            Command::ConsumptionsHourly(q)
            | Command::ConsumptionsDaily(q)
            | Command::ConsumptionsMonthly(q)
            | Command::SurplusDaily(q)
            | Command::SurplusMonthly(q)
            | Command::CostsDaily(q)
            | Command::CostsMonthly(q) => q.tariff,
            Command::Maximeter(q) => q.tariff,
        }
    }
}

fn success(id: u64, result: Value) -> Value {
    json!({"id": id, "type": "result", "success": true, "result": result})
}

fn failure(id: Option<u64>, code: &str, message: String) -> Value {
    json!({
        "id": id,
        "type": "result",
        "success": false,
        "error": {"code": code, "message": message},
    })
}

fn entry_json(entry: &HistoryEntry, family: Family) -> Value {
    let unit = family.unit_key();
    let mut map = Map::new();
    map.insert("datetime".into(), json!(entry.datetime));
    map.insert(format!("value_{}", unit), json!(entry.value));
    for tariff in Tariff::ALL {
        map.insert(
            format!("value_{}_{}", tariff.label(), unit),
            json!(entry.tariff_value(tariff)),
        );
    }
    Value::Object(map)
}

fn series(
    view: &MeterView,
    family: Family,
    granularity: Granularity,
    query: &SeriesQuery,
    tariff: Option<Tariff>,
) -> Value {
    let records = query.records.unwrap_or(DEFAULT_RECORDS);
    view.with_state(|state| {
        let entries: Vec<&HistoryEntry> = state
            .history
            .series(family, granularity)
            .iter()
            .filter(|e| tariff.map_or(true, |t| e.tariff_value(t) > 0.0))
            .collect();
        let skip = entries.len().saturating_sub(records);
        Value::Array(
            entries[skip..]
                .iter()
                .map(|e| entry_json(e, family))
                .collect(),
        )
    })
}

fn maximeter(view: &MeterView, tariff: Option<Tariff>) -> Value {
    view.with_state(|state| {
        let entries: Vec<Value> = state
            .history
            .maximeter
            .iter()
            .filter(|e| tariff.map_or(true, |t| e.tariff_value(t) > 0.0))
            .map(|e| json!(e))
            .collect();
        Value::Array(entries)
    })
}

/// Answers one dashboard request
pub fn handle(registry: &MeterRegistry, request: Value) -> Value {
    let Some(id) = request.get("id").and_then(Value::as_u64) else {
        return failure(None, "invalid_format", "missing message id".to_string());
    };
    let command: Command = match serde_json::from_value(request) {
        Ok(command) => command,
        Err(e) => {
            warn!("Invalid dashboard request {}: {}", id, e);
            return failure(Some(id), "invalid_format", e.to_string());
        }
    };
    let tariff = match command.tariff() {
        None => None,
        Some(index) => match Tariff::from_index(index) {
            Some(tariff) => Some(tariff),
            None => {
                warn!("Invalid dashboard request {}: unknown tariff {}", id, index);
                return failure(Some(id), "invalid_format", format!("unknown tariff {}", index));
            }
        },
    };
    let scups = command.scups().to_ascii_uppercase();
    let Some(view) = registry.get(&scups) else {
        error!("The provided scups parameter is not correct: {}", scups);
        return failure(Some(id), "not_found", format!("unknown meter {}", scups));
    };

    let result = match &command {
        Command::ConsumptionsHourly(q) => {
            series(&view, Family::Consumption, Granularity::Hour, q, tariff)
        }
        Command::ConsumptionsDaily(q) => {
            series(&view, Family::Consumption, Granularity::Day, q, tariff)
        }
        Command::ConsumptionsMonthly(q) => {
            series(&view, Family::Consumption, Granularity::Month, q, tariff)
        }
        Command::SurplusDaily(q) => series(&view, Family::Surplus, Granularity::Day, q, tariff),
        Command::SurplusMonthly(q) => {
            series(&view, Family::Surplus, Granularity::Month, q, tariff)
        }
        Command::CostsDaily(q) => series(&view, Family::Cost, Granularity::Day, q, tariff),
        Command::CostsMonthly(q) => series(&view, Family::Cost, Granularity::Month, q, tariff),
        Command::Maximeter(_) => maximeter(&view, tariff),
    };
    success(id, result)
}

/// Text-frame entry point
pub fn handle_text(registry: &MeterRegistry, message: &str) -> Value {
    match serde_json::from_str(message) {
        Ok(request) => handle(registry, request),
        Err(e) => failure(None, "invalid_format", e.to_string()),
    }
}
