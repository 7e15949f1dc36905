//! [`StatsStore`] over the Home Assistant websocket API.
//!
//! The recorder's message shapes changed across Home Assistant releases. The
//! dialect is picked once from the version announced in the authentication
//! handshake and every request and row goes through it.

use crate::dates::{epoch, one_hour};
use crate::error::StoreError;
use crate::store::{
    Checkpoint, Granularity, StatisticRecord, StatisticRow, StatisticRows, StatsStore, TimeRange,
};
use crate::streams::StreamMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::OnceLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Recorder API generations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderDialect {
    /// Before 2022.12: no `types` selector, ISO timestamps
    Legacy,
    /// 2022.12 to 2023.2: `types` selector, ISO timestamps
    Typed,
    /// 2023.3 onwards: `types` selector, epoch milliseconds
    Epoch,
}

impl RecorderDialect {
    /// Unparseable versions are assumed to be recent
    pub fn from_version(version: &str) -> Self {
        let mut parts = version.split('.');
        let major = parts.next().and_then(|p| p.parse::<u32>().ok());
        let minor = parts.next().and_then(|p| {
            let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });
        match (major, minor) {
            (Some(major), Some(minor)) if (major, minor) < (2022, 12) => RecorderDialect::Legacy,
            (Some(major), Some(minor)) if (major, minor) < (2023, 3) => RecorderDialect::Typed,
            _ => RecorderDialect::Epoch,
        }
    }

    fn has_types(self) -> bool {
        !matches!(self, RecorderDialect::Legacy)
    }

    pub fn period_request(
        self,
        stream_ids: &[String],
        range: TimeRange,
        granularity: Granularity,
    ) -> Value {
        let mut request = json!({
            "type": "recorder/statistics_during_period",
            "start_time": to_utc(range.start).to_rfc3339(),
            "statistic_ids": stream_ids,
            "period": granularity.as_str(),
        });
        if let Some(end) = range.end {
            request["end_time"] = json!(to_utc(end).to_rfc3339());
        }
        if self.has_types() {
            request["types"] = json!(["state", "sum", "mean", "max"]);
        }
        request
    }

    /// Timestamps of returned rows
    pub fn parse_time(self, value: &Value) -> Result<NaiveDateTime, StoreError> {
        let utc = match self {
            RecorderDialect::Epoch => value
                .as_f64()
                .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64)),
            RecorderDialect::Legacy | RecorderDialect::Typed => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        };
        utc.map(|dt| dt.with_timezone(&Local).naive_local())
            .ok_or_else(|| StoreError::Malformed(format!("bad timestamp {}", value)))
    }

    fn parse_row(self, row: &Value) -> Result<StatisticRow, StoreError> {
        let field = |name: &str| row.get(name).and_then(Value::as_f64);
        let start = self.parse_time(&row["start"])?;
        let end = match row.get("end") {
            Some(end) if !end.is_null() => self.parse_time(end)?,
            _ => start + one_hour(),
        };
        Ok(StatisticRow {
            start,
            end,
            state: field("state"),
            sum: field("sum"),
            mean: field("mean"),
            max: field("max"),
        })
    }
}

/// Local wall-clock time to UTC; a time skipped by a DST change moves forward an hour
pub fn to_utc(local: NaiveDateTime) -> DateTime<Utc> {
    Local
        .from_local_datetime(&local)
        .earliest()
        .or_else(|| Local.from_local_datetime(&(local + one_hour())).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local))
}

fn import_request(metadata: &StreamMetadata, records: &[StatisticRecord]) -> Value {
    let stats: Vec<Value> = records
        .iter()
        .map(|r| {
            let mut stat = json!({
                "start": to_utc(r.start).to_rfc3339(),
                "state": r.state,
            });
            if let Some(sum) = r.sum {
                stat["sum"] = json!(sum);
            }
            if let Some(mean) = r.mean {
                stat["mean"] = json!(mean);
            }
            if let Some(max) = r.max {
                stat["max"] = json!(max);
            }
            stat
        })
        .collect();
    json!({
        "type": "recorder/import_statistics",
        "metadata": metadata,
        "stats": stats,
    })
}

fn websocket_url(endpoint_url: &str) -> String {
    let base = endpoint_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/api/websocket", base)
}

struct Connection {
    socket: Socket,
    next_id: u64,
}

pub struct RecorderStatsStore {
    url: String,
    auth_token: String,
    dialect: OnceLock<RecorderDialect>,
    connection: Mutex<Option<Connection>>,
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

async fn next_json(socket: &mut Socket) -> Result<Value, StoreError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(unavailable("connection closed"));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(unavailable(e)),
        }
    }
}

async fn exchange(
    connection: &mut Connection,
    request: &Value,
    id: u64,
) -> Result<Value, StoreError> {
    connection
        .socket
        .send(Message::Text(request.to_string()))
        .await
        .map_err(unavailable)?;
    loop {
        let message = next_json(&mut connection.socket).await?;
        if message["id"].as_u64() == Some(id) && message["type"] == "result" {
            return Ok(message);
        }
    }
}

impl RecorderStatsStore {
    /// Creates the store and authenticates once, which fixes the dialect
    pub async fn connect(endpoint_url: &str, auth_token: &str) -> Result<Self, StoreError> {
        let store = Self {
            url: websocket_url(endpoint_url),
            auth_token: auth_token.to_string(),
            dialect: OnceLock::new(),
            connection: Mutex::new(None),
        };
        let connection = store.open().await?;
        *store.connection.lock().await = Some(connection);
        Ok(store)
    }

    pub fn dialect(&self) -> RecorderDialect {
        self.dialect.get().copied().unwrap_or(RecorderDialect::Epoch)
    }

    async fn open(&self) -> Result<Connection, StoreError> {
        debug!("Connecting to {}", self.url);
        let (mut socket, _) = connect_async(self.url.as_str()).await.map_err(unavailable)?;

        let hello = next_json(&mut socket).await?;
        if hello["type"] != "auth_required" {
            return Err(unavailable(format!("unexpected greeting {}", hello)));
        }
        let auth = json!({"type": "auth", "access_token": self.auth_token});
        socket
            .send(Message::Text(auth.to_string()))
            .await
            .map_err(unavailable)?;

        let reply = next_json(&mut socket).await?;
        if reply["type"] != "auth_ok" {
            return Err(StoreError::Rejected {
                command: "auth".to_string(),
                message: reply["message"].as_str().unwrap_or("auth_invalid").to_string(),
            });
        }
        let version = reply["ha_version"]
            .as_str()
            .or_else(|| hello["ha_version"].as_str())
            .unwrap_or_default();
        if self.dialect.get().is_none() {
            let dialect = RecorderDialect::from_version(version);
            info!("Home Assistant {} uses the {:?} recorder dialect", version, dialect);
            let _ = self.dialect.set(dialect);
        }
        Ok(Connection { socket, next_id: 1 })
    }

    /// Sends one command and waits for its result, reconnecting if needed
    async fn call(&self, mut request: Value) -> Result<Value, StoreError> {
        let command = request["type"].as_str().unwrap_or_default().to_string();
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(unavailable("not connected"));
        };

        let id = connection.next_id;
        connection.next_id += 1;
        request["id"] = json!(id);

        let result = exchange(connection, &request, id).await;

        let message = match result {
            Ok(message) => message,
            Err(e) => {
                warn!("Recorder connection lost: {}", e);
                *guard = None;
                return Err(e);
            }
        };
        if message["success"].as_bool() == Some(true) {
            Ok(message["result"].clone())
        } else {
            Err(StoreError::Rejected {
                command,
                message: message["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        }
    }

    async fn rows(
        &self,
        stream_ids: &[String],
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<StatisticRows, StoreError> {
        let dialect = self.dialect();
        let result = self
            .call(dialect.period_request(stream_ids, range, granularity))
            .await?;
        let Some(by_id) = result.as_object() else {
            return Ok(StatisticRows::new());
        };
        let mut rows = StatisticRows::new();
        for (id, list) in by_id {
            let parsed = list
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .map(|row| dialect.parse_row(row))
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()?
                .unwrap_or_default();
            if !parsed.is_empty() {
                rows.insert(id.clone(), parsed);
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl StatsStore for RecorderStatsStore {
    async fn last(&self, stream_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let ids = [stream_id.to_string()];
        let recent = TimeRange::since(Local::now().naive_local() - Duration::days(31));
        for range in [recent, TimeRange::since(epoch())] {
            let rows = self.rows(&ids, range, Granularity::Hour).await?;
            if let Some(row) = rows.get(stream_id).and_then(|r| r.last()) {
                return Ok(Some(Checkpoint {
                    start: row.start,
                    end: row.end,
                    sum: row.sum,
                }));
            }
        }
        Ok(None)
    }

    async fn query(
        &self,
        stream_ids: &[String],
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<StatisticRows, StoreError> {
        if stream_ids.is_empty() {
            return Ok(StatisticRows::new());
        }
        self.rows(stream_ids, range, granularity).await
    }

    async fn insert(
        &self,
        metadata: &StreamMetadata,
        records: &[StatisticRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.call(import_request(metadata, records)).await?;
        Ok(())
    }

    async fn clear(&self, stream_ids: &[String]) -> Result<(), StoreError> {
        if stream_ids.is_empty() {
            return Ok(());
        }
        self.call(json!({"type": "recorder/clear_statistics", "statistic_ids": stream_ids}))
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let result = self
            .call(json!({"type": "recorder/list_statistic_ids"}))
            .await?;
        let mut ids: Vec<String> = result
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["statistic_id"].as_str())
                    .filter(|id| id.starts_with(prefix))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }
}
