use crate::dates::{month_start, next_month};
use crate::error::ProviderError;
use crate::provider::{ConsumptionPoint, Contract, DataProvider, MaxPowerPoint, Supply};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DATADIS_URL: &str = "https://datadis.es";

const LOGIN_PATH: &str = "/nikola-auth/tokens/login";
const SUPPLIES_PATH: &str = "/api-private/api/get-supplies";
const CONTRACTS_PATH: &str = "/api-private/api/get-contract-detail";
const CONSUMPTIONS_PATH: &str = "/api-private/api/get-consumption-data";
const MAXIMETER_PATH: &str = "/api-private/api/get-max-power";

/// Datadis private API client
pub struct DatadisConnector {
    endpoint_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl DatadisConnector {
    pub fn new(username: &str, password: &str) -> Self {
        Self::with_endpoint(DATADIS_URL, username, password)
    }

    pub fn with_endpoint(endpoint_url: &str, username: &str, password: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client,
            token: Mutex::new(None),
        }
    }

    async fn token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.token.lock().await.clone() {
            return Ok(token);
        }
        if !self.login().await? {
            return Err(ProviderError::InvalidCredentials);
        }
        self.token
            .lock()
            .await
            .clone()
            .ok_or(ProviderError::InvalidCredentials)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let token = self.token().await?;
        debug!("Datadis GET {} {:?}", path, query);
        let response = self
            .client
            .get(format!("{}{}", self.endpoint_url, path))
            .bearer_auth(&token)
            .query(query)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::UNAUTHORIZED => {
                // Token expired; next call logs in again
                *self.token.lock().await = None;
                Err(ProviderError::InvalidCredentials)
            }
            status => Err(ProviderError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

fn nif_query(query: &mut Vec<(&str, String)>, authorized_nif: Option<&str>) {
    if let Some(nif) = authorized_nif.filter(|n| !n.is_empty()) {
        query.push(("authorizedNif", nif.to_string()));
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, ProviderError> {
    NaiveDate::parse_from_str(value.trim(), "%Y/%m/%d")
        .map_err(|e| ProviderError::Payload(format!("bad date '{}': {}", value, e)))
}

fn open_end() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .unwrap_or(NaiveDate::MAX)
        .and_time(NaiveTime::MIN)
}

fn parse_range_end(value: Option<&str>) -> Result<NaiveDateTime, ProviderError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => Ok(parse_date(v)?.and_time(NaiveTime::MIN)),
        None => Ok(open_end()),
    }
}

/// Datadis labels `date` + `time` with the end of the measured interval ("01:00".."24:00")
fn parse_timestamp(date: &str, time: &str) -> Result<NaiveDateTime, ProviderError> {
    let date = parse_date(date)?;
    let (hours, minutes) = time
        .trim()
        .split_once(':')
        .and_then(|(h, m)| Some((h.parse::<i64>().ok()?, m.parse::<i64>().ok()?)))
        .ok_or_else(|| ProviderError::Payload(format!("bad time '{}'", time)))?;
    Ok(date.and_time(NaiveTime::MIN) + Duration::hours(hours) + Duration::minutes(minutes))
}

fn month_param(date: NaiveDate) -> String {
    date.format("%Y/%m").to_string()
}

/// Months touched by `[since, until]`, as first days
fn months(since: NaiveDate, until: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut cursor = month_start(since);
    while cursor <= until {
        out.push(cursor);
        cursor = next_month(cursor);
    }
    out
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatadisSupply {
    cups: String,
    valid_date_from: String,
    #[serde(default)]
    valid_date_to: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    postal_code: Option<String>,
    #[serde(default)]
    province: Option<String>,
    #[serde(default)]
    municipality: Option<String>,
    #[serde(default)]
    distributor: Option<String>,
    point_type: u8,
    distributor_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatadisContract {
    start_date: String,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    marketer: Option<String>,
    distributor_code: String,
    #[serde(rename = "contractedPowerkW", default)]
    contracted_power_kw: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatadisConsumption {
    date: String,
    time: String,
    #[serde(rename = "consumptionKWh")]
    consumption_kwh: f64,
    #[serde(default)]
    obtain_method: Option<String>,
    #[serde(rename = "surplusEnergyKWh", default)]
    surplus_energy_kwh: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatadisMaxPower {
    date: String,
    time: String,
    max_power: f64,
}

#[async_trait]
impl DataProvider for DatadisConnector {
    async fn login(&self) -> Result<bool, ProviderError> {
        info!("Logging into Datadis as {}", self.username);
        let response = self
            .client
            .post(format!("{}{}", self.endpoint_url, LOGIN_PATH))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let token = response.text().await?;
                *self.token.lock().await = Some(token.trim().to_string());
                Ok(true)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Datadis rejected credentials for {}", self.username);
                Ok(false)
            }
            status => Err(ProviderError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn supplies(&self, authorized_nif: Option<&str>) -> Result<Vec<Supply>, ProviderError> {
        let mut query = Vec::new();
        nif_query(&mut query, authorized_nif);
        let raw: Vec<DatadisSupply> = self.get(SUPPLIES_PATH, &query).await?;
        raw.into_iter()
            .map(|s| {
                Ok(Supply {
                    date_start: parse_date(&s.valid_date_from)?.and_time(NaiveTime::MIN),
                    date_end: parse_range_end(s.valid_date_to.as_deref())?,
                    cups: s.cups,
                    address: s.address,
                    postal_code: s.postal_code,
                    province: s.province,
                    municipality: s.municipality,
                    distributor: s.distributor,
                    point_type: s.point_type,
                    distributor_code: s.distributor_code,
                })
            })
            .collect()
    }

    async fn contracts(
        &self,
        cups: &str,
        distributor_code: &str,
        authorized_nif: Option<&str>,
    ) -> Result<Vec<Contract>, ProviderError> {
        let mut query = vec![
            ("cups", cups.to_string()),
            ("distributorCode", distributor_code.to_string()),
        ];
        nif_query(&mut query, authorized_nif);
        let raw: Vec<DatadisContract> = self.get(CONTRACTS_PATH, &query).await?;
        raw.into_iter()
            .map(|c| {
                Ok(Contract {
                    date_start: parse_date(&c.start_date)?.and_time(NaiveTime::MIN),
                    date_end: parse_range_end(c.end_date.as_deref())?,
                    marketer: c.marketer,
                    distributor_code: c.distributor_code,
                    power_p1: c.contracted_power_kw.first().copied(),
                    power_p2: c.contracted_power_kw.get(1).copied(),
                })
            })
            .collect()
    }

    async fn consumptions(
        &self,
        supply: &Supply,
        since: NaiveDate,
        until: NaiveDate,
        authorized_nif: Option<&str>,
    ) -> Result<Vec<ConsumptionPoint>, ProviderError> {
        let mut points = Vec::new();
        for month in months(since, until) {
            let mut query = vec![
                ("cups", supply.cups.clone()),
                ("distributorCode", supply.distributor_code.clone()),
                ("startDate", month_param(month)),
                ("endDate", month_param(month)),
                ("measurementType", "0".to_string()),
                ("pointType", supply.point_type.to_string()),
            ];
            nif_query(&mut query, authorized_nif);
            let raw: Vec<DatadisConsumption> = self.get(CONSUMPTIONS_PATH, &query).await?;
            for c in raw {
                let end = parse_timestamp(&c.date, &c.time)?;
                points.push(ConsumptionPoint {
                    datetime: end - Duration::hours(1),
                    delta_h: 1.0,
                    value_kwh: c.consumption_kwh,
                    surplus_kwh: c.surplus_energy_kwh.unwrap_or(0.0),
                    real: c.obtain_method.as_deref() == Some("Real"),
                });
            }
        }
        info!(
            "Fetched {} consumptions for {} between {} and {}",
            points.len(),
            supply.cups,
            since,
            until
        );
        Ok(points)
    }

    async fn maximeter(
        &self,
        supply: &Supply,
        since: NaiveDate,
        until: NaiveDate,
        authorized_nif: Option<&str>,
    ) -> Result<Vec<MaxPowerPoint>, ProviderError> {
        let mut query = vec![
            ("cups", supply.cups.clone()),
            ("distributorCode", supply.distributor_code.clone()),
            ("startDate", month_param(since)),
            ("endDate", month_param(until)),
        ];
        nif_query(&mut query, authorized_nif);
        let raw: Vec<DatadisMaxPower> = self.get(MAXIMETER_PATH, &query).await?;
        raw.into_iter()
            .map(|m| {
                Ok(MaxPowerPoint {
                    datetime: parse_timestamp(&m.date, &m.time)?,
                    value_kw: m.max_power,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod test_datadis {
    use super::*;

    fn supply() -> Supply {
        Supply {
            cups: "ES0031405512345678EV".to_string(),
            date_start: NaiveDate::from_ymd_opt(2020, 1, 1)
                .unwrap()
                .and_time(NaiveTime::MIN),
            date_end: open_end(),
            address: None,
            postal_code: None,
            province: None,
            municipality: None,
            distributor: None,
            point_type: 5,
            distributor_code: "2".to_string(),
        }
    }

    #[test]
    fn test_timestamp_parsing_shifts_to_bucket_start() {
        let end = parse_timestamp("2024/01/01", "24:00").unwrap();
        assert_eq!(
            end,
            NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_time(NaiveTime::MIN)
        );
        assert!(parse_timestamp("2024/01/01", "xx").is_err());
        assert!(parse_timestamp("01-01-2024", "01:00").is_err());
    }

    #[test]
    fn test_months_between() {
        let since = NaiveDate::from_ymd_opt(2023, 11, 20).unwrap();
        let until = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let m = months(since, until);
        assert_eq!(m.len(), 3);
        assert_eq!(month_param(m[0]), "2023/11");
        assert_eq!(month_param(m[2]), "2024/01");
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", LOGIN_PATH)
            .with_status(401)
            .create_async()
            .await;

        let api = DatadisConnector::with_endpoint(&server.url(), "user", "wrong");
        assert!(!api.login().await.unwrap());
        mock.assert_async().await;

        let result = api.supplies(None).await;
        assert!(matches!(result, Err(ProviderError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_supplies_and_contracts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", LOGIN_PATH)
            .with_status(200)
            .with_body("test_token")
            .create_async()
            .await;
        let supplies = server
            .mock("GET", SUPPLIES_PATH)
            .match_header("Authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{
                    "address": "Calle Falsa 123",
                    "cups": "ES0031405512345678EV",
                    "postalCode": "28001",
                    "province": "Madrid",
                    "municipality": "Madrid",
                    "distributor": "I-DE",
                    "validDateFrom": "2020/09/01",
                    "validDateTo": "",
                    "pointType": 5,
                    "distributorCode": "2"
                }]"#,
            )
            .create_async()
            .await;
        let contracts = server
            .mock("GET", CONTRACTS_PATH)
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("cups".into(), "ES0031405512345678EV".into()),
                mockito::Matcher::UrlEncoded("distributorCode".into(), "2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{
                    "startDate": "2021/06/01",
                    "endDate": "",
                    "marketer": "ACME",
                    "distributorCode": "2",
                    "contractedPowerkW": [4.6, 3.45]
                }]"#,
            )
            .create_async()
            .await;

        let api = DatadisConnector::with_endpoint(&server.url(), "user", "pass");
        let found = api.supplies(None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].point_type, 5);
        assert_eq!(found[0].date_end, open_end());

        let found = api
            .contracts("ES0031405512345678EV", "2", None)
            .await
            .unwrap();
        assert_eq!(found[0].power_p1, Some(4.6));
        assert_eq!(found[0].power_p2, Some(3.45));
        assert_eq!(found[0].marketer.as_deref(), Some("ACME"));

        supplies.assert_async().await;
        contracts.assert_async().await;
    }

    #[tokio::test]
    async fn test_consumptions_and_maximeter() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", LOGIN_PATH)
            .with_status(200)
            .with_body("test_token")
            .create_async()
            .await;
        server
            .mock("GET", CONSUMPTIONS_PATH)
            .match_query(mockito::Matcher::UrlEncoded(
                "startDate".into(),
                "2024/01".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"cups": "ES0031405512345678EV", "date": "2024/01/01", "time": "01:00",
                     "consumptionKWh": 0.25, "obtainMethod": "Real", "surplusEnergyKWh": 0.0},
                    {"cups": "ES0031405512345678EV", "date": "2024/01/01", "time": "24:00",
                     "consumptionKWh": 0.5, "obtainMethod": "Estimada", "surplusEnergyKWh": 0.1}
                ]"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", MAXIMETER_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"cups": "ES0031405512345678EV", "date": "2024/01/15", "time": "13:45", "maxPower": 4.2}]"#,
            )
            .create_async()
            .await;

        let api = DatadisConnector::with_endpoint(&server.url(), "user", "pass");
        let since = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let until = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();

        let points = api.consumptions(&supply(), since, until, None).await.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].datetime, since.and_time(NaiveTime::MIN));
        assert!(points[0].real);
        assert_eq!(
            points[1].datetime,
            since.and_hms_opt(23, 0, 0).unwrap()
        );
        assert!(!points[1].real);
        assert_eq!(points[1].surplus_kwh, 0.1);

        let peaks = api.maximeter(&supply(), since, until, None).await.unwrap();
        assert_eq!(peaks.len(), 1);
        assert_eq!(
            peaks[0].datetime,
            NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(13, 45, 0)
                .unwrap()
        );
        assert_eq!(peaks[0].value_kw, 4.2);
    }
}
