//! Raw data returned by the meter data provider.

use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supply {
    pub cups: String,
    pub date_start: NaiveDateTime,
    pub date_end: NaiveDateTime,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub municipality: Option<String>,
    #[serde(default)]
    pub distributor: Option<String>,
    pub point_type: u8,
    pub distributor_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub date_start: NaiveDateTime,
    pub date_end: NaiveDateTime,
    #[serde(default)]
    pub marketer: Option<String>,
    pub distributor_code: String,
    pub power_p1: Option<f64>,
    pub power_p2: Option<f64>,
}

impl Contract {
    pub fn covers(&self, dt: NaiveDateTime) -> bool {
        dt >= self.date_start && dt < self.date_end
    }
}

/// Hourly energy reading; `datetime` is the start of the hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionPoint {
    pub datetime: NaiveDateTime,
    pub delta_h: f64,
    pub value_kwh: f64,
    #[serde(default)]
    pub surplus_kwh: f64,
    pub real: bool,
}

/// Peak power demand reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxPowerPoint {
    pub datetime: NaiveDateTime,
    pub value_kw: f64,
}

/// Hourly cost terms derived from consumption and pricing rules
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CostPoint {
    pub datetime: NaiveDateTime,
    pub power_term: f64,
    pub energy_term: f64,
    pub others_term: f64,
    pub surplus_term: f64,
    pub value_eur: f64,
}

/// Access to a meter data provider account
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Authenticates; `Ok(false)` when the provider rejects the credentials
    async fn login(&self) -> Result<bool, ProviderError>;

    async fn supplies(&self, authorized_nif: Option<&str>) -> Result<Vec<Supply>, ProviderError>;

    async fn contracts(
        &self,
        cups: &str,
        distributor_code: &str,
        authorized_nif: Option<&str>,
    ) -> Result<Vec<Contract>, ProviderError>;

    /// Hourly consumptions for the months spanned by `[since, until]`
    async fn consumptions(
        &self,
        supply: &Supply,
        since: NaiveDate,
        until: NaiveDate,
        authorized_nif: Option<&str>,
    ) -> Result<Vec<ConsumptionPoint>, ProviderError>;

    async fn maximeter(
        &self,
        supply: &Supply,
        since: NaiveDate,
        until: NaiveDate,
        authorized_nif: Option<&str>,
    ) -> Result<Vec<MaxPowerPoint>, ProviderError>;
}
