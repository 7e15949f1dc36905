use crate::billing::{monthly_costs, BillingProcessor, MonthlyCost};
use crate::dates::{midnight, month_start};
use crate::error::ProviderError;
use crate::provider::{ConsumptionPoint, Contract, CostPoint, DataProvider, MaxPowerPoint, Supply};
use chrono::NaiveDateTime;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything fetched from the provider for one meter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub supplies: Vec<Supply>,
    #[serde(default)]
    pub contracts: Vec<Contract>,
    #[serde(default)]
    pub consumptions: Vec<ConsumptionPoint>,
    #[serde(default)]
    pub maximeter: Vec<MaxPowerPoint>,
    #[serde(default)]
    pub costs: Vec<CostPoint>,
}

/// Consumption summed over a day or a month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionSum {
    pub datetime: NaiveDateTime,
    pub value_kwh: f64,
    pub surplus_kwh: f64,
}

fn merge_by<T, F>(current: &mut Vec<T>, incoming: Vec<T>, key: F)
where
    F: Fn(&T) -> NaiveDateTime,
{
    let mut merged: BTreeMap<NaiveDateTime, T> = current.drain(..).map(|x| (key(&x), x)).collect();
    for item in incoming {
        merged.insert(key(&item), item);
    }
    *current = merged.into_values().collect();
}

impl Dataset {
    pub fn merge_consumptions(&mut self, incoming: Vec<ConsumptionPoint>) {
        merge_by(&mut self.consumptions, incoming, |c| c.datetime);
    }

    pub fn merge_maximeter(&mut self, incoming: Vec<MaxPowerPoint>) {
        merge_by(&mut self.maximeter, incoming, |m| m.datetime);
    }

    pub fn last_consumption(&self) -> Option<NaiveDateTime> {
        self.consumptions.last().map(|c| c.datetime)
    }

    fn sums_by<F>(&self, bucket: F) -> Vec<ConsumptionSum>
    where
        F: Fn(NaiveDateTime) -> NaiveDateTime,
    {
        let mut sums: BTreeMap<NaiveDateTime, ConsumptionSum> = BTreeMap::new();
        for point in &self.consumptions {
            let key = bucket(point.datetime);
            let sum = sums.entry(key).or_insert(ConsumptionSum {
                datetime: key,
                value_kwh: 0.0,
                surplus_kwh: 0.0,
            });
            sum.value_kwh += point.value_kwh;
            sum.surplus_kwh += point.surplus_kwh;
        }
        sums.into_values().collect()
    }

    pub fn consumptions_daily_sum(&self) -> Vec<ConsumptionSum> {
        self.sums_by(|dt| midnight(dt.date()))
    }

    pub fn consumptions_monthly_sum(&self) -> Vec<ConsumptionSum> {
        self.sums_by(|dt| midnight(month_start(dt.date())))
    }

    pub fn cost_monthly_sum(&self) -> Vec<MonthlyCost> {
        monthly_costs(&self.costs)
    }
}

/// Fetches provider data for one supply point and keeps the working dataset
pub struct EdataHelper {
    provider: Arc<dyn DataProvider>,
    cups: String,
    authorized_nif: Option<String>,
    billing: Option<BillingProcessor>,
    data: Dataset,
}

impl EdataHelper {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        cups: &str,
        authorized_nif: Option<String>,
        billing: Option<BillingProcessor>,
        data: Option<Dataset>,
    ) -> Self {
        Self {
            provider,
            cups: cups.to_ascii_uppercase(),
            authorized_nif,
            billing,
            data: data.unwrap_or_default(),
        }
    }

    pub fn cups(&self) -> &str {
        &self.cups
    }

    pub fn data(&self) -> &Dataset {
        &self.data
    }

    pub fn billing_enabled(&self) -> bool {
        self.billing.is_some()
    }

    fn supply(&self) -> Option<&Supply> {
        self.data
            .supplies
            .iter()
            .find(|s| s.cups.eq_ignore_ascii_case(&self.cups))
    }

    /// Fetches `[since, until]` from the provider and merges it into the dataset
    pub async fn update(
        &mut self,
        since: NaiveDateTime,
        until: NaiveDateTime,
    ) -> Result<(), ProviderError> {
        info!("Updating {} from {} to {}", self.cups, since, until);
        if !self.provider.login().await? {
            return Err(ProviderError::InvalidCredentials);
        }
        let nif = self.authorized_nif.as_deref();

        let supplies = self.provider.supplies(nif).await?;
        if !supplies.is_empty() {
            self.data.supplies = supplies;
        }
        let supply = match self.supply() {
            Some(s) => s.clone(),
            None => {
                warn!("CUPS {} not found among the account supplies", self.cups);
                return Err(ProviderError::Payload(format!(
                    "supply {} not found",
                    self.cups
                )));
            }
        };

        let contracts = self
            .provider
            .contracts(&supply.cups, &supply.distributor_code, nif)
            .await?;
        if !contracts.is_empty() {
            self.data.contracts = contracts;
        }

        // Never ask for data outside the supply's validity window
        let since = since.max(supply.date_start).date();
        let until = until.min(supply.date_end).date();
        if since > until {
            return Ok(());
        }

        let consumptions = self
            .provider
            .consumptions(&supply, since, until, nif)
            .await?;
        self.data.merge_consumptions(consumptions);

        let maximeter = self.provider.maximeter(&supply, since, until, nif).await?;
        self.data.merge_maximeter(maximeter);

        self.process_data();
        Ok(())
    }

    /// Recomputes derived data (hourly costs) from the raw dataset
    pub fn process_data(&mut self) {
        let Some(billing) = &self.billing else {
            return;
        };
        match billing.hourly_costs(&self.data.consumptions, &self.data.contracts) {
            Ok(costs) => self.data.costs = costs,
            Err(e) => warn!("Cannot compute costs for {}: {}", self.cups, e),
        }
    }
}
