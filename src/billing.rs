use crate::dates::{midnight, month_start};
use crate::error::FormulaError;
use crate::formula::Formula;
use crate::provider::{ConsumptionPoint, Contract, CostPoint};
use crate::tariff::{tariff_at, Tariff};
use chrono::NaiveDateTime;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_ENERGY_FORMULA: &str = "electricity_tax * iva_tax * kwh_eur * kwh";
pub const DEFAULT_POWER_FORMULA: &str = "electricity_tax * iva_tax * (p1_kw * (p1_kw_year_eur + market_kw_year_eur) + p2_kw * p2_kw_year_eur) / 365 / 24";
pub const DEFAULT_OTHERS_FORMULA: &str = "iva_tax * meter_month_eur / 30 / 24";
pub const DEFAULT_SURPLUS_FORMULA: &str = "electricity_tax * iva_tax * surplus_kwh * surplus_kwh_eur";

/// Variables every billing formula may reference
pub const FORMULA_VARIABLES: [&str; 18] = [
    "kwh",
    "kwh_eur",
    "surplus_kwh",
    "surplus_kwh_eur",
    "p1_kw",
    "p2_kw",
    "p1_kw_year_eur",
    "p2_kw_year_eur",
    "p1_kwh_eur",
    "p2_kwh_eur",
    "p3_kwh_eur",
    "market_kw_year_eur",
    "meter_month_eur",
    "electricity_tax",
    "iva_tax",
    "surplus_p1_kwh_eur",
    "surplus_p2_kwh_eur",
    "surplus_p3_kwh_eur",
];

fn default_p1_kw_year_eur() -> f64 {
    30.67266
}
fn default_p2_kw_year_eur() -> f64 {
    1.4243591
}
fn default_meter_month_eur() -> f64 {
    0.81
}
fn default_market_kw_year_eur() -> f64 {
    3.113
}
fn default_tax() -> f64 {
    1.05
}
fn default_energy_formula() -> String {
    DEFAULT_ENERGY_FORMULA.to_string()
}
fn default_power_formula() -> String {
    DEFAULT_POWER_FORMULA.to_string()
}
fn default_others_formula() -> String {
    DEFAULT_OTHERS_FORMULA.to_string()
}
fn default_surplus_formula() -> String {
    DEFAULT_SURPLUS_FORMULA.to_string()
}

/// Billing parameters entered by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRules {
    #[serde(default = "default_p1_kw_year_eur")]
    pub p1_kw_year_eur: f64,
    #[serde(default = "default_p2_kw_year_eur")]
    pub p2_kw_year_eur: f64,
    #[serde(default)]
    pub p1_kwh_eur: f64,
    #[serde(default)]
    pub p2_kwh_eur: f64,
    #[serde(default)]
    pub p3_kwh_eur: f64,
    #[serde(default)]
    pub surplus_p1_kwh_eur: f64,
    #[serde(default)]
    pub surplus_p2_kwh_eur: f64,
    #[serde(default)]
    pub surplus_p3_kwh_eur: f64,
    #[serde(default = "default_meter_month_eur")]
    pub meter_month_eur: f64,
    #[serde(default = "default_market_kw_year_eur")]
    pub market_kw_year_eur: f64,
    #[serde(default = "default_tax")]
    pub electricity_tax: f64,
    #[serde(default = "default_tax")]
    pub iva_tax: f64,
    #[serde(default = "default_energy_formula")]
    pub energy_formula: String,
    #[serde(default = "default_power_formula")]
    pub power_formula: String,
    #[serde(default = "default_others_formula")]
    pub others_formula: String,
    #[serde(default = "default_surplus_formula")]
    pub surplus_formula: String,
}

impl Default for PricingRules {
    fn default() -> Self {
        Self {
            p1_kw_year_eur: default_p1_kw_year_eur(),
            p2_kw_year_eur: default_p2_kw_year_eur(),
            p1_kwh_eur: 0.0,
            p2_kwh_eur: 0.0,
            p3_kwh_eur: 0.0,
            surplus_p1_kwh_eur: 0.0,
            surplus_p2_kwh_eur: 0.0,
            surplus_p3_kwh_eur: 0.0,
            meter_month_eur: default_meter_month_eur(),
            market_kw_year_eur: default_market_kw_year_eur(),
            electricity_tax: default_tax(),
            iva_tax: default_tax(),
            energy_formula: default_energy_formula(),
            power_formula: default_power_formula(),
            others_formula: default_others_formula(),
            surplus_formula: default_surplus_formula(),
        }
    }
}

impl PricingRules {
    fn energy_price(&self, tariff: Tariff) -> f64 {
        match tariff {
            Tariff::P1 => self.p1_kwh_eur,
            Tariff::P2 => self.p2_kwh_eur,
            Tariff::P3 => self.p3_kwh_eur,
        }
    }

    fn surplus_price(&self, tariff: Tariff) -> f64 {
        match tariff {
            Tariff::P1 => self.surplus_p1_kwh_eur,
            Tariff::P2 => self.surplus_p2_kwh_eur,
            Tariff::P3 => self.surplus_p3_kwh_eur,
        }
    }
}

/// Monthly cost totals
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MonthlyCost {
    pub datetime: NaiveDateTime,
    pub value_eur: f64,
    pub energy_term: f64,
    pub power_term: f64,
    pub others_term: f64,
    pub surplus_term: f64,
}

/// Pricing rules with their formulas parsed and validated
#[derive(Debug, Clone)]
pub struct BillingProcessor {
    rules: PricingRules,
    energy: Formula,
    power: Formula,
    others: Formula,
    surplus: Formula,
}

fn parse_checked(source: &str) -> Result<Formula, FormulaError> {
    let formula = Formula::parse(source)?;
    formula.check_variables(&FORMULA_VARIABLES)?;
    Ok(formula)
}

impl BillingProcessor {
    pub fn new(rules: PricingRules) -> Result<Self, FormulaError> {
        Ok(Self {
            energy: parse_checked(&rules.energy_formula)?,
            power: parse_checked(&rules.power_formula)?,
            others: parse_checked(&rules.others_formula)?,
            surplus: parse_checked(&rules.surplus_formula)?,
            rules,
        })
    }

    pub fn rules(&self) -> &PricingRules {
        &self.rules
    }

    fn variables(
        &self,
        point: &ConsumptionPoint,
        contract: &Contract,
    ) -> HashMap<&'static str, f64> {
        let r = &self.rules;
        let tariff = tariff_at(point.datetime);
        HashMap::from([
            ("kwh", point.value_kwh),
            ("kwh_eur", r.energy_price(tariff)),
            ("surplus_kwh", point.surplus_kwh),
            ("surplus_kwh_eur", r.surplus_price(tariff)),
            ("p1_kw", contract.power_p1.unwrap_or(0.0)),
            ("p2_kw", contract.power_p2.unwrap_or(0.0)),
            ("p1_kw_year_eur", r.p1_kw_year_eur),
            ("p2_kw_year_eur", r.p2_kw_year_eur),
            ("p1_kwh_eur", r.p1_kwh_eur),
            ("p2_kwh_eur", r.p2_kwh_eur),
            ("p3_kwh_eur", r.p3_kwh_eur),
            ("market_kw_year_eur", r.market_kw_year_eur),
            ("meter_month_eur", r.meter_month_eur),
            ("electricity_tax", r.electricity_tax),
            ("iva_tax", r.iva_tax),
            ("surplus_p1_kwh_eur", r.surplus_p1_kwh_eur),
            ("surplus_p2_kwh_eur", r.surplus_p2_kwh_eur),
            ("surplus_p3_kwh_eur", r.surplus_p3_kwh_eur),
        ])
    }

    /// Cost of every consumption hour covered by a contract
    pub fn hourly_costs(
        &self,
        consumptions: &[ConsumptionPoint],
        contracts: &[Contract],
    ) -> Result<Vec<CostPoint>, FormulaError> {
        let mut costs = Vec::with_capacity(consumptions.len());
        for point in consumptions {
            let Some(contract) = contracts.iter().find(|c| c.covers(point.datetime)) else {
                continue;
            };
            let vars = self.variables(point, contract);
            let power_term = self.power.evaluate(&vars)?;
            let energy_term = self.energy.evaluate(&vars)?;
            let others_term = self.others.evaluate(&vars)?;
            let surplus_term = self.surplus.evaluate(&vars)?;
            costs.push(CostPoint {
                datetime: point.datetime,
                power_term,
                energy_term,
                others_term,
                surplus_term,
                value_eur: power_term + energy_term + others_term - surplus_term,
            });
        }
        Ok(costs)
    }
}

/// Sums hourly costs per calendar month
pub fn monthly_costs(costs: &[CostPoint]) -> Vec<MonthlyCost> {
    let mut months: BTreeMap<NaiveDateTime, MonthlyCost> = BTreeMap::new();
    for cost in costs {
        let key = midnight(month_start(cost.datetime.date()));
        let month = months.entry(key).or_insert_with(|| MonthlyCost {
            datetime: key,
            ..Default::default()
        });
        month.value_eur += cost.value_eur;
        month.energy_term += cost.energy_term;
        month.power_term += cost.power_term;
        month.others_term += cost.others_term;
        month.surplus_term += cost.surplus_term;
    }
    months.into_values().collect()
}

/// Previous complete month, or the only month available
pub fn simulate_last_month(costs: &[CostPoint]) -> Option<MonthlyCost> {
    let mut months = monthly_costs(costs);
    match months.len() {
        0 => None,
        1 => months.pop(),
        n => Some(months.swap_remove(n - 2)),
    }
}
