//! Stream identities for one meter and the metadata handed to the statistics store.

use crate::tariff::Tariff;
use serde_derive::{Deserialize, Serialize};

pub const DOMAIN: &str = "edata";

pub const UNIT_KWH: &str = "kWh";
pub const UNIT_KW: &str = "kW";
pub const UNIT_EUR: &str = "€";

/// Every series the reconciliation can write for a meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Consumption(Option<Tariff>),
    Surplus(Option<Tariff>),
    Maximeter(Option<Tariff>),
    Cost(Option<Tariff>),
    EnergyCost(Option<Tariff>),
    PowerCost,
}

impl StreamKind {
    /// Suffix appended to `edata:{scups}_`
    pub fn suffix(self) -> String {
        let (tariff, base) = match self {
            StreamKind::Consumption(t) => (t, "consumption"),
            StreamKind::Surplus(t) => (t, "surplus"),
            StreamKind::Maximeter(t) => (t, "maximeter"),
            StreamKind::Cost(t) => (t, "cost"),
            StreamKind::EnergyCost(t) => (t, "energy_cost"),
            StreamKind::PowerCost => (None, "power_cost"),
        };
        match tariff {
            Some(t) => format!("{}_{}", t.label(), base),
            None => base.to_string(),
        }
    }

    /// Short alias used as stream title, e.g. `p1_kWh`
    pub fn alias(self) -> String {
        let (tariff, unit) = match self {
            StreamKind::Consumption(t) => (t, "kWh".to_string()),
            StreamKind::Surplus(t) => (t, "surp_kWh".to_string()),
            StreamKind::Maximeter(t) => (t, "kW".to_string()),
            StreamKind::Cost(t) => (t, "eur".to_string()),
            StreamKind::EnergyCost(t) => (t, "energy_eur".to_string()),
            StreamKind::PowerCost => (None, "power_eur".to_string()),
        };
        match tariff {
            Some(t) => format!("{}_{}", t.label(), unit),
            None => unit,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            StreamKind::Consumption(_) | StreamKind::Surplus(_) => UNIT_KWH,
            StreamKind::Maximeter(_) => UNIT_KW,
            StreamKind::Cost(_) | StreamKind::EnergyCost(_) | StreamKind::PowerCost => UNIT_EUR,
        }
    }

    /// Cumulative streams carry a running sum, maximeter streams carry mean/max
    pub fn is_cumulative(self) -> bool {
        !matches!(self, StreamKind::Maximeter(_))
    }
}

/// Metadata describing a stream to the statistics backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub statistic_id: String,
    pub name: String,
    pub source: String,
    pub unit_of_measurement: String,
    pub has_sum: bool,
    pub has_mean: bool,
}

/// Active streams of one meter
#[derive(Debug, Clone)]
pub struct StreamSet {
    scups: String,
    billing: bool,
    surplus: bool,
}

fn with_tariffs(make: fn(Option<Tariff>) -> StreamKind, tariffs: &[Tariff]) -> Vec<StreamKind> {
    std::iter::once(make(None))
        .chain(tariffs.iter().map(|t| make(Some(*t))))
        .collect()
}

impl StreamSet {
    pub fn new(scups: &str, billing: bool, surplus: bool) -> Self {
        Self {
            scups: scups.to_ascii_lowercase(),
            billing,
            surplus,
        }
    }

    pub fn scups(&self) -> &str {
        &self.scups
    }

    pub fn billing(&self) -> bool {
        self.billing
    }

    pub fn surplus(&self) -> bool {
        self.surplus
    }

    /// Prefix shared by every stream id of this meter
    pub fn prefix(&self) -> String {
        format!("{}:{}", DOMAIN, self.scups)
    }

    pub fn id(&self, kind: StreamKind) -> String {
        format!("{}_{}", self.prefix(), kind.suffix())
    }

    pub fn consumption(&self) -> Vec<StreamKind> {
        with_tariffs(StreamKind::Consumption, &Tariff::ALL)
    }

    pub fn surplus_streams(&self) -> Vec<StreamKind> {
        if self.surplus {
            with_tariffs(StreamKind::Surplus, &Tariff::ALL)
        } else {
            Vec::new()
        }
    }

    pub fn maximeter(&self) -> Vec<StreamKind> {
        with_tariffs(StreamKind::Maximeter, &[Tariff::P1, Tariff::P2])
    }

    pub fn cost(&self) -> Vec<StreamKind> {
        if !self.billing {
            return Vec::new();
        }
        let mut kinds = with_tariffs(StreamKind::Cost, &Tariff::ALL);
        kinds.extend(with_tariffs(StreamKind::EnergyCost, &Tariff::ALL));
        kinds.push(StreamKind::PowerCost);
        kinds
    }

    /// All active streams
    pub fn all(&self) -> Vec<StreamKind> {
        let mut kinds = self.consumption();
        kinds.extend(self.surplus_streams());
        kinds.extend(self.maximeter());
        kinds.extend(self.cost());
        kinds
    }

    /// Active streams with a running sum
    pub fn cumulative(&self) -> Vec<StreamKind> {
        self.all()
            .into_iter()
            .filter(|k| k.is_cumulative())
            .collect()
    }

    pub fn metadata(&self, kind: StreamKind) -> StreamMetadata {
        StreamMetadata {
            statistic_id: self.id(kind),
            name: kind.alias(),
            source: DOMAIN.to_string(),
            unit_of_measurement: kind.unit().to_string(),
            has_sum: kind.is_cumulative(),
            has_mean: !kind.is_cumulative(),
        }
    }
}
