use crate::billing::{simulate_last_month, BillingProcessor, MonthlyCost, PricingRules};
use crate::cups::{check_cups_integrity, short_code};
use crate::error::{ProviderError, SetupError};
use crate::helper::Dataset;
use crate::meter::MeterRegistry;
use crate::provider::DataProvider;
use tracing::{debug, info};

/// Values entered for a new meter
#[derive(Debug, Clone)]
pub struct MeterInput {
    pub username: String,
    pub password: String,
    pub cups: String,
    pub authorized_nif: Option<String>,
    pub pricing: Option<PricingRules>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMeter {
    pub title: String,
    pub scups: String,
}

/// Checks that need no provider round trip: CUPS, duplicates and pricing rules
pub fn validate_offline(
    input: &MeterInput,
    registry: &MeterRegistry,
) -> Result<ValidatedMeter, SetupError> {
    if !check_cups_integrity(&input.cups) {
        return Err(SetupError::InvalidCups);
    }
    if registry.is_configured(&input.cups) {
        return Err(SetupError::AlreadyConfigured);
    }
    if let Some(rules) = &input.pricing {
        BillingProcessor::new(rules.clone())?;
    }
    let scups = short_code(&input.cups, |code| registry.contains(code));
    Ok(ValidatedMeter {
        title: scups.clone(),
        scups,
    })
}

/// Checks a new meter before it is accepted, logging in to the provider
pub async fn validate_meter(
    input: &MeterInput,
    registry: &MeterRegistry,
    provider: &dyn DataProvider,
) -> Result<ValidatedMeter, SetupError> {
    let meter = validate_offline(input, registry)?;
    debug!("Validating {} as {}", input.cups, meter.scups);

    match provider.login().await {
        Ok(true) => {}
        Ok(false) | Err(ProviderError::InvalidCredentials) => {
            return Err(SetupError::InvalidCredentials)
        }
        Err(e) => return Err(SetupError::Provider(e)),
    }

    info!("Meter {} accepted as {}", input.cups, meter.scups);
    Ok(meter)
}

/// Previews `rules` over already fetched data
pub fn preview_billing(
    rules: &PricingRules,
    dataset: &Dataset,
) -> Result<Option<MonthlyCost>, SetupError> {
    let billing = BillingProcessor::new(rules.clone())?;
    let costs = billing.hourly_costs(&dataset.consumptions, &dataset.contracts)?;
    Ok(simulate_last_month(&costs))
}
