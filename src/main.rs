use edata_statistics::billing::BillingProcessor;
use edata_statistics::config::{Config, MeterConfig};
use edata_statistics::coordinator::MeterCoordinator;
use edata_statistics::datadis::{DatadisConnector, DATADIS_URL};
use edata_statistics::helper::EdataHelper;
use edata_statistics::home_assistant::HomeAssistantAPI;
use edata_statistics::meter::{MeterHandle, MeterRegistry};
use edata_statistics::provider::DataProvider;
use edata_statistics::recorder::RecorderStatsStore;
use edata_statistics::setup::{validate_offline, MeterInput};
use edata_statistics::statistics::Reconciler;
use edata_statistics::storage::DatasetStorage;
use edata_statistics::store::{MemoryStatsStore, StatsStore};
use edata_statistics::streams::StreamSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting edata statistics bridge");

    let store: Arc<dyn StatsStore> = if config.home_assistant.is_configured() {
        Arc::new(
            RecorderStatsStore::connect(&config.home_assistant.url, &config.home_assistant.token)
                .await?,
        )
    } else {
        warn!("No Home Assistant configured, statistics are kept in memory only");
        Arc::new(MemoryStatsStore::new())
    };

    let registry = MeterRegistry::new();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    for meter in &config.meters {
        match start_meter(&config, meter, &registry, store.clone()).await {
            Ok(worker) => workers.push(worker),
            Err(e) => error!("Meter {} not started: {:#}", meter.cups, e),
        }
    }
    if workers.is_empty() {
        anyhow::bail!("No meter could be started");
    }
    info!("Tracking meters {:?}", registry.codes());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for worker in workers {
        worker.abort();
    }
    Ok(())
}

async fn start_meter(
    config: &Config,
    meter: &MeterConfig,
    registry: &MeterRegistry,
    store: Arc<dyn StatsStore>,
) -> anyhow::Result<JoinHandle<()>> {
    let endpoint = config.datadis_url.as_deref().unwrap_or(DATADIS_URL);
    let provider: Arc<dyn DataProvider> = Arc::new(DatadisConnector::with_endpoint(
        endpoint,
        &meter.username,
        &meter.password,
    ));

    let input = MeterInput {
        username: meter.username.clone(),
        password: meter.password.clone(),
        cups: meter.cups.clone(),
        authorized_nif: meter.authorized_nif.clone(),
        pricing: meter.billing.clone(),
    };
    // Credentials are checked by the first cycle
    let validated = validate_offline(&input, registry)
        .map_err(|e| anyhow::anyhow!("{} ({})", e, e.form_key()))?;
    let scups = meter.scups.clone().unwrap_or(validated.scups);

    let storage = DatasetStorage::new(&config.storage_dir, &meter.cups, &scups);
    if let Err(e) = storage.migrate_legacy().await {
        warn!("Cannot migrate legacy storage for {}: {}", scups, e);
    }
    let stored = storage.load().await;

    let billing = meter.billing.clone().map(BillingProcessor::new).transpose()?;
    let streams = StreamSet::new(&scups, billing.is_some(), meter.surplus);
    let helper = EdataHelper::new(
        provider,
        &meter.cups,
        meter.authorized_nif.clone(),
        billing,
        stored,
    );

    let handle = MeterHandle::new(&meter.cups, &scups);
    registry.register(&handle);

    let mut coordinator = MeterCoordinator::new(
        helper,
        Reconciler::new(store, streams),
        handle,
        storage,
    )
    .with_months_back(config.months_back)
    .with_update_interval(config.update_interval());
    if config.home_assistant.is_configured() {
        coordinator = coordinator.with_home_assistant(HomeAssistantAPI::new(&config.home_assistant));
    }
    if config.recreate_statistics {
        coordinator.schedule_rebuild();
    }
    Ok(coordinator.spawn())
}
