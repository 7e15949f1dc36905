use axum::{
    extract::Query,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Form, Router,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_test::assert_ok;

// Global mutex to serialize tests and prevent environment variable conflicts
static TEST_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

// Import the application modules
use edata_statistics::{
    config::Config,
    coordinator::MeterCoordinator,
    dashboard,
    datadis::DatadisConnector,
    helper::EdataHelper,
    meter::{MeterHandle, MeterRegistry, MeterStatus},
    provider::DataProvider,
    setup::{validate_meter, MeterInput},
    statistics::Reconciler,
    storage::DatasetStorage,
    store::MemoryStatsStore,
    streams::StreamSet,
};

const CUPS: &str = "ES0031405512345678EV";

fn at(m: u32, d: u32, h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, m, d)
        .unwrap()
        .and_hms_opt(h, 0, 0)
        .unwrap()
}

/// Mock Datadis private API serving two days of March 2024
struct MockDatadisServer {
    consumption_requests: AtomicU32,
}

impl MockDatadisServer {
    fn new() -> Self {
        Self {
            consumption_requests: AtomicU32::new(0),
        }
    }

    fn get_consumption_requests(&self) -> u32 {
        self.consumption_requests.load(Ordering::Relaxed)
    }

    fn create_router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                "/nikola-auth/tokens/login",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    match (form.get("username"), form.get("password")) {
                        (Some(u), Some(p)) if u == "user" && p == "secret" => {
                            Ok("test-token".to_string())
                        }
                        _ => Err(StatusCode::UNAUTHORIZED),
                    }
                }),
            )
            .route(
                "/api-private/api/get-supplies",
                get(|| async {
                    Json(json!([{
                        "cups": CUPS,
                        "validDateFrom": "2024/01/01",
                        "validDateTo": "",
                        "pointType": 5,
                        "distributorCode": "2"
                    }]))
                }),
            )
            .route(
                "/api-private/api/get-contract-detail",
                get(|| async {
                    Json(json!([{
                        "startDate": "2024/01/01",
                        "endDate": "",
                        "marketer": "ACME",
                        "distributorCode": "2",
                        "contractedPowerkW": [4.6, 3.45]
                    }]))
                }),
            )
            .route(
                "/api-private/api/get-consumption-data",
                get({
                    let server = self.clone();
                    move |Query(query): Query<HashMap<String, String>>| async move {
                        server.consumption_requests.fetch_add(1, Ordering::Relaxed);
                        if query.get("startDate").map(String::as_str) != Some("2024/03") {
                            return Json(json!([]));
                        }
                        let mut rows = Vec::new();
                        for day in ["2024/03/11", "2024/03/12"] {
                            for hour in 1..=24 {
                                rows.push(json!({
                                    "date": day,
                                    "time": format!("{:02}:00", hour),
                                    "consumptionKWh": 0.5,
                                    "obtainMethod": "Real"
                                }));
                            }
                        }
                        Json(Value::Array(rows))
                    }
                }),
            )
            .route(
                "/api-private/api/get-max-power",
                get(|| async {
                    Json(json!([
                        {"date": "2024/03/11", "time": "10:15", "maxPower": 3.2},
                        {"date": "2024/03/12", "time": "23:30", "maxPower": 2.1}
                    ]))
                }),
            )
    }
}

/// Start mock Datadis HTTP server
async fn start_mock_datadis_server() -> (Arc<MockDatadisServer>, SocketAddr, oneshot::Sender<()>) {
    let mock_server = Arc::new(MockDatadisServer::new());
    let app = mock_server.clone().create_router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        let server = axum::serve(listener, app);
        tokio::select! {
            _ = server => {},
            _ = shutdown_rx => {
                println!("Mock Datadis server shutting down");
            }
        }
    });

    (mock_server, addr, shutdown_tx)
}

fn meter_coordinator(
    addr: SocketAddr,
    store: Arc<MemoryStatsStore>,
    storage_dir: &std::path::Path,
) -> MeterCoordinator {
    let provider: Arc<dyn DataProvider> = Arc::new(DatadisConnector::with_endpoint(
        &format!("http://{}", addr),
        "user",
        "secret",
    ));
    let storage = DatasetStorage::new(storage_dir, CUPS, "78EV");
    MeterCoordinator::new(
        EdataHelper::new(provider, CUPS, None, None, None),
        Reconciler::new(store, StreamSet::new("78EV", false, false)),
        MeterHandle::new(CUPS, "78EV"),
        storage,
    )
}

#[tokio::test]
async fn test_full_cycle_against_mock_datadis() {
    let (mock, addr, shutdown) = start_mock_datadis_server().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStatsStore::new());

    let mut coordinator = meter_coordinator(addr, store.clone(), dir.path());
    let registry = MeterRegistry::new();
    registry.register(coordinator.handle());

    assert_ok!(coordinator.cycle(at(3, 20, 12)).await);
    assert!(mock.get_consumption_requests() > 0);

    let view = registry.get("78ev").unwrap();
    assert_eq!(view.status(), MeterStatus::Ready);
    let attributes = view.attributes();
    assert_eq!(attributes.cups.as_deref(), Some(CUPS));
    assert_eq!(attributes.contract_p1_kw, Some(4.6));
    assert_eq!(attributes.month_kwh, Some(24.0));
    assert_eq!(attributes.month_days, Some(2));
    assert_eq!(attributes.yesterday_kwh, None);
    assert_eq!(attributes.max_power_kw, Some(3.2));
    assert_eq!(attributes.last_registered_date, Some(at(3, 13, 0)));

    // Every weekday splits evenly across the three periods
    for (id, expected) in [
        ("edata:78ev_consumption", 24.0),
        ("edata:78ev_p1_consumption", 8.0),
        ("edata:78ev_p2_consumption", 8.0),
        ("edata:78ev_p3_consumption", 8.0),
    ] {
        let records = store.records(id);
        assert_eq!(records.last().and_then(|r| r.sum), Some(expected), "{}", id);
    }

    let response = dashboard::handle(
        &registry,
        json!({"id": 1, "type": "edata/consumptions/daily", "scups": "78EV"}),
    );
    let days = response["result"].as_array().unwrap();
    assert_eq!(days.len(), 2);
    assert_eq!(days[0]["value_kWh"], 12.0);
    assert_eq!(days[0]["value_p1_kWh"], 4.0);

    let response = dashboard::handle(
        &registry,
        json!({"id": 2, "type": "edata/maximeter", "scups": "78EV", "tariff": 2}),
    );
    assert_eq!(response["result"].as_array().unwrap().len(), 1);

    // Replaying the same window writes nothing new
    assert_ok!(coordinator.cycle(at(3, 20, 13)).await);
    assert_eq!(store.records("edata:78ev_consumption").len(), 48);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_restart_reuses_persisted_dataset() {
    let (_mock, addr, shutdown) = start_mock_datadis_server().await;
    let dir = tempfile::tempdir().unwrap();

    let mut first = meter_coordinator(addr, Arc::new(MemoryStatsStore::new()), dir.path());
    assert_ok!(first.cycle(at(3, 20, 12)).await);
    let _ = shutdown.send(());

    // Provider is gone; statistics are regenerated from the stored dataset
    let storage = DatasetStorage::new(dir.path(), CUPS, "78EV");
    let stored = storage.load().await.unwrap();
    assert_eq!(stored.consumptions.len(), 48);

    let store = Arc::new(MemoryStatsStore::new());
    let provider: Arc<dyn DataProvider> = Arc::new(DatadisConnector::with_endpoint(
        &format!("http://{}", addr),
        "user",
        "secret",
    ));
    let mut second = MeterCoordinator::new(
        EdataHelper::new(provider, CUPS, None, None, Some(stored)),
        Reconciler::new(store.clone(), StreamSet::new("78EV", false, false)),
        MeterHandle::new(CUPS, "78EV"),
        storage,
    );
    assert_ok!(second.cycle(at(3, 20, 12)).await);
    assert_eq!(store.records("edata:78ev_consumption").len(), 48);
    assert_eq!(second.handle().status(), MeterStatus::Ready);
}

#[tokio::test]
async fn test_setup_against_mock_datadis() {
    let (_mock, addr, shutdown) = start_mock_datadis_server().await;
    let registry = MeterRegistry::new();
    let url = format!("http://{}", addr);

    let input = MeterInput {
        username: "user".to_string(),
        password: "secret".to_string(),
        cups: CUPS.to_string(),
        authorized_nif: None,
        pricing: None,
    };
    let provider = DatadisConnector::with_endpoint(&url, "user", "secret");
    let meter = assert_ok!(validate_meter(&input, &registry, &provider).await);
    assert_eq!(meter.scups, "78EV");

    let provider = DatadisConnector::with_endpoint(&url, "user", "wrong");
    let err = validate_meter(&input, &registry, &provider).await.unwrap_err();
    assert_eq!(err.form_key(), "invalid_credentials");

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_config_from_file_and_environment() {
    let _guard = TEST_MUTEX.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edata.toml");
    std::fs::write(
        &path,
        r#"
        months_back = 6
        datadis_url = "http://127.0.0.1:9"

        [[meters]]
        username = "user"
        password = "secret"
        cups = "ES0031405512345678EV"
        "#,
    )
    .unwrap();

    std::env::set_var("EDATA_CONFIG", &path);
    std::env::set_var("HA_URL", "http://homeassistant.local:8123/");
    std::env::set_var("HA_TOKEN", "token");
    std::env::set_var("EDATA_RECREATE", "true");

    let config = assert_ok!(Config::load());
    assert_eq!(config.months_back, 6);
    assert_eq!(config.meters.len(), 1);
    assert_eq!(config.home_assistant.url, "http://homeassistant.local:8123");
    assert!(config.recreate_statistics);
    assert_eq!(config.update_interval().as_secs(), 3600);

    std::env::set_var("EDATA_CONFIG", dir.path().join("missing.toml"));
    assert!(Config::load().is_err());

    for key in ["EDATA_CONFIG", "HA_URL", "HA_TOKEN", "EDATA_RECREATE"] {
        std::env::remove_var(key);
    }
}
