use shunt_aggregator::bank_config::load_bank_config;
use shunt_aggregator::change_watcher::ChangeWatcher;
use shunt_aggregator::persistence::SettingsStore;
use shunt_aggregator::register_server::{self, RegisterServer};
use shunt_aggregator::{HttpGateway, ModbusConfigReader, PublishedStore, Settings, UpdateOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EVENT_QUEUE: usize = 64;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting SmartShunt aggregator {}", env!("CARGO_PKG_VERSION"));
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            exit_after(Settings::default().time_before_restart).await;
        }
    };

    let restart_delay = settings.time_before_restart;
    match run(settings).await {
        Ok(()) => info!("Event channel closed, exiting"),
        Err(e) => {
            error!("{e:#}");
            exit_after(restart_delay).await;
        }
    }
}

/// Gives the log a chance to be read before the supervisor restarts the service.
async fn exit_after(delay: Duration) -> ! {
    info!("Exiting in {delay:?}");
    sleep(delay).await;
    std::process::exit(1);
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let bus = Arc::new(HttpGateway::new(&settings.bus_url, &settings.bus_token));
    let reader = ModbusConfigReader::new(settings.config_modbus);

    let bank = load_bank_config(bus.as_ref(), &reader, &settings).await?;
    let persisted = SettingsStore::load(&settings.settings_path);
    let store = PublishedStore::new();
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

    let listener = TcpListener::bind(settings.listen_address).await?;
    let server = RegisterServer::new(store.clone(), events_tx.clone());
    tokio::spawn(async move {
        if let Err(e) = register_server::serve(listener, server).await {
            error!("Register server stopped: {e:#}");
        }
    });

    let watch_interval = settings.watch_interval;
    let orchestrator = UpdateOrchestrator::new(bus.clone(), settings, bank, persisted, store, events_tx.clone());
    ChangeWatcher::new(bus, orchestrator.watch_targets(), events_tx, watch_interval).spawn();

    orchestrator.run(events_rx).await?;
    Ok(())
}
