use anyhow::Context;
use ble_session::domain::models::{AdapterState, PeripheralId};
use ble_session::domain::settings::{SettingsService, SimulationSettings};
use ble_session::infrastructure::bluetooth::{
    SessionHandle, SimulatedBackend, SimulatedPeripheral,
};
use ble_session::infrastructure::logging;
use ble_session::presentation::console::ConsoleHost;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{debug, info, warn};

/// Power the simulated radio on after the configured delay.
fn spawn_power_on(backend: Arc<SimulatedBackend>, simulation: &SimulationSettings) {
    let delay = Duration::from_millis(simulation.power_on_delay_ms);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        info!("Simulated adapter powered on");
        backend.set_adapter_state(AdapterState::PoweredOn);
    });
}

/// Push a counter notification while the characteristic is subscribed.
fn spawn_notifier(
    backend: Arc<SimulatedBackend>,
    peripheral: PeripheralId,
    simulation: &SimulationSettings,
) {
    if simulation.notify_interval_ms == 0 {
        return;
    }
    let period = Duration::from_millis(simulation.notify_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let mut count: u64 = 0;
        loop {
            ticker.tick().await;
            count += 1;
            if !backend.notify(&peripheral, format!("tick {}", count)) {
                debug!("Notification {} not delivered, no subscriber", count);
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting BLE session demo");
    if let Err(e) = settings_service.save() {
        warn!("Failed to save settings: {}", e);
    }

    let config = settings
        .session
        .to_config()
        .context("Invalid session settings")?;

    let backend = Arc::new(SimulatedBackend::new(AdapterState::Unknown));
    let peripheral = backend.add_peripheral(
        SimulatedPeripheral::with_gatt(
            settings.simulation.peripheral_name.clone(),
            config.service_uuid,
            config.characteristic_uuid,
        )
        .with_value(settings.simulation.initial_value.clone())
        .auto_advertise(true),
    );
    spawn_power_on(backend.clone(), &settings.simulation);
    spawn_notifier(backend.clone(), peripheral, &settings.simulation);

    let (session, events) = SessionHandle::spawn(backend, config);
    ConsoleHost::new(session)
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), events)
        .await?;

    info!("BLE session demo stopped");
    Ok(())
}
