// Pedal Firmware - Entry Point
//
// Boot sequence:
//   1. Load (or restore) the persisted Settings from NVS.
//   2. Bring up ADC1 (pedal + battery channels), the status LED and BLE.
//   3. Build the task set: hit detector (cooperative), BLE session
//      (dedicated, core 0), power monitor (cooperative).
//   4. Hand everything to the scheduler, which never returns.

#[cfg(all(target_os = "espidf", feature = "experimental"))]
fn main() -> anyhow::Result<()> {
    use std::sync::Arc;

    use esp_idf_hal::gpio::OutputPin as _;
    use esp_idf_hal::prelude::Peripherals;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    use pedal::config::{FirmwareConfig, ADC_CHANNEL_BATTERY, ADC_CHANNEL_PEDAL};
    use pedal::hal::Clock;
    use pedal::platform::esp::{AdcUnit, EspClock, GattTransport, LedPin, NvsStore, PinnedSpawner};
    use pedal::scheduler::Scheduler;
    use pedal::settings::SettingsStore;
    use pedal::task::{disable_matching, Task};
    use pedal::tasks::hit_detector::HitDetector;
    use pedal::tasks::power::{BatteryState, PowerMonitor};
    use pedal::tasks::session::{Session, SessionTask};

    // Link esp-idf-sys runtime patches and initialise logging.
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    log::info!("Pedal firmware starting");

    let peripherals = Peripherals::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let clock: Arc<dyn Clock> = Arc::new(EspClock);
    let config = FirmwareConfig::default();

    // ---- Shared state -----------------------------------------------------
    let settings = SettingsStore::load(Box::new(NvsStore::new(nvs.clone())?));
    let battery = Arc::new(BatteryState::default());

    // ---- Hardware ---------------------------------------------------------
    let adc = Arc::new(AdcUnit::new()?);
    let pedal_adc = adc.channel(ADC_CHANNEL_PEDAL)?;
    let battery_adc = adc.channel(ADC_CHANNEL_BATTERY)?;
    let led = LedPin::new(peripherals.pins.gpio2.downgrade_output())?;
    let transport = GattTransport::new(peripherals.modem, nvs);

    // ---- Tasks ------------------------------------------------------------
    let session = Session::new(transport, settings.clone(), battery.clone(), clock.clone(), config);
    let detector = HitDetector::new(pedal_adc, led, settings.shared(), session.clone(), clock.clone(), config);
    session.wake_on_connect(detector.core().handle());

    let tasks: Vec<Box<dyn Task>> = vec![
        Box::new(detector),
        Box::new(SessionTask::new(session, clock.clone())),
        Box::new(PowerMonitor::new(battery_adc, battery, clock.clone(), config)),
    ];
    disable_matching(&tasks, |name| config.is_task_disabled(name));

    let mut scheduler = Scheduler::new(clock);
    scheduler.start(tasks, &PinnedSpawner)?;
    scheduler.run()
}

#[cfg(not(all(target_os = "espidf", feature = "experimental")))]
fn main() {
    eprintln!("pedal-firmware runs on ESP-IDF with the `experimental` feature; use `cargo test` on the host");
}
