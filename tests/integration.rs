// Full task set on host doubles: scheduler + hit detector + power monitor
// cooperative, session on its own thread.

use std::sync::Arc;

use pedal::config::{FirmwareConfig, NVS_SETTINGS_KEY};
use pedal::events::SensorValue;
use pedal::hal::Clock;
use pedal::platform::mock::{MemoryStore, MockClock, MockTransport, RecordingPin, ScriptedAdc, PeerSide};
use pedal::scheduler::{Scheduler, ThreadSpawner};
use pedal::settings::{Settings, SettingsStore};
use pedal::task::{disable_matching, Task};
use pedal::tasks::hit_detector::HitDetector;
use pedal::tasks::power::{BatteryState, PowerMonitor};
use pedal::tasks::session::{Session, SessionState, SessionTask};
use pedal::transport::ExchangePoint;

struct Firmware {
    clock: Arc<MockClock>,
    scheduler: Scheduler,
    peers: PeerSide,
    session: Arc<Session<MockTransport>>,
    settings: Arc<SettingsStore>,
}

fn boot(store: MemoryStore, pedal: Vec<u16>, battery_raw: u16) -> Firmware {
    boot_with(store, pedal, battery_raw, &[])
}

fn boot_with(store: MemoryStore, pedal: Vec<u16>, battery_raw: u16, disabled: &'static [&'static str]) -> Firmware {
    let clock = Arc::new(MockClock::new());
    let config = FirmwareConfig {
        samples_per_reading: 1,
        session_poll_ms: 5,
        disabled_tasks: disabled,
        ..FirmwareConfig::default()
    };

    let settings = SettingsStore::load(Box::new(store));
    let battery = Arc::new(BatteryState::default());
    let (transport, peers) = MockTransport::new();
    let session = Session::new(transport, settings.clone(), battery.clone(), clock.clone(), config);

    let detector = HitDetector::new(
        ScriptedAdc::new(pedal),
        RecordingPin::new(),
        settings.shared(),
        session.clone(),
        clock.clone(),
        config,
    );
    session.wake_on_connect(detector.core().handle());

    let tasks: Vec<Box<dyn Task>> = vec![
        Box::new(detector),
        Box::new(SessionTask::new(session.clone(), clock.clone())),
        Box::new(PowerMonitor::new(
            ScriptedAdc::new([battery_raw]),
            battery,
            clock.clone(),
            config,
        )),
    ];
    disable_matching(&tasks, |name| config.is_task_disabled(name));

    let mut scheduler = Scheduler::new(clock.clone());
    scheduler.start(tasks, &ThreadSpawner).unwrap();

    Firmware {
        clock,
        scheduler,
        peers,
        session,
        settings,
    }
}

impl Firmware {
    fn passes(&mut self, count: usize) {
        for _ in 0..count {
            let next = self.scheduler.run_pass();
            self.scheduler.sleep_until(next);
        }
    }

    fn values(&self) -> Vec<Vec<u8>> {
        self.peers
            .notifications()
            .into_iter()
            .filter(|(point, _)| *point == ExchangePoint::Value)
            .map(|(_, data)| data)
            .collect()
    }
}

#[test]
fn boots_into_advertising_with_two_cooperative_tasks() {
    let fw = boot(MemoryStore::new(), vec![0], 3000);
    assert_eq!(fw.scheduler.cooperative_count(), 2);
    assert_eq!(fw.session.state(), SessionState::Advertising);
    assert_eq!(fw.settings.snapshot(), Settings::default());
}

#[test]
fn hit_reaches_connected_peer() {
    let mut fw = boot(MemoryStore::new(), vec![0, 900, 1300, 100], 3000);

    // No peer yet: the detector naps, the power monitor samples.
    let next = fw.scheduler.run_pass();
    assert_eq!(next, 500);
    assert!(fw.values().is_empty());

    // Connecting cuts the nap short: the loop does not sleep to 500.
    fw.peers.connect_peer();
    fw.scheduler.sleep_until(next);
    assert_eq!(fw.clock.now_ms(), 0);
    fw.passes(4);

    let expected = SensorValue {
        timestamp: 20,
        value: 1,
        delta_time: 10,
    };
    assert_eq!(fw.values(), vec![expected.to_bytes().to_vec()]);
    assert_eq!(fw.peers.read(ExchangePoint::Value), expected.to_bytes().to_vec());
    assert_eq!(fw.clock.now_ms(), 40);
}

#[test]
fn configuration_write_switches_to_streaming() {
    let store = MemoryStore::new();
    let mut fw = boot(store.clone(), vec![5, 6, 7], 3000);
    fw.peers.connect_peer();

    let streaming = Settings {
        mode: 'R',
        sample_rate: 50,
        ..Settings::default()
    };
    fw.peers.write(ExchangePoint::Configuration, &streaming.to_bytes());
    fw.passes(3);

    let values: Vec<i32> = fw
        .values()
        .iter()
        .map(|bytes| i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]))
        .collect();
    assert_eq!(values, vec![5, 6, 7]);
    assert_eq!(fw.clock.now_ms(), 60);

    assert_eq!(store.get(NVS_SETTINGS_KEY), Some(streaming.to_bytes().to_vec()));
    let reloaded = SettingsStore::load(Box::new(store));
    assert_eq!(reloaded.snapshot(), streaming);
}

#[test]
fn power_point_reports_battery() {
    let mut fw = boot(MemoryStore::new(), vec![0], 4095);
    fw.passes(1);

    let record = fw.peers.read(ExchangePoint::Power);
    assert_eq!(record.len(), 5);
    assert_eq!(&record[0..4], &4095u32.to_le_bytes());
    assert_eq!(record[4], 100);
}

#[test]
fn disabled_task_is_left_out_of_the_boot() {
    let mut fw = boot_with(MemoryStore::new(), vec![0], 4095, &["power"]);
    assert_eq!(fw.scheduler.cooperative_count(), 1);
    fw.passes(2);

    let record = fw.peers.read(ExchangePoint::Power);
    assert_eq!(record, vec![0, 0, 0, 0, 0]);
}

#[test]
fn corrupt_persisted_settings_are_replaced_on_boot() {
    let store = MemoryStore::new();
    let mut bytes = Settings::default().to_bytes();
    bytes[4..8].copy_from_slice(&0x1234_5678i32.to_le_bytes());
    bytes[12..16].copy_from_slice(&7u32.to_le_bytes());
    store.insert(NVS_SETTINGS_KEY, &bytes);

    let fw = boot(store.clone(), vec![0], 3000);

    assert_eq!(fw.settings.snapshot(), Settings::default());
    assert_eq!(store.get(NVS_SETTINGS_KEY), Some(Settings::default().to_bytes().to_vec()));
    assert_eq!(
        fw.peers.read(ExchangePoint::Configuration),
        Settings::default().to_bytes().to_vec()
    );
}
