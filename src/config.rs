// Pedal Firmware - Hardware & System Configuration
// Target: ESP32 (dual core, Xtensa)

// ---------------------------------------------------------------------------
// GPIO / ADC Definitions
// ---------------------------------------------------------------------------
pub const PIN_LED: i32 = 2;                 // On-board status LED
pub const PIN_PEDAL_ADC: i32 = 34;          // ADC1_CH6, pedal force sensor
pub const PIN_BATTERY_ADC: i32 = 35;        // ADC1_CH7, battery divider (1:2)
pub const ADC_CHANNEL_PEDAL: u32 = 6;
pub const ADC_CHANNEL_BATTERY: u32 = 7;
pub const ADC_MAX_RAW: u16 = 4095;          // 12-bit

// ---------------------------------------------------------------------------
// Task Stack Sizes (bytes) & Affinity
// ---------------------------------------------------------------------------
pub const STACK_SESSION: usize = 8192;
pub const SESSION_CORE: usize = 0;          // BLE host runs next to the radio

// ---------------------------------------------------------------------------
// Timing (milliseconds)
// ---------------------------------------------------------------------------
pub const BOOT_BLINK_MS: u64 = 1000;
pub const HIT_BLINK_MS: u64 = 100;
pub const LOW_POWER_BACKOFF_MS: u32 = 500;  // Hit detector nap while no peer
pub const SESSION_POLL_MS: u32 = 8000;      // Session idle check cadence
pub const SESSION_IDLE_TIMEOUT_MS: u64 = 300_000; // 5 minutes, then drop peers
pub const SESSION_SETUP_RETRY_MS: u32 = 500;
pub const SESSION_SETUP_RETRY_MAX_MS: u32 = 30_000;
pub const BATTERY_CHECK_INTERVAL_MS: u32 = 1000;
pub const BATTERY_MIN_INTERVAL_MS: u32 = 500;
pub const STEP_BUDGET_MS: u64 = 50;         // Cooperative watchdog budget

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------
pub const SAMPLES_PER_READING: u32 = 8;
pub const SAMPLE_SPACING_US: u32 = 50;
pub const BATTERY_SMOOTHING: f32 = 0.25;

// ---------------------------------------------------------------------------
// Settings record
// ---------------------------------------------------------------------------
pub const SETTINGS_KEY: i32 = 1_397_052_500;
pub const NVS_NAMESPACE: &str = "pedal-control";
pub const NVS_SETTINGS_KEY: &str = "settings";

pub const DEFAULT_MODE: u8 = b'H';
pub const DEFAULT_SAMPLE_RATE: u32 = 100;   // Hz
pub const DEFAULT_RAMP_UP: i32 = 800;
pub const DEFAULT_RAMP_HIT: i32 = 1200;
pub const DEFAULT_RAMP_DOWN: i32 = 700;

// ---------------------------------------------------------------------------
// BLE
// ---------------------------------------------------------------------------
pub const DEVICE_NAME: &str = "Pedal";
pub const BLE_SERVICE_UUID: u128 = 0xa10bbd49_a988_4fc7_bc7f_58a672d3d653;
pub const BLE_SETTINGS_ID: u16 = 0x0001;
pub const BLE_BATTERY_ID: u16 = 0x0002;
pub const BLE_VALUE_ID: u16 = 0x0003;
pub const BLE_MAX_PEERS: usize = 1;

/// Runtime knobs handed to the tasks at construction.
///
/// `Default` mirrors the constants above; tests shrink the intervals.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareConfig {
    /// Hit detector naps for `backoff_ms` instead of sampling while no
    /// peer is connected.
    pub low_power_backoff: bool,
    pub backoff_ms: u32,
    /// Drop all peers after this long without session activity; 0 disables.
    pub idle_timeout_ms: u64,
    pub session_poll_ms: u32,
    pub samples_per_reading: u32,
    pub sample_spacing_us: u32,
    pub battery_interval_ms: u32,
    pub battery_smoothing: f32,
    pub max_peers: usize,
    /// Task names left out of the boot, e.g. `&["power"]`.
    pub disabled_tasks: &'static [&'static str],
}

impl FirmwareConfig {
    /// Battery sampling never runs faster than [`BATTERY_MIN_INTERVAL_MS`].
    pub fn battery_interval(&self) -> u32 {
        self.battery_interval_ms.max(BATTERY_MIN_INTERVAL_MS)
    }

    pub fn is_task_disabled(&self, name: &str) -> bool {
        self.disabled_tasks.contains(&name)
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            low_power_backoff: true,
            backoff_ms: LOW_POWER_BACKOFF_MS,
            idle_timeout_ms: SESSION_IDLE_TIMEOUT_MS,
            session_poll_ms: SESSION_POLL_MS,
            samples_per_reading: SAMPLES_PER_READING,
            sample_spacing_us: SAMPLE_SPACING_US,
            battery_interval_ms: BATTERY_CHECK_INTERVAL_MS,
            battery_smoothing: BATTERY_SMOOTHING,
            max_peers: BLE_MAX_PEERS,
            disabled_tasks: &[],
        }
    }
}
