// Pedal Firmware - Shared Settings
//
// The Settings record is written by the BLE session (dedicated context) and
// read by the hit detector (cooperative context). Readers take a copy per
// cycle; writers swap the whole record. Persistence goes through one
// mutex-guarded store so a write is never interleaved with another.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;

use crate::config::*;
use crate::error::SettingsError;
use crate::hal::KeyValueStore;
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub mode: char,
    pub sample_rate: u32,
    pub ramp_up: i32,
    pub ramp_hit: i32,
    pub ramp_down: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE as char,
            sample_rate: DEFAULT_SAMPLE_RATE,
            ramp_up: DEFAULT_RAMP_UP,
            ramp_hit: DEFAULT_RAMP_HIT,
            ramp_down: DEFAULT_RAMP_DOWN,
        }
    }
}

impl Settings {
    pub const RECORD_SIZE: usize = 28;

    /// Hysteresis (hit) mode; anything else streams raw samples.
    pub fn is_hit_mode(&self) -> bool {
        self.mode == 'H'
    }

    /// Pause between sampling cycles, never below 1 ms.
    pub fn sample_interval_ms(&self) -> u32 {
        (1000 / self.sample_rate.max(1)).max(1)
    }

    // Layout (little-endian):
    //   0 size:u32   4 key:i32   8 mode:u8   9..12 pad
    //  12 sample_rate:u32  16 ramp_up  20 ramp_hit  24 ramp_down (i32)
    pub fn to_bytes(&self) -> [u8; Self::RECORD_SIZE] {
        let mut out = [0u8; Self::RECORD_SIZE];
        out[0..4].copy_from_slice(&(Self::RECORD_SIZE as u32).to_le_bytes());
        out[4..8].copy_from_slice(&SETTINGS_KEY.to_le_bytes());
        // Callers that persist go through `mode_byte` first.
        out[8] = self.mode_byte().unwrap_or(u8::MAX);
        out[12..16].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[16..20].copy_from_slice(&self.ramp_up.to_le_bytes());
        out[20..24].copy_from_slice(&self.ramp_hit.to_le_bytes());
        out[24..28].copy_from_slice(&self.ramp_down.to_le_bytes());
        out
    }

    /// The mode as its single wire byte. Only chars up to U+00FF fit.
    pub fn mode_byte(&self) -> Result<u8, SettingsError> {
        u8::try_from(u32::from(self.mode)).map_err(|_| SettingsError::Mode(self.mode))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SettingsError> {
        if bytes.len() != Self::RECORD_SIZE {
            return Err(SettingsError::Length {
                expected: Self::RECORD_SIZE,
                actual: bytes.len(),
            });
        }

        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let i32_at = |at: usize| u32_at(at) as i32;

        let size = u32_at(0);
        if size as usize != Self::RECORD_SIZE {
            return Err(SettingsError::SizeField(size));
        }
        let key = i32_at(4);
        if key != SETTINGS_KEY {
            return Err(SettingsError::Key(key));
        }

        let settings = Self {
            mode: bytes[8] as char,
            sample_rate: u32_at(12),
            ramp_up: i32_at(16),
            ramp_hit: i32_at(20),
            ramp_down: i32_at(24),
        };
        if settings.sample_rate == 0 {
            return Err(SettingsError::SampleRate);
        }
        Ok(settings)
    }
}

/// Read side of the shared record. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<Settings>>);

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    /// Consistent copy of the whole record.
    pub fn snapshot(&self) -> Settings {
        match self.0.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn replace(&self, settings: Settings) {
        match self.0.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }
}

/// Owns the persisted copy and the only write path to [`SharedSettings`].
pub struct SettingsStore {
    shared: SharedSettings,
    storage: Mutex<Box<dyn KeyValueStore>>,
}

impl SettingsStore {
    /// Load the persisted record. A missing or corrupt record is replaced
    /// by the defaults, which are written back straight away.
    pub fn load(mut storage: Box<dyn KeyValueStore>) -> Arc<Self> {
        let mut buf = [0u8; 64];
        let loaded = match storage.load(NVS_SETTINGS_KEY, &mut buf) {
            Ok(Some(len)) => Settings::from_bytes(&buf[..len.min(buf.len())]).map_err(anyhow::Error::from),
            Ok(None) => Err(anyhow::anyhow!("no settings stored")),
            Err(e) => Err(e),
        };

        let settings = match loaded {
            Ok(settings) => {
                log::info!("Settings loaded: {:?}", settings);
                settings
            }
            Err(e) => {
                let defaults = Settings::default();
                log::warn!("Settings unusable ({}), restoring defaults", e);
                if let Err(e) = storage.save(NVS_SETTINGS_KEY, &defaults.to_bytes()) {
                    log::error!("Persisting default settings failed: {:#}", e);
                }
                defaults
            }
        };

        Arc::new(Self {
            shared: SharedSettings::new(settings),
            storage: Mutex::new(storage),
        })
    }

    pub fn shared(&self) -> SharedSettings {
        self.shared.clone()
    }

    pub fn snapshot(&self) -> Settings {
        self.shared.snapshot()
    }

    /// Validate an inbound record, publish it and persist it.
    ///
    /// The storage lock is held for the whole call and released on every
    /// exit path, including a rejected record.
    pub fn apply_record(&self, bytes: &[u8]) -> anyhow::Result<Settings> {
        let mut storage = lock(&self.storage);
        let settings = Settings::from_bytes(bytes)?;
        self.shared.replace(settings);
        storage
            .save(NVS_SETTINGS_KEY, &settings.to_bytes())
            .context("persisting settings")?;
        Ok(settings)
    }

    /// Publish and persist a locally built record. A mode that does not
    /// fit the record is rejected before anything changes.
    pub fn commit(&self, settings: Settings) -> anyhow::Result<()> {
        settings.mode_byte()?;
        self.apply_record(&settings.to_bytes()).map(|_| ())
    }
}
