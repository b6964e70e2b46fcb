// Pedal Firmware - ESP-IDF Bindings
//
// Clock, ADC, LED, NVS and the pinned dedicated-task spawner on top of
// esp-idf-hal / esp-idf-svc. The BLE transport lives in `ble`.

pub mod ble;

use std::thread;

use anyhow::{bail, Context};
use esp_idf_hal::cpu::Core;
use esp_idf_hal::delay::Ets;
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_hal::task::thread::ThreadSpawnConfiguration;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use crate::config::NVS_NAMESPACE;
use crate::hal::{AnalogInput, Clock, KeyValueStore, OutputPin, Timestamp};
use crate::scheduler::Spawner;
use crate::task::Placement;

pub use ble::GattTransport;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------
pub struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> Timestamp {
        let us = unsafe { esp_idf_sys::esp_timer_get_time() };
        (us / 1000) as Timestamp
    }

    fn delay_us(&self, us: u32) {
        Ets::delay_us(us);
    }
}

// ---------------------------------------------------------------------------
// ADC1 one-shot unit (raw ESP-IDF calls, 12 bit, 11 dB attenuation)
// ---------------------------------------------------------------------------
pub struct AdcUnit {
    handle: esp_idf_sys::adc_oneshot_unit_handle_t,
}

// The one-shot driver serialises access to the unit internally.
unsafe impl Send for AdcUnit {}
unsafe impl Sync for AdcUnit {}

impl AdcUnit {
    pub fn new() -> anyhow::Result<Self> {
        let mut handle: esp_idf_sys::adc_oneshot_unit_handle_t = core::ptr::null_mut();
        let ret = unsafe {
            let unit_cfg = esp_idf_sys::adc_oneshot_unit_init_cfg_t {
                unit_id: esp_idf_sys::adc_unit_t_ADC_UNIT_1,
                ulp_mode: esp_idf_sys::adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
                ..core::mem::zeroed()
            };
            esp_idf_sys::adc_oneshot_new_unit(&unit_cfg, &mut handle)
        };
        if ret != esp_idf_sys::ESP_OK {
            bail!("ADC unit init failed ({})", ret);
        }
        Ok(Self { handle })
    }

    /// Configure `channel` and return a reader for it.
    pub fn channel(self: &std::sync::Arc<Self>, channel: u32) -> anyhow::Result<AdcChannel> {
        let chan_cfg = esp_idf_sys::adc_oneshot_chan_cfg_t {
            atten: esp_idf_sys::adc_atten_t_ADC_ATTEN_DB_11,
            bitwidth: esp_idf_sys::adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        let ret = unsafe { esp_idf_sys::adc_oneshot_config_channel(self.handle, channel, &chan_cfg) };
        if ret != esp_idf_sys::ESP_OK {
            bail!("ADC channel {} config failed ({})", channel, ret);
        }
        Ok(AdcChannel {
            unit: self.clone(),
            channel,
        })
    }
}

impl Drop for AdcUnit {
    fn drop(&mut self) {
        unsafe {
            esp_idf_sys::adc_oneshot_del_unit(self.handle);
        }
    }
}

pub struct AdcChannel {
    unit: std::sync::Arc<AdcUnit>,
    channel: u32,
}

impl AnalogInput for AdcChannel {
    fn read_raw(&mut self) -> anyhow::Result<u16> {
        let mut raw: i32 = 0;
        let ret = unsafe { esp_idf_sys::adc_oneshot_read(self.unit.handle, self.channel, &mut raw) };
        if ret != esp_idf_sys::ESP_OK {
            bail!("ADC channel {} read failed ({})", self.channel, ret);
        }
        Ok(raw.clamp(0, i32::from(crate::config::ADC_MAX_RAW)) as u16)
    }
}

// ---------------------------------------------------------------------------
// Status LED
// ---------------------------------------------------------------------------
pub struct LedPin {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl LedPin {
    pub fn new(pin: AnyOutputPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::output(pin)?;
        pin.set_low()?;
        Ok(Self { pin })
    }
}

impl OutputPin for LedPin {
    fn set(&mut self, on: bool) -> anyhow::Result<()> {
        if on {
            self.pin.set_high()?;
        } else {
            self.pin.set_low()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NVS-backed key-value store
// ---------------------------------------------------------------------------
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .with_context(|| format!("opening NVS namespace {NVS_NAMESPACE}"))?;
        Ok(Self { nvs })
    }
}

impl KeyValueStore for NvsStore {
    fn load(&mut self, key: &str, buf: &mut [u8]) -> anyhow::Result<Option<usize>> {
        let blob = self
            .nvs
            .get_blob(key, buf)
            .with_context(|| format!("reading NVS key {key}"))?;
        Ok(blob.map(|data| data.len()))
    }

    fn save(&mut self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        self.nvs
            .set_blob(key, data)
            .with_context(|| format!("writing NVS key {key}"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dedicated tasks: FreeRTOS-backed std threads pinned to a core
// ---------------------------------------------------------------------------
pub struct PinnedSpawner;

impl Spawner for PinnedSpawner {
    fn spawn(
        &self,
        name: &'static str,
        placement: Placement,
        body: Box<dyn FnOnce() + Send>,
    ) -> anyhow::Result<()> {
        let pin_to_core = match placement.core {
            None => None,
            Some(0) => Some(Core::Core0),
            Some(1) => Some(Core::Core1),
            Some(other) => bail!("{name}: no core {other}"),
        };

        ThreadSpawnConfiguration {
            stack_size: placement.stack_size,
            pin_to_core,
            ..Default::default()
        }
        .set()
        .context("configuring thread spawn")?;

        let spawned = thread::Builder::new()
            .name(name.into())
            .stack_size(placement.stack_size)
            .spawn(body);

        // Later threads get the default configuration again.
        ThreadSpawnConfiguration::default()
            .set()
            .context("restoring thread spawn configuration")?;

        spawned.with_context(|| format!("spawning {name}"))?;
        log::info!("{} spawned on core {:?}", name, placement.core);
        Ok(())
    }
}
