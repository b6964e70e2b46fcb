// Pedal Firmware - Power Monitor Task
//
// Periodically samples the battery divider, maps the reading through the
// discharge curve, smooths it and holds the result for the BLE session.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::FirmwareConfig;
use crate::drivers::adc::read_averaged;
use crate::drivers::battery::{BatteryCurve, Smoother};
use crate::hal::{AnalogInput, Clock, Timestamp};
use crate::task::{Task, TaskCore};

/// Latest battery reading, shared with the session.
#[derive(Debug, Default)]
pub struct BatteryState {
    raw: AtomicU32,
    percent: AtomicU8,
}

impl BatteryState {
    pub const RECORD_SIZE: usize = 5;

    pub fn store(&self, raw: u32, percent: u8) {
        self.raw.store(raw, Ordering::Relaxed);
        self.percent.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn raw(&self) -> u32 {
        self.raw.load(Ordering::Relaxed)
    }

    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::Relaxed)
    }

    /// `raw:u32 | percent:u8`, little-endian.
    pub fn record(&self) -> [u8; Self::RECORD_SIZE] {
        let mut out = [0u8; Self::RECORD_SIZE];
        out[0..4].copy_from_slice(&self.raw().to_le_bytes());
        out[4] = self.percent();
        out
    }
}

pub struct PowerMonitor<A: AnalogInput> {
    core: TaskCore,
    adc: A,
    curve: BatteryCurve,
    smoother: Smoother,
    state: Arc<BatteryState>,
    config: FirmwareConfig,
}

impl<A: AnalogInput> PowerMonitor<A> {
    pub fn new(adc: A, state: Arc<BatteryState>, clock: Arc<dyn Clock>, config: FirmwareConfig) -> Self {
        Self {
            core: TaskCore::cooperative("power", clock),
            adc,
            curve: BatteryCurve::default(),
            smoother: Smoother::new(config.battery_smoothing),
            state,
            config,
        }
    }

    fn sample(&mut self) -> anyhow::Result<()> {
        let raw = read_averaged(
            &mut self.adc,
            self.core.clock().as_ref(),
            self.config.samples_per_reading,
            self.config.sample_spacing_us,
        )?;
        let raw = raw.clamp(0, i32::from(u16::MAX)) as u16;
        let level = self.smoother.update(f32::from(self.curve.percent(raw)));
        let percent = level.round().clamp(0.0, 100.0) as u8;

        self.state.store(u32::from(raw), percent);
        log::debug!("Battery raw {} -> {}%", raw, percent);
        Ok(())
    }
}

impl<A: AnalogInput + 'static> Task for PowerMonitor<A> {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        log::info!("Power monitor started");
        Ok(())
    }

    fn step_work(&mut self, now: Timestamp) {
        if let Err(e) = self.sample() {
            log::warn!("Battery read failed: {:#}", e);
        }
        self.core.suspend(now, self.config.battery_interval());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::battery::BATTERY_RAW_MIN;
    use crate::platform::mock::{MockClock, ScriptedAdc};

    fn monitor(samples: impl IntoIterator<Item = u16>) -> (PowerMonitor<ScriptedAdc>, Arc<BatteryState>) {
        let state = Arc::new(BatteryState::default());
        let config = FirmwareConfig {
            samples_per_reading: 1,
            ..FirmwareConfig::default()
        };
        let monitor = PowerMonitor::new(
            ScriptedAdc::new(samples),
            state.clone(),
            Arc::new(MockClock::new()),
            config,
        );
        (monitor, state)
    }

    #[test]
    fn holds_smoothed_percentage() {
        let (mut task, state) = monitor([4095, BATTERY_RAW_MIN]);

        task.step(0);
        assert_eq!(state.percent(), 100);
        assert_eq!(state.raw(), 4095);
        assert_eq!(task.next_step_time(0), 1000);

        task.step(1000);
        assert_eq!(state.raw(), u32::from(BATTERY_RAW_MIN));
        assert_eq!(state.percent(), 75);
    }

    #[test]
    fn out_of_range_readings_stay_bounded() {
        let (mut task, state) = monitor([0, 4095, 0, 65535, 2100, 3000]);
        for i in 0..6 {
            task.step(i * 1000);
            assert!(state.percent() <= 100);
        }
    }

    #[test]
    fn interval_never_below_floor() {
        let state = Arc::new(BatteryState::default());
        let config = FirmwareConfig {
            battery_interval_ms: 10,
            samples_per_reading: 1,
            ..FirmwareConfig::default()
        };
        let mut task = PowerMonitor::new(ScriptedAdc::new([2200]), state, Arc::new(MockClock::new()), config);
        task.step(0);
        assert_eq!(task.next_step_time(0), 500);
    }

    #[test]
    fn record_layout() {
        let state = BatteryState::default();
        state.store(2345, 150);
        let record = state.record();
        assert_eq!(&record[0..4], &2345u32.to_le_bytes());
        assert_eq!(record[4], 100);
    }
}
