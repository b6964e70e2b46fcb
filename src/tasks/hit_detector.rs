// Pedal Firmware - Hit Detector Task
//
// Samples the pedal sensor and runs a three-state hysteresis machine:
//
//   Idle --(adc > ramp_up)--> Armed --(adc > ramp_hit)--> Cooldown
//     ^                                                      |
//     +------------------(adc < ramp_down)-------------------+
//
// A hit emits one SensorValue carrying the arm-to-hit time, blinks the LED
// and goes to the session. Outside hit mode every sample is streamed as-is.

use std::sync::Arc;

use crate::config::{FirmwareConfig, BOOT_BLINK_MS, HIT_BLINK_MS};
use crate::drivers::adc::read_averaged;
use crate::drivers::led::Indicator;
use crate::events::{SensorValue, ValueSink};
use crate::hal::{AnalogInput, Clock, OutputPin, Timestamp};
use crate::settings::{Settings, SharedSettings};
use crate::task::{Task, TaskCore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectorState {
    #[default]
    Idle,
    Armed {
        armed_at: Timestamp,
    },
    Cooldown,
}

/// The detection logic on its own, fed one averaged reading at a time.
#[derive(Debug, Default)]
pub struct HitMachine {
    state: DetectorState,
    last_sample: Option<Timestamp>,
}

impl HitMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn feed(&mut self, now: Timestamp, adc: i32, settings: &Settings) -> Option<SensorValue> {
        if !settings.is_hit_mode() {
            self.state = DetectorState::Idle;
            let delta_time = self.last_sample.map_or(0, |last| now.saturating_sub(last));
            self.last_sample = Some(now);
            return Some(SensorValue {
                timestamp: now,
                value: adc,
                delta_time,
            });
        }

        match self.state {
            DetectorState::Idle => {
                if adc > settings.ramp_up {
                    self.state = DetectorState::Armed { armed_at: now };
                }
                None
            }
            DetectorState::Armed { armed_at } => {
                // Only a hit leaves Armed; the arm time is kept until then.
                if adc <= settings.ramp_hit {
                    return None;
                }
                self.state = DetectorState::Cooldown;
                Some(SensorValue {
                    timestamp: now,
                    value: 1,
                    delta_time: now.saturating_sub(armed_at),
                })
            }
            DetectorState::Cooldown => {
                if adc < settings.ramp_down {
                    self.state = DetectorState::Idle;
                }
                None
            }
        }
    }
}

pub struct HitDetector<A: AnalogInput, P: OutputPin> {
    core: TaskCore,
    adc: A,
    led: Indicator<P>,
    settings: SharedSettings,
    sink: Arc<dyn ValueSink>,
    machine: HitMachine,
    config: FirmwareConfig,
}

impl<A: AnalogInput, P: OutputPin> HitDetector<A, P> {
    pub fn new(
        adc: A,
        led: P,
        settings: SharedSettings,
        sink: Arc<dyn ValueSink>,
        clock: Arc<dyn Clock>,
        config: FirmwareConfig,
    ) -> Self {
        Self {
            core: TaskCore::cooperative("hit-detector", clock),
            adc,
            led: Indicator::new(led),
            settings,
            sink,
            machine: HitMachine::new(),
            config,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.machine.state()
    }

    pub fn led_lit(&self) -> bool {
        self.led.is_lit()
    }
}

impl<A: AnalogInput + 'static, P: OutputPin + 'static> Task for HitDetector<A, P> {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        log::info!("Hit detector started");
        let now = self.core.clock().now_ms();
        self.led.blink(now, BOOT_BLINK_MS);
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.config.low_power_backoff || self.sink.has_peer()
    }

    fn step_work(&mut self, now: Timestamp) {
        self.led.update(now);

        if !self.is_active() {
            self.core.suspend(now, self.config.backoff_ms);
            return;
        }

        let settings = self.settings.snapshot();
        let reading = read_averaged(
            &mut self.adc,
            self.core.clock().as_ref(),
            self.config.samples_per_reading,
            self.config.sample_spacing_us,
        );

        match reading {
            Ok(adc) => {
                if let Some(value) = self.machine.feed(now, adc, &settings) {
                    if settings.is_hit_mode() {
                        log::info!("Hit after {} ms", value.delta_time);
                        self.led.blink(now, HIT_BLINK_MS);
                    }
                    self.sink.push(value);
                }
            }
            Err(e) => log::warn!("Pedal read failed: {:#}", e),
        }

        self.core.suspend(now, settings.sample_interval_ms());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{MockClock, RecordingPin, ScriptedAdc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn thresholds() -> Settings {
        Settings {
            mode: 'H',
            sample_rate: 100,
            ramp_up: 800,
            ramp_hit: 1200,
            ramp_down: 700,
        }
    }

    #[test]
    fn rising_sequence_arms_hits_and_rearms() {
        let settings = thresholds();
        let mut machine = HitMachine::new();
        let samples = [0, 799, 801, 1201, 699];
        let times = [0, 10, 20, 30, 40];
        let mut emitted = Vec::new();

        for (i, (&adc, &now)) in samples.iter().zip(times.iter()).enumerate() {
            let out = machine.feed(now, adc, &settings);
            match i {
                0 | 1 => assert_eq!(machine.state(), DetectorState::Idle),
                2 => assert_eq!(machine.state(), DetectorState::Armed { armed_at: 20 }),
                3 => assert_eq!(machine.state(), DetectorState::Cooldown),
                _ => assert_eq!(machine.state(), DetectorState::Idle),
            }
            if let Some(value) = out {
                emitted.push((i, value));
            }
        }

        assert_eq!(
            emitted,
            vec![(
                3,
                SensorValue {
                    timestamp: 30,
                    value: 1,
                    delta_time: 10
                }
            )]
        );
    }

    #[test]
    fn cooldown_holds_until_ramp_down() {
        let settings = thresholds();
        let mut machine = HitMachine::new();
        machine.feed(0, 900, &settings);
        assert!(machine.feed(5, 1300, &settings).is_some());

        // Between ramp_down and ramp_up: still cooling down, no new hit.
        assert!(machine.feed(10, 1300, &settings).is_none());
        assert!(machine.feed(15, 750, &settings).is_none());
        assert_eq!(machine.state(), DetectorState::Cooldown);

        assert!(machine.feed(20, 600, &settings).is_none());
        assert_eq!(machine.state(), DetectorState::Idle);
    }

    #[test]
    fn arm_does_not_hit_on_same_sample() {
        let mut machine = HitMachine::new();
        assert!(machine.feed(0, 5000, &thresholds()).is_none());
        assert_eq!(machine.state(), DetectorState::Armed { armed_at: 0 });
    }

    #[test]
    fn partial_press_stays_armed_from_first_arm() {
        let settings = thresholds();
        let mut machine = HitMachine::new();
        machine.feed(0, 900, &settings);
        assert!(machine.feed(10, 600, &settings).is_none());
        assert_eq!(machine.state(), DetectorState::Armed { armed_at: 0 });
        assert!(machine.feed(20, 900, &settings).is_none());
        assert_eq!(machine.state(), DetectorState::Armed { armed_at: 0 });

        let hit = machine.feed(30, 1300, &settings);
        assert_eq!(
            hit,
            Some(SensorValue {
                timestamp: 30,
                value: 1,
                delta_time: 30
            })
        );
        assert_eq!(machine.state(), DetectorState::Cooldown);
    }

    #[test]
    fn stream_mode_emits_every_sample() {
        let settings = Settings {
            mode: 'R',
            ..thresholds()
        };
        let mut machine = HitMachine::new();
        let out: Vec<_> = [(0, 5), (10, 900), (25, 1300)]
            .into_iter()
            .map(|(now, adc)| machine.feed(now, adc, &settings).unwrap())
            .collect();

        assert_eq!(out.iter().map(|v| v.value).collect::<Vec<_>>(), vec![5, 900, 1300]);
        assert_eq!(out.iter().map(|v| v.delta_time).collect::<Vec<_>>(), vec![0, 10, 15]);
    }

    #[derive(Default)]
    struct Sink {
        peer: AtomicBool,
        values: Mutex<Vec<SensorValue>>,
    }

    impl ValueSink for Sink {
        fn push(&self, value: SensorValue) {
            self.values.lock().unwrap().push(value);
        }

        fn has_peer(&self) -> bool {
            self.peer.load(Ordering::SeqCst)
        }
    }

    fn detector(
        samples: impl IntoIterator<Item = u16>,
        settings: Settings,
        config: FirmwareConfig,
    ) -> (HitDetector<ScriptedAdc, RecordingPin>, Arc<Sink>, RecordingPin) {
        let sink = Arc::new(Sink::default());
        sink.peer.store(true, Ordering::SeqCst);
        let pin = RecordingPin::new();
        let task = HitDetector::new(
            ScriptedAdc::new(samples),
            pin.clone(),
            SharedSettings::new(settings),
            sink.clone(),
            Arc::new(MockClock::new()),
            FirmwareConfig {
                samples_per_reading: 1,
                ..config
            },
        );
        (task, sink, pin)
    }

    #[test]
    fn hit_pushes_value_and_blinks() {
        let (mut task, sink, pin) = detector([0, 900, 1300], thresholds(), FirmwareConfig::default());

        let mut now = 0;
        for _ in 0..3 {
            task.step(now);
            assert_eq!(task.next_step_time(now), now + 10);
            now += 10;
        }

        let values = sink.values.lock().unwrap().clone();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].delta_time, 10);
        assert!(task.led_lit());
        assert_eq!(pin.level(), Some(true));

        task.step(now + HIT_BLINK_MS);
        assert!(!task.led_lit());
    }

    #[test]
    fn backs_off_without_peer() {
        let (mut task, sink, _) = detector([0, 900, 1300], thresholds(), FirmwareConfig::default());
        sink.peer.store(false, Ordering::SeqCst);

        task.step(0);
        assert!(!task.is_active());
        assert_eq!(task.next_step_time(0), 500);
        assert_eq!(task.state(), DetectorState::Idle);
    }

    #[test]
    fn keeps_sampling_when_backoff_disabled() {
        let config = FirmwareConfig {
            low_power_backoff: false,
            ..FirmwareConfig::default()
        };
        let (mut task, sink, _) = detector([900], thresholds(), config);
        sink.peer.store(false, Ordering::SeqCst);

        task.step(0);
        assert!(task.is_active());
        assert_eq!(task.state(), DetectorState::Armed { armed_at: 0 });
        assert_eq!(task.next_step_time(0), 10);
    }

    #[test]
    fn setup_blinks_for_boot() {
        let (mut task, _, pin) = detector([0], thresholds(), FirmwareConfig::default());
        task.setup().unwrap();
        assert_eq!(pin.level(), Some(true));
        task.step(BOOT_BLINK_MS);
        assert_eq!(pin.level(), Some(false));
    }
}
