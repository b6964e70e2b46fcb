// Pedal Firmware - ADC Averaging

use anyhow::ensure;

use crate::hal::{AnalogInput, Clock};

/// Mean of `samples` consecutive readings spaced `spacing_us` apart, to
/// knock down electrical noise.
pub fn read_averaged(
    input: &mut dyn AnalogInput,
    clock: &dyn Clock,
    samples: u32,
    spacing_us: u32,
) -> anyhow::Result<i32> {
    ensure!(samples > 0, "at least one sample per reading");

    let mut sum: u64 = 0;
    for i in 0..samples {
        if i > 0 && spacing_us > 0 {
            clock.delay_us(spacing_us);
        }
        sum += u64::from(input.read_raw()?);
    }
    Ok((sum / u64::from(samples)) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{MockClock, ScriptedAdc};

    #[test]
    fn averages_consecutive_samples() {
        let clock = MockClock::new();
        let mut adc = ScriptedAdc::new([100, 200, 300, 400]);
        assert_eq!(read_averaged(&mut adc, &clock, 4, 10).unwrap(), 250);
    }

    #[test]
    fn single_sample_is_passed_through() {
        let clock = MockClock::new();
        let mut adc = ScriptedAdc::new([1234]);
        assert_eq!(read_averaged(&mut adc, &clock, 1, 0).unwrap(), 1234);
    }

    #[test]
    fn long_runs_of_full_scale_do_not_wrap() {
        let clock = MockClock::new();
        let mut adc = ScriptedAdc::new([u16::MAX]);
        assert_eq!(read_averaged(&mut adc, &clock, 70_000, 0).unwrap(), i32::from(u16::MAX));
    }

    #[test]
    fn zero_samples_rejected() {
        let clock = MockClock::new();
        let mut adc = ScriptedAdc::new([1]);
        assert!(read_averaged(&mut adc, &clock, 0, 0).is_err());
    }
}
