// Pedal Firmware - Status LED
//
// Blinks without blocking: `blink` lights the LED and records when it should
// go dark, `update` (called every step) turns it off once that time passes.

use crate::hal::{OutputPin, Timestamp};

pub struct Indicator<P: OutputPin> {
    pin: P,
    off_at: Option<Timestamp>,
}

impl<P: OutputPin> Indicator<P> {
    pub fn new(pin: P) -> Self {
        Self { pin, off_at: None }
    }

    pub fn blink(&mut self, now: Timestamp, duration_ms: u64) {
        if let Err(e) = self.pin.set(true) {
            log::warn!("LED on failed: {:#}", e);
            return;
        }
        self.off_at = Some(now + duration_ms);
    }

    pub fn update(&mut self, now: Timestamp) {
        match self.off_at {
            Some(off_at) if now >= off_at => {
                if let Err(e) = self.pin.set(false) {
                    log::warn!("LED off failed: {:#}", e);
                }
                self.off_at = None;
            }
            _ => {}
        }
    }

    pub fn is_lit(&self) -> bool {
        self.off_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::RecordingPin;

    #[test]
    fn blink_turns_off_after_duration() {
        let pin = RecordingPin::new();
        let mut led = Indicator::new(pin.clone());

        led.blink(1000, 100);
        assert!(led.is_lit());
        assert_eq!(pin.level(), Some(true));

        led.update(1099);
        assert!(led.is_lit());
        led.update(1100);
        assert!(!led.is_lit());
        assert_eq!(pin.history(), vec![true, false]);
    }

    #[test]
    fn reblink_extends_deadline() {
        let pin = RecordingPin::new();
        let mut led = Indicator::new(pin.clone());

        led.blink(0, 100);
        led.blink(80, 100);
        led.update(120);
        assert!(led.is_lit());
        led.update(180);
        assert_eq!(pin.level(), Some(false));
    }
}
