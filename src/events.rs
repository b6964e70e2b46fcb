// Pedal Firmware - Sensor Events

use crate::hal::Timestamp;

// ---------------------------------------------------------------------------
// Sensor Value (one detected event, or one raw sample outside hit mode)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorValue {
    pub timestamp: Timestamp,
    pub value: i32,
    /// Milliseconds between arming and the hit, or since the previous
    /// sample when streaming.
    pub delta_time: u64,
}

impl SensorValue {
    pub const RECORD_SIZE: usize = 12;

    /// `timestamp:u32 | value:i32 | delta_time:i32`, little-endian.
    pub fn to_bytes(&self) -> [u8; Self::RECORD_SIZE] {
        let mut out = [0u8; Self::RECORD_SIZE];
        out[0..4].copy_from_slice(&(self.timestamp as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.value.to_le_bytes());
        let delta = self.delta_time.min(i32::MAX as u64) as i32;
        out[8..12].copy_from_slice(&delta.to_le_bytes());
        out
    }
}

// ---------------------------------------------------------------------------
// Value Sink: where the detector pushes its output
// ---------------------------------------------------------------------------
pub trait ValueSink: Send + Sync {
    /// Hand over the latest value. Dropped when nobody is listening.
    fn push(&self, value: SensorValue);

    /// True while at least one peer is connected.
    fn has_peer(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let value = SensorValue {
            timestamp: 0x1_0000_0102,
            value: -2,
            delta_time: 37,
        };
        let bytes = value.to_bytes();
        assert_eq!(&bytes[0..4], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(&bytes[4..8], &(-2i32).to_le_bytes());
        assert_eq!(&bytes[8..12], &37i32.to_le_bytes());
    }
}
