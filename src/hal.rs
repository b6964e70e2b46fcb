// Pedal Firmware - Hardware Collaborators
//
// Everything the core needs from the board, expressed as traits.
// `platform::esp` binds them to ESP-IDF, `platform::mock` backs host tests.

use crate::task::{SuspendHandle, WakeToken};

/// Milliseconds since boot.
pub type Timestamp = u64;

/// Monotonic clock plus the blocking sleep primitives.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Timestamp;

    /// Short busy-wait, used between averaged ADC samples.
    fn delay_us(&self, us: u32);

    /// Blocking sleep of the calling context for up to `ms`. Ends as soon
    /// as `wake` is cancelled after `token` was taken.
    fn sleep_ms_or_wake(&self, ms: u32, wake: &SuspendHandle, token: WakeToken) {
        wake.wait_from(token, ms);
    }
}

/// Single analog channel returning a bounded raw reading.
pub trait AnalogInput: Send {
    fn read_raw(&mut self) -> anyhow::Result<u16>;
}

/// Digital output (LED).
pub trait OutputPin: Send {
    fn set(&mut self, on: bool) -> anyhow::Result<()>;
}

/// Keyed byte-blob store.
pub trait KeyValueStore: Send {
    /// Copy the blob stored under `key` into `buf` and return its length,
    /// or `None` when nothing is stored.
    fn load(&mut self, key: &str, buf: &mut [u8]) -> anyhow::Result<Option<usize>>;

    fn save(&mut self, key: &str, data: &[u8]) -> anyhow::Result<()>;
}
