// Pedal Firmware - Library Root
//
// Control core of a BLE foot pedal. A super-loop scheduler steps the
// cooperative tasks (hit detection, battery monitoring) while the BLE
// session runs as a dedicated task on its own core. Hardware sits behind
// the traits in `hal`.

use std::sync::{Mutex, MutexGuard};

pub mod config;
pub mod drivers;
pub mod error;
pub mod events;
pub mod hal;
pub mod platform;
pub mod scheduler;
pub mod settings;
pub mod task;
pub mod tasks;
pub mod transport;

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
