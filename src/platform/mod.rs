// Pedal Firmware - Platform Bindings
//
// `esp` binds the hal and transport traits to ESP-IDF; `mock` provides the
// host doubles the tests run on.

#[cfg(all(target_os = "espidf", feature = "experimental"))]
pub mod esp;

#[cfg(not(target_os = "espidf"))]
pub mod mock;
