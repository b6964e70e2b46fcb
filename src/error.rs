// Pedal Firmware - Error Types

use core::fmt;

/// Why a settings record was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    /// Buffer length differs from the fixed record size.
    Length { expected: usize, actual: usize },
    /// Size field inside the record is wrong.
    SizeField(u32),
    /// Magic key does not match.
    Key(i32),
    /// A zero sample rate would stall the detector.
    SampleRate,
    /// Mode char does not fit the one-byte field.
    Mode(char),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Length { expected, actual } => {
                write!(f, "settings record is {} bytes, expected {}", actual, expected)
            }
            SettingsError::SizeField(size) => write!(f, "settings size field {} is invalid", size),
            SettingsError::Key(key) => write!(f, "settings key {:#010x} is invalid", key),
            SettingsError::SampleRate => write!(f, "sample rate must be non-zero"),
            SettingsError::Mode(mode) => write!(f, "mode {:?} does not fit in one byte", mode),
        }
    }
}

impl std::error::Error for SettingsError {}
