pub mod adc;
pub mod battery;
pub mod led;
