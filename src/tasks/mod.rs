pub mod hit_detector;
pub mod power;
pub mod session;
