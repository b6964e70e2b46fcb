// Pedal Firmware - Battery Calibration
//
// Raw ADC reading (LiPo behind a 1:2 divider) to charge percentage via a
// measured discharge curve, one entry per raw step starting at
// `BATTERY_RAW_MIN`.

pub const BATTERY_RAW_MIN: u16 = 1995;

#[rustfmt::skip]
pub static BATTERY_CURVE: [u8; 424] = [
    0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 7, 7, 7, 7, 7, 7, 7, 7, 7, 8, 8, 8, 8, 8, 8, 8, 8, 9,
    9, 9, 9, 9, 10, 10, 11, 11, 12, 12, 12, 13, 14, 14, 15, 16, 16, 17, 18, 19, 19, 19, 20, 21,
    22, 22, 23, 24, 25, 25, 26, 26, 26, 27, 27, 28, 28, 28, 28, 28, 29, 29, 29, 30, 30, 30, 31, 31,
    31, 31, 31, 32, 32, 32, 33, 33, 33, 33, 34, 34, 34, 34, 35, 35, 35, 35, 36, 36, 36, 37, 37, 37,
    37, 38, 38, 38, 38, 39, 39, 39, 39, 40, 40, 40, 40, 40, 41, 41, 41, 42, 42, 42, 42, 42, 43, 43,
    43, 44, 44, 44, 44, 44, 45, 45, 45, 46, 46, 46, 47, 47, 48, 49, 49, 49, 50, 50, 51, 52, 53, 53,
    54, 54, 55, 56, 57, 57, 58, 58, 59, 60, 60, 61, 61, 62, 63, 63, 64, 64, 66, 66, 67, 67, 68, 68,
    69, 69, 70, 70, 71, 71, 72, 72, 73, 73, 73, 74, 74, 74, 75, 75, 75, 75, 76, 76, 76, 76, 77, 77,
    77, 77, 78, 78, 78, 78, 79, 79, 79, 79, 80, 80, 80, 80, 80, 80, 81, 81, 81, 81, 82, 82, 82, 82,
    83, 83, 83, 83, 83, 83, 84, 84, 84, 84, 84, 85, 85, 85, 85, 85, 86, 86, 86, 86, 86, 86, 87, 87,
    87, 87, 87, 87, 88, 88, 88, 88, 88, 88, 88, 89, 89, 89, 89, 89, 89, 89, 89, 89, 90, 90, 90, 90,
    90, 90, 90, 90, 90, 90, 91, 91, 91, 91, 91, 91, 91, 91, 91, 91, 91, 92, 92, 92, 92, 92, 92, 92,
    92, 92, 93, 93, 93, 93, 93, 93, 93, 93, 93, 94, 94, 94, 94, 94, 94, 94, 94, 94, 95, 95, 95, 95,
    95, 95, 95, 95, 95, 96, 96, 96, 96, 96, 96, 96, 96, 97, 97, 97, 97, 97, 97, 97, 97, 98, 98, 98,
    98, 98, 98, 98, 98, 99, 99, 99, 99, 99, 99, 99, 100, 100, 100, 100,
];

/// Monotonic lookup table indexed by `raw - min_raw`.
#[derive(Debug, Clone, Copy)]
pub struct BatteryCurve {
    min_raw: u16,
    table: &'static [u8],
}

impl BatteryCurve {
    pub const fn new(min_raw: u16, table: &'static [u8]) -> Self {
        Self { min_raw, table }
    }

    /// Out-of-range readings clamp to the table ends.
    pub fn percent(&self, raw: u16) -> u8 {
        let Some(last) = self.table.len().checked_sub(1) else {
            return 0;
        };
        let index = usize::from(raw.saturating_sub(self.min_raw)).min(last);
        self.table[index].min(100)
    }
}

impl Default for BatteryCurve {
    fn default() -> Self {
        Self::new(BATTERY_RAW_MIN, &BATTERY_CURVE)
    }
}

/// Single-step exponential smoothing; the first sample seeds the value.
#[derive(Debug, Clone, Copy)]
pub struct Smoother {
    alpha: f32,
    value: Option<f32>,
}

impl Smoother {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            value: None,
        }
    }

    pub fn update(&mut self, sample: f32) -> f32 {
        let next = match self.value {
            Some(current) => current + (sample - current) * self.alpha,
            None => sample,
        };
        self.value = Some(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_is_monotonic() {
        assert!(BATTERY_CURVE.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn percent_stays_in_range_for_any_raw() {
        let curve = BatteryCurve::default();
        let mut last = 0;
        for raw in 0..=u16::MAX {
            let p = curve.percent(raw);
            assert!(p <= 100);
            assert!(p >= last);
            last = p;
        }
    }

    #[test]
    fn out_of_range_clamps() {
        let curve = BatteryCurve::default();
        assert_eq!(curve.percent(0), 0);
        assert_eq!(curve.percent(BATTERY_RAW_MIN - 1), 0);
        assert_eq!(curve.percent(BATTERY_RAW_MIN + 423), 100);
        assert_eq!(curve.percent(4095), 100);
        assert_eq!(curve.percent(BATTERY_RAW_MIN + 200), BATTERY_CURVE[200]);
    }

    #[test]
    fn smoother_moves_toward_sample() {
        let mut s = Smoother::new(0.25);
        assert_eq!(s.update(80.0), 80.0);
        assert_eq!(s.update(40.0), 70.0);
        assert_eq!(s.update(70.0), 70.0);
    }
}
