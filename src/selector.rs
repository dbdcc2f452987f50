//! Safety-biased selection of the reported voltage and temperature.
//!
//! Under an alarm (or a threshold breach) the reading that best reflects the danger is
//! reported instead of an average that a healthy sibling would flatter.

use tracing::debug;

/// Deviation reference for a nominal 12 V bank.
pub const NOMINAL_VOLTAGE: f64 = 13.0;

/// Fixed critical points of the charge envelope, independent of the adjustable thresholds.
pub const COLD_CRITICAL: f64 = 0.0;
pub const HOT_CRITICAL: f64 = 45.0;

/// Span covered by the 1..=100 threshold slider.
pub const SLIDER_MIN_CELSIUS: f64 = -50.0;
pub const SLIDER_MAX_CELSIUS: f64 = 100.0;
pub const SLIDER_MIN_POSITION: u8 = 1;
pub const SLIDER_MAX_POSITION: u8 = 100;

pub fn select_voltage(readings: &[f64], low_alarms: &[f64], high_alarms: &[f64]) -> f64 {
    let Some((min, max, avg)) = spread(readings) else {
        return 0.0;
    };
    let low_active = low_alarms.iter().any(|flag| *flag != 0.0);
    let high_active = high_alarms.iter().any(|flag| *flag != 0.0);

    match (low_active, high_active) {
        (true, true) => {
            let low_deviation = (min - NOMINAL_VOLTAGE).abs();
            let high_deviation = (max - NOMINAL_VOLTAGE).abs();
            let reported = if low_deviation > high_deviation { min } else { max };
            debug!("Both voltage alarms active: low {min:.2}V, high {max:.2}V, reporting {reported:.2}V");
            reported
        }
        (true, false) => {
            debug!("Low voltage alarm active: reporting minimum {min:.2}V (avg {avg:.2}V)");
            min
        }
        (false, true) => {
            debug!("High voltage alarm active: reporting maximum {max:.2}V (avg {avg:.2}V)");
            max
        }
        (false, false) => avg,
    }
}

/// Runtime temperature thresholds in °C.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureThresholds {
    pub cold: f64,
    pub hot: f64,
}

impl TemperatureThresholds {
    pub fn new(cold: f64, hot: f64) -> Self {
        Self { cold, hot }
    }

    /// Thresholds from persisted slider positions, falling back to the configured defaults.
    pub fn from_positions(cold: Option<u8>, hot: Option<u8>, defaults: TemperatureThresholds) -> Self {
        Self {
            cold: cold.map(position_to_celsius).unwrap_or(defaults.cold),
            hot: hot.map(position_to_celsius).unwrap_or(defaults.hot),
        }
    }
}

impl Default for TemperatureThresholds {
    fn default() -> Self {
        Self::new(10.0, 40.5)
    }
}

/// Maps a slider position onto the fixed span: `-50 + (pos - 1) / 99 * 150`.
pub fn position_to_celsius(position: u8) -> f64 {
    let position = position.clamp(SLIDER_MIN_POSITION, SLIDER_MAX_POSITION);
    let span = SLIDER_MAX_CELSIUS - SLIDER_MIN_CELSIUS;
    SLIDER_MIN_CELSIUS + f64::from(position - SLIDER_MIN_POSITION) / 99.0 * span
}

/// Closest slider position for a temperature.
pub fn celsius_to_position(celsius: f64) -> u8 {
    let span = SLIDER_MAX_CELSIUS - SLIDER_MIN_CELSIUS;
    let position = (celsius - SLIDER_MIN_CELSIUS) / span * 99.0 + 1.0;
    position
        .round()
        .clamp(f64::from(SLIDER_MIN_POSITION), f64::from(SLIDER_MAX_POSITION)) as u8
}

pub fn select_temperature(readings: &[f64], thresholds: &TemperatureThresholds) -> Option<f64> {
    let (min, max, avg) = spread(readings)?;
    let cold_active = min < thresholds.cold;
    let hot_active = max > thresholds.hot;

    let reported = match (cold_active, hot_active) {
        (true, true) => {
            let cold_severity = (min - COLD_CRITICAL).abs();
            let hot_severity = (max - HOT_CRITICAL).abs();
            let reported = if cold_severity < hot_severity { min } else { max };
            debug!("Temperature danger on both sides: cold {min:.1}C, hot {max:.1}C, reporting {reported:.1}C");
            reported
        }
        (true, false) => {
            debug!("Cold temperature: reporting lowest {min:.1}C (avg {avg:.1}C)");
            min
        }
        (false, true) => {
            debug!("Hot temperature: reporting highest {max:.1}C (avg {avg:.1}C)");
            max
        }
        (false, false) => avg,
    };
    Some(reported)
}

fn spread(readings: &[f64]) -> Option<(f64, f64, f64)> {
    if readings.is_empty() {
        return None;
    }
    let min = readings.iter().copied().fold(f64::INFINITY, f64::min);
    let max = readings.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = readings.iter().sum::<f64>() / readings.len() as f64;
    Some((min, max, avg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_empty_is_zero() {
        assert_eq!(select_voltage(&[], &[1.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_voltage_average_without_alarms() {
        let reported = select_voltage(&[13.2, 13.0, 12.9], &[0.0, 0.0], &[]);
        assert!((reported - 13.033_333).abs() < 1e-5);
    }

    #[test]
    fn test_low_alarm_reports_minimum_regardless_of_order() {
        for readings in [[12.9, 11.6, 13.1], [11.6, 13.1, 12.9], [13.1, 12.9, 11.6]] {
            assert_eq!(select_voltage(&readings, &[0.0, 2.0, 0.0], &[0.0]), 11.6);
        }
    }

    #[test]
    fn test_high_alarm_reports_maximum() {
        assert_eq!(select_voltage(&[13.4, 14.9], &[0.0, 0.0], &[1.0, 0.0]), 14.9);
    }

    #[test]
    fn test_both_alarms_largest_deviation_wins() {
        // deviations 1.5 and 1.8
        assert_eq!(select_voltage(&[11.5, 14.8], &[1.0], &[1.0]), 14.8);
        // deviations 2.0 and 1.4
        assert_eq!(select_voltage(&[11.0, 14.4], &[1.0], &[1.0]), 11.0);
    }

    #[test]
    fn test_temperature_empty_is_none() {
        assert_eq!(select_temperature(&[], &TemperatureThresholds::default()), None);
    }

    #[test]
    fn test_temperature_average_in_safe_range() {
        let reported = select_temperature(&[25.0, 26.0], &TemperatureThresholds::default());
        assert_eq!(reported, Some(25.5));
    }

    #[test]
    fn test_temperature_cold_and_hot() {
        let thresholds = TemperatureThresholds::default();
        assert_eq!(select_temperature(&[4.0, 20.0], &thresholds), Some(4.0));
        assert_eq!(select_temperature(&[20.0, 41.0], &thresholds), Some(41.0));
    }

    #[test]
    fn test_temperature_both_dangers_closest_to_critical() {
        let thresholds = TemperatureThresholds::default();
        // 8C is 8 away from 0C, 42C is 3 away from 45C
        assert_eq!(select_temperature(&[8.0, 42.0], &thresholds), Some(42.0));
        // 1C is 1 away from 0C, 41C is 4 away from 45C
        assert_eq!(select_temperature(&[1.0, 41.0], &thresholds), Some(1.0));
    }

    #[test]
    fn test_slider_mapping() {
        assert_eq!(position_to_celsius(1), -50.0);
        assert_eq!(position_to_celsius(100), 100.0);
        assert!((position_to_celsius(41) - 10.606).abs() < 0.01);
        assert_eq!(position_to_celsius(0), -50.0);
        assert_eq!(celsius_to_position(-50.0), 1);
        assert_eq!(celsius_to_position(100.0), 100);
        assert_eq!(celsius_to_position(10.0), 41);
        assert_eq!(celsius_to_position(40.5), 61);
        assert_eq!(celsius_to_position(500.0), 100);
    }

    #[test]
    fn test_thresholds_from_positions() {
        let defaults = TemperatureThresholds::default();
        let thresholds = TemperatureThresholds::from_positions(None, Some(100), defaults);
        assert_eq!(thresholds.cold, 10.0);
        assert_eq!(thresholds.hot, 100.0);
    }
}
