//! Fuses the snapshots of all included devices into one aggregate.

use crate::estimator::RemainingTimeEstimator;
use crate::selector::{select_temperature, select_voltage, TemperatureThresholds};
use crate::snapshot::{AggregateResult, DeviceSnapshot, Field, FieldRule, Rule};

/// Combines the present values of one field. Absent readings never count as zero.
///
/// Empty input yields `Some(0.0)` for sums and alarms and `None` for every other rule.
pub fn combine(values: &[Option<f64>], rule: Rule) -> Option<f64> {
    let mut present = values.iter().flatten().copied().peekable();
    match rule {
        Rule::Sum => Some(present.sum()),
        Rule::Min => present.reduce(f64::min),
        Rule::Max => present.reduce(f64::max),
        Rule::AnyAlarm => Some(present.fold(0.0, f64::max)),
        Rule::Average => {
            present.peek()?;
            let (sum, count) = present.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
            Some(sum / count as f64)
        }
    }
}

/// Static inputs of a pass besides the snapshots themselves.
#[derive(Debug, Clone, Copy)]
pub struct PassContext {
    pub thresholds: TemperatureThresholds,
    pub total_capacity_ah: f64,
}

/// Runs every field through its rule, the safety selectors and the estimator.
pub fn fuse(
    snapshots: &[DeviceSnapshot],
    context: &PassContext,
    estimator: &mut RemainingTimeEstimator,
) -> AggregateResult {
    let column = |field: Field| -> Vec<Option<f64>> { snapshots.iter().map(|s| s.get(field)).collect() };
    let present = |field: Field| -> Vec<f64> { snapshots.iter().filter_map(|s| s.get(field)).collect() };

    let mut result = AggregateResult::default();
    for field in Field::ALL {
        match field.rule() {
            FieldRule::Combine(rule) => {
                let value = combine(&column(field), rule).or(field.fallback());
                result.set(field, value);
            }
            FieldRule::SelectVoltage => {
                let voltage = select_voltage(
                    &present(Field::Voltage),
                    &present(Field::AlarmLowVoltage),
                    &present(Field::AlarmHighVoltage),
                );
                result.set(field, Some(voltage));
            }
            FieldRule::SelectTemperature => {
                let temperature = select_temperature(&present(Field::Temperature), &context.thresholds);
                result.set(field, temperature);
            }
            // Needs the fused current and SoC, filled in below.
            FieldRule::EstimateRemainingTime => {}
        }
    }

    let total_current = result.get(Field::Current).unwrap_or_default();
    let soc = result.get(Field::Soc).unwrap_or_default();
    let peers: Vec<f64> = present(Field::TimeToGo).into_iter().filter(|t| *t > 0.0).collect();
    let time_to_go = estimator.estimate(total_current, soc, context.total_capacity_ah, &peers);
    result.set(Field::TimeToGo, time_to_go);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(capacity: f64) -> PassContext {
        PassContext {
            thresholds: TemperatureThresholds::default(),
            total_capacity_ah: capacity,
        }
    }

    #[test]
    fn test_combine_rules() {
        let values = [Some(3.0), None, Some(-1.5), Some(7.0)];
        assert_eq!(combine(&values, Rule::Sum), Some(8.5));
        assert_eq!(combine(&values, Rule::Min), Some(-1.5));
        assert_eq!(combine(&values, Rule::Max), Some(7.0));
        assert_eq!(combine(&values, Rule::Average), Some(8.5 / 3.0));
        assert_eq!(combine(&[Some(0.0), Some(2.0), None], Rule::AnyAlarm), Some(2.0));
    }

    #[test]
    fn test_combine_empty() {
        assert_eq!(combine(&[], Rule::Sum), Some(0.0));
        assert_eq!(combine(&[], Rule::Min), None);
        assert_eq!(combine(&[None, None], Rule::Max), None);
        assert_eq!(combine(&[None], Rule::Average), None);
        assert_eq!(combine(&[], Rule::AnyAlarm), Some(0.0));
    }

    #[test]
    fn test_two_device_bank() {
        let a = DeviceSnapshot::default()
            .with(Field::Voltage, 13.2)
            .with(Field::Current, -5.0)
            .with(Field::Soc, 80.0)
            .with(Field::Temperature, 25.0)
            .with(Field::AlarmLowVoltage, 0.0)
            .with(Field::AlarmHighVoltage, 0.0);
        let b = DeviceSnapshot::default()
            .with(Field::Voltage, 13.0)
            .with(Field::Current, -3.0)
            .with(Field::Soc, 70.0)
            .with(Field::Temperature, 26.0);

        let mut estimator = RemainingTimeEstimator::new();
        let result = fuse(&[a, b], &context(200.0), &mut estimator);

        assert_eq!(result.get(Field::Current), Some(-8.0));
        assert!((result.voltage().unwrap() - 13.1).abs() < 1e-9);
        assert_eq!(result.get(Field::Soc), Some(75.0));
        assert_eq!(result.temperature(), Some(25.5));
        assert_eq!(result.time_to_go(), Some(67500.0));
        assert_eq!(result.get(Field::AlarmLowVoltage), Some(0.0));
    }

    #[test]
    fn test_empty_fields_use_fallbacks() {
        let snapshot = DeviceSnapshot::default().with(Field::Current, 2.0);
        let mut estimator = RemainingTimeEstimator::new();
        let result = fuse(&[snapshot], &context(100.0), &mut estimator);

        assert_eq!(result.get(Field::Soc), Some(50.0));
        assert_eq!(result.voltage(), Some(0.0));
        assert_eq!(result.temperature(), None);
        assert_eq!(result.time_to_go(), None);
        assert_eq!(result.get(Field::Power), Some(0.0));
        assert_eq!(result.get(Field::ChargeCycles), Some(0.0));
        assert_eq!(result.get(Field::DeepestDischarge), Some(0.0));
        assert_eq!(result.get(Field::MinimumVoltage), None);
        assert_eq!(result.get(Field::TimeSinceLastFullCharge), None);
        assert_eq!(result.get(Field::MinimumStarterVoltage), None);
    }

    #[test]
    fn test_history_rules() {
        let a = DeviceSnapshot::default()
            .with(Field::ChargeCycles, 40.0)
            .with(Field::TotalAhDrawn, -1200.0)
            .with(Field::MinimumVoltage, 11.8)
            .with(Field::MaximumVoltage, 14.5)
            .with(Field::TimeSinceLastFullCharge, 3600.0)
            .with(Field::LowVoltageAlarms, 1.0)
            .with(Field::DeepestDischarge, -150.0)
            .with(Field::AverageDischarge, -40.0)
            .with(Field::HexChecksumErrors, 2.0);
        let b = DeviceSnapshot::default()
            .with(Field::ChargeCycles, 42.0)
            .with(Field::TotalAhDrawn, -1100.0)
            .with(Field::MinimumVoltage, 12.1)
            .with(Field::MaximumVoltage, 14.7)
            .with(Field::TimeSinceLastFullCharge, 7200.0)
            .with(Field::LowVoltageAlarms, 2.0)
            .with(Field::DeepestDischarge, -120.0)
            .with(Field::AverageDischarge, -60.0)
            .with(Field::HexChecksumErrors, 3.0);

        let mut estimator = RemainingTimeEstimator::new();
        let result = fuse(&[a, b], &context(400.0), &mut estimator);

        assert_eq!(result.get(Field::ChargeCycles), Some(42.0));
        assert_eq!(result.get(Field::TotalAhDrawn), Some(-2300.0));
        assert_eq!(result.get(Field::MinimumVoltage), Some(11.8));
        assert_eq!(result.get(Field::MaximumVoltage), Some(14.7));
        assert_eq!(result.get(Field::TimeSinceLastFullCharge), Some(7200.0));
        assert_eq!(result.get(Field::LowVoltageAlarms), Some(3.0));
        assert_eq!(result.get(Field::DeepestDischarge), Some(-150.0));
        assert_eq!(result.get(Field::AverageDischarge), Some(-50.0));
        assert_eq!(result.get(Field::HexChecksumErrors), Some(5.0));
    }

    #[test]
    fn test_low_voltage_alarm_reports_weakest_battery() {
        let a = DeviceSnapshot::default()
            .with(Field::Voltage, 11.4)
            .with(Field::AlarmLowVoltage, 2.0);
        let b = DeviceSnapshot::default()
            .with(Field::Voltage, 12.8)
            .with(Field::AlarmLowVoltage, 0.0);
        let mut estimator = RemainingTimeEstimator::new();
        let result = fuse(&[a, b], &context(200.0), &mut estimator);
        assert_eq!(result.voltage(), Some(11.4));
        assert_eq!(result.get(Field::AlarmLowVoltage), Some(2.0));
    }
}
