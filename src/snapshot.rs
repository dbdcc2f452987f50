//! Per-device readings and the fused aggregate, keyed by a fixed catalogue of bus fields.
//!
//! Every field knows its bus path, how readings from several devices are combined, what is
//! published when no device reports it, and whether it is published as a count or a measurement.

use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

use crate::publisher::Value;

/// Raw `path -> value` map as returned by the bus for one device.
pub type DeviceValues = HashMap<String, JsonValue>;

/// How readings of one field from several devices become one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Sum,
    Min,
    Max,
    Average,
    /// Alarm flags: numeric maximum, no alarm when nothing reports.
    AnyAlarm,
}

/// Combination strategy of a field. Most fields use a plain [`Rule`]; voltage, temperature
/// and time-to-go are computed by the safety selectors and the remaining-time estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    Combine(Rule),
    SelectVoltage,
    SelectTemperature,
    EstimateRemainingTime,
}

/// Whether a field is published as an integer count or as a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Measurement,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Voltage,
    Current,
    Power,
    Temperature,
    Soc,
    ConsumedAmphours,
    TimeToGo,
    AlarmGeneral,
    AlarmLowVoltage,
    AlarmHighVoltage,
    AlarmLowSoc,
    AlarmHighTemperature,
    AlarmLowTemperature,
    ChargeCycles,
    TotalAhDrawn,
    MinimumVoltage,
    MaximumVoltage,
    TimeSinceLastFullCharge,
    AutomaticSyncs,
    LowVoltageAlarms,
    HighVoltageAlarms,
    LastDischarge,
    AverageDischarge,
    ChargedEnergy,
    DischargedEnergy,
    FullDischarges,
    DeepestDischarge,
    MinimumStarterVoltage,
    MaximumStarterVoltage,
    HexChecksumErrors,
    HexInvalidCharacterErrors,
    HexUnfinishedErrors,
    TextChecksumErrors,
    TextParseErrors,
    TextUnfinishedErrors,
}

impl Field {
    pub const ALL: [Field; 35] = [
        Field::Voltage,
        Field::Current,
        Field::Power,
        Field::Temperature,
        Field::Soc,
        Field::ConsumedAmphours,
        Field::TimeToGo,
        Field::AlarmGeneral,
        Field::AlarmLowVoltage,
        Field::AlarmHighVoltage,
        Field::AlarmLowSoc,
        Field::AlarmHighTemperature,
        Field::AlarmLowTemperature,
        Field::ChargeCycles,
        Field::TotalAhDrawn,
        Field::MinimumVoltage,
        Field::MaximumVoltage,
        Field::TimeSinceLastFullCharge,
        Field::AutomaticSyncs,
        Field::LowVoltageAlarms,
        Field::HighVoltageAlarms,
        Field::LastDischarge,
        Field::AverageDischarge,
        Field::ChargedEnergy,
        Field::DischargedEnergy,
        Field::FullDischarges,
        Field::DeepestDischarge,
        Field::MinimumStarterVoltage,
        Field::MaximumStarterVoltage,
        Field::HexChecksumErrors,
        Field::HexInvalidCharacterErrors,
        Field::HexUnfinishedErrors,
        Field::TextChecksumErrors,
        Field::TextParseErrors,
        Field::TextUnfinishedErrors,
    ];

    /// Fields whose change on a device triggers an aggregation pass.
    pub const WATCHED: [Field; 7] = [
        Field::Voltage,
        Field::Current,
        Field::Power,
        Field::Soc,
        Field::ConsumedAmphours,
        Field::TimeToGo,
        Field::Temperature,
    ];

    pub const fn path(self) -> &'static str {
        match self {
            Field::Voltage => "/Dc/0/Voltage",
            Field::Current => "/Dc/0/Current",
            Field::Power => "/Dc/0/Power",
            Field::Temperature => "/Dc/0/Temperature",
            Field::Soc => "/Soc",
            Field::ConsumedAmphours => "/ConsumedAmphours",
            Field::TimeToGo => "/TimeToGo",
            Field::AlarmGeneral => "/Alarms/Alarm",
            Field::AlarmLowVoltage => "/Alarms/LowVoltage",
            Field::AlarmHighVoltage => "/Alarms/HighVoltage",
            Field::AlarmLowSoc => "/Alarms/LowSoc",
            Field::AlarmHighTemperature => "/Alarms/HighTemperature",
            Field::AlarmLowTemperature => "/Alarms/LowTemperature",
            Field::ChargeCycles => "/History/ChargeCycles",
            Field::TotalAhDrawn => "/History/TotalAhDrawn",
            Field::MinimumVoltage => "/History/MinimumVoltage",
            Field::MaximumVoltage => "/History/MaximumVoltage",
            Field::TimeSinceLastFullCharge => "/History/TimeSinceLastFullCharge",
            Field::AutomaticSyncs => "/History/AutomaticSyncs",
            Field::LowVoltageAlarms => "/History/LowVoltageAlarms",
            Field::HighVoltageAlarms => "/History/HighVoltageAlarms",
            Field::LastDischarge => "/History/LastDischarge",
            Field::AverageDischarge => "/History/AverageDischarge",
            Field::ChargedEnergy => "/History/ChargedEnergy",
            Field::DischargedEnergy => "/History/DischargedEnergy",
            Field::FullDischarges => "/History/FullDischarges",
            Field::DeepestDischarge => "/History/DeepestDischarge",
            Field::MinimumStarterVoltage => "/History/MinimumStarterVoltage",
            Field::MaximumStarterVoltage => "/History/MaximumStarterVoltage",
            Field::HexChecksumErrors => "/VEDirect/HexChecksumErrors",
            Field::HexInvalidCharacterErrors => "/VEDirect/HexInvalidCharacterErrors",
            Field::HexUnfinishedErrors => "/VEDirect/HexUnfinishedErrors",
            Field::TextChecksumErrors => "/VEDirect/TextChecksumErrors",
            Field::TextParseErrors => "/VEDirect/TextParseError",
            Field::TextUnfinishedErrors => "/VEDirect/TextUnfinishedErrors",
        }
    }

    pub const fn rule(self) -> FieldRule {
        use FieldRule::Combine;
        match self {
            Field::Voltage => FieldRule::SelectVoltage,
            Field::Temperature => FieldRule::SelectTemperature,
            Field::TimeToGo => FieldRule::EstimateRemainingTime,
            Field::Current | Field::Power | Field::ConsumedAmphours => Combine(Rule::Sum),
            Field::Soc => Combine(Rule::Average),
            Field::AlarmGeneral
            | Field::AlarmLowVoltage
            | Field::AlarmHighVoltage
            | Field::AlarmLowSoc
            | Field::AlarmHighTemperature
            | Field::AlarmLowTemperature => Combine(Rule::AnyAlarm),
            Field::ChargeCycles | Field::FullDischarges | Field::AutomaticSyncs => Combine(Rule::Max),
            Field::TotalAhDrawn
            | Field::ChargedEnergy
            | Field::DischargedEnergy
            | Field::LastDischarge => Combine(Rule::Sum),
            Field::MinimumVoltage | Field::MinimumStarterVoltage => Combine(Rule::Min),
            Field::MaximumVoltage | Field::MaximumStarterVoltage => Combine(Rule::Max),
            // Longest elapsed time is the conservative answer.
            Field::TimeSinceLastFullCharge => Combine(Rule::Max),
            Field::LowVoltageAlarms | Field::HighVoltageAlarms => Combine(Rule::Sum),
            // Most negative is the deepest.
            Field::DeepestDischarge => Combine(Rule::Min),
            Field::AverageDischarge => Combine(Rule::Average),
            Field::HexChecksumErrors
            | Field::HexInvalidCharacterErrors
            | Field::HexUnfinishedErrors
            | Field::TextChecksumErrors
            | Field::TextParseErrors
            | Field::TextUnfinishedErrors => Combine(Rule::Sum),
        }
    }

    /// Value used when no included device reports the field and the rule yields nothing.
    pub const fn fallback(self) -> Option<f64> {
        match self {
            Field::Soc => Some(50.0),
            Field::ChargeCycles
            | Field::FullDischarges
            | Field::AutomaticSyncs
            | Field::DeepestDischarge
            | Field::AverageDischarge => Some(0.0),
            _ => None,
        }
    }

    pub const fn kind(self) -> Kind {
        match self {
            Field::AlarmGeneral
            | Field::AlarmLowVoltage
            | Field::AlarmHighVoltage
            | Field::AlarmLowSoc
            | Field::AlarmHighTemperature
            | Field::AlarmLowTemperature
            | Field::ChargeCycles
            | Field::AutomaticSyncs
            | Field::LowVoltageAlarms
            | Field::HighVoltageAlarms
            | Field::FullDischarges
            | Field::HexChecksumErrors
            | Field::HexInvalidCharacterErrors
            | Field::HexUnfinishedErrors
            | Field::TextChecksumErrors
            | Field::TextParseErrors
            | Field::TextUnfinishedErrors => Kind::Count,
            _ => Kind::Measurement,
        }
    }

    /// Starter-voltage extrema are only meaningful when the auxiliary input is wired.
    fn accepts(self, reading: f64) -> bool {
        match self {
            Field::MinimumStarterVoltage | Field::MaximumStarterVoltage => reading > 0.0,
            _ => reading.is_finite(),
        }
    }
}

/// Readings of one device at one instant. Absent readings are simply missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    readings: HashMap<Field, f64>,
}

impl DeviceSnapshot {
    /// Builds a snapshot from the raw bus values. Anything that is not a number
    /// (`null`, `[]`, strings) is treated as an absent reading.
    pub fn from_values(values: &DeviceValues) -> Self {
        let readings = Field::ALL
            .iter()
            .filter_map(|field| {
                let reading = values.get(field.path()).and_then(JsonValue::as_f64)?;
                field.accepts(reading).then_some((*field, reading))
            })
            .collect();
        Self { readings }
    }

    pub fn get(&self, field: Field) -> Option<f64> {
        self.readings.get(&field).copied()
    }

    pub fn with(mut self, field: Field, reading: f64) -> Self {
        self.readings.insert(field, reading);
        self
    }
}

/// The fused record of one aggregation pass. `None` values are published as empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateResult {
    values: BTreeMap<Field, Option<f64>>,
}

impl AggregateResult {
    pub fn set(&mut self, field: Field, value: Option<f64>) {
        self.values.insert(field, value);
    }

    pub fn get(&self, field: Field) -> Option<f64> {
        self.values.get(&field).copied().flatten()
    }

    pub fn voltage(&self) -> Option<f64> {
        self.get(Field::Voltage)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.get(Field::Temperature)
    }

    pub fn time_to_go(&self) -> Option<f64> {
        self.get(Field::TimeToGo)
    }

    /// All fields as publishable `path -> value` entries.
    pub fn to_entries(&self) -> Vec<(String, Value)> {
        self.values
            .iter()
            .map(|(field, value)| {
                let value = match (value, field.kind()) {
                    (None, _) => Value::Empty,
                    (Some(v), Kind::Count) => Value::Int(v.round() as i64),
                    (Some(v), Kind::Measurement) => Value::Float(*v),
                };
                (field.path().to_string(), value)
            })
            .collect()
    }
}
