use crate::discovery::FoundDevice;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::sleep;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

/// Device configuration parameters stored in holding registers `0x1000..=0x1008`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigParam {
    Capacity,
    ChargedVoltage,
    TailCurrent,
    ChargedTime,
    ChargeEfficiency,
    PeukertExponent,
    CurrentThreshold,
    TimeToGoPeriod,
    DischargeFloor,
}

impl ConfigParam {
    pub const ALL: [ConfigParam; 9] = [
        ConfigParam::Capacity,
        ConfigParam::ChargedVoltage,
        ConfigParam::TailCurrent,
        ConfigParam::ChargedTime,
        ConfigParam::ChargeEfficiency,
        ConfigParam::PeukertExponent,
        ConfigParam::CurrentThreshold,
        ConfigParam::TimeToGoPeriod,
        ConfigParam::DischargeFloor,
    ];

    pub const fn register(self) -> u16 {
        0x1000 + self as u16
    }

    /// Multiplier from the raw register to the engineering unit.
    pub const fn scale(self) -> f64 {
        match self {
            ConfigParam::ChargedVoltage | ConfigParam::TailCurrent => 0.1,
            ConfigParam::PeukertExponent | ConfigParam::CurrentThreshold => 0.01,
            _ => 1.0,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ConfigParam::Capacity => "capacity",
            ConfigParam::ChargedVoltage => "charged_voltage",
            ConfigParam::TailCurrent => "tail_current",
            ConfigParam::ChargedTime => "charged_time",
            ConfigParam::ChargeEfficiency => "charge_efficiency",
            ConfigParam::PeukertExponent => "peukert_exponent",
            ConfigParam::CurrentThreshold => "current_threshold",
            ConfigParam::TimeToGoPeriod => "ttg_period",
            ConfigParam::DischargeFloor => "discharge_floor",
        }
    }
}

/// Scaled configuration of one device. Unreadable registers are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShuntConfig {
    values: BTreeMap<ConfigParam, f64>,
}

impl ShuntConfig {
    /// Builds the config from raw registers in [`ConfigParam::ALL`] order.
    pub fn from_registers(registers: &[Option<u16>]) -> Self {
        let values = ConfigParam::ALL
            .iter()
            .zip(registers)
            .filter_map(|(param, raw)| raw.map(|raw| (*param, f64::from(raw) * param.scale())))
            .collect();
        Self { values }
    }

    pub fn get(&self, param: ConfigParam) -> Option<f64> {
        self.values.get(&param).copied()
    }

    pub fn capacity_ah(&self) -> Option<f64> {
        self.get(ConfigParam::Capacity).filter(|capacity| *capacity > 0.0)
    }

    pub fn with(mut self, param: ConfigParam, value: f64) -> Self {
        self.values.insert(param, value);
        self
    }
}

/// Source of device-resident configuration.
pub trait CapacityReader: Send + Sync {
    fn read_config(&self, device: &FoundDevice) -> impl Future<Output = anyhow::Result<ShuntConfig>> + Send;
}

/// Reads the configuration registers through a Modbus TCP gateway.
pub struct ModbusConfigReader {
    target_address: SocketAddr,
}

impl ModbusConfigReader {
    pub fn new(target_address: SocketAddr) -> Self {
        Self { target_address }
    }

    /// Connects to the gateway for one unit, backing off 1 s then 2 s between attempts.
    async fn connect_with_retry(&self, unit_id: u8) -> anyhow::Result<client::Context> {
        const MAX_RETRIES: u32 = 3;

        let mut last_error = None;
        for attempt in 1..=MAX_RETRIES {
            debug!(
                "Connecting to {} unit {} (attempt {}/{})",
                self.target_address, unit_id, attempt, MAX_RETRIES
            );
            match tcp::connect_slave(self.target_address, Slave(unit_id)).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!("Connection attempt {} to {} failed: {}", attempt, self.target_address, e);
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        sleep(Duration::from_secs(1 << (attempt - 1))).await;
                    }
                }
            }
        }
        match last_error {
            Some(e) => Err(anyhow::Error::new(e).context(format!("connecting to {}", self.target_address))),
            None => anyhow::bail!("no connection attempt made"),
        }
    }
}

impl CapacityReader for ModbusConfigReader {
    async fn read_config(&self, device: &FoundDevice) -> anyhow::Result<ShuntConfig> {
        let Some(unit_id) = device.unit_id else {
            anyhow::bail!("{} has no Modbus unit id", device.address);
        };
        let mut connection = self.connect_with_retry(unit_id).await?;

        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        let mut registers = Vec::with_capacity(ConfigParam::ALL.len());
        for param in ConfigParam::ALL {
            let raw = match connection.read_holding_registers(param.register(), 1).await? {
                Ok(words) => words.first().copied(),
                Err(exception) => {
                    debug!(
                        "{}: register 0x{:04X} ({}) unreadable: {:?}",
                        device.name,
                        param.register(),
                        param.name(),
                        exception
                    );
                    None
                }
            };
            registers.push(raw);
        }

        let config = ShuntConfig::from_registers(&registers);
        info!(
            "{}: capacity {:?}Ah (from config register 0x{:04X})",
            device.name,
            config.capacity_ah(),
            ConfigParam::Capacity.register()
        );
        Ok(config)
    }
}
