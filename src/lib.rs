//! SmartShunt aggregator
//!
//! Discovers the battery monitors of a bank, fuses their readings into one virtual
//! battery monitor and serves the result as Modbus holding registers.

pub mod bank_config;
pub mod bus_gateway;
pub mod change_watcher;
pub mod combiner;
pub mod config_reader;
pub mod discovery;
pub mod error;
pub mod estimator;
pub mod inclusion;
pub mod orchestrator;
pub mod persistence;
pub mod publisher;
pub mod register_server;
pub mod selector;
pub mod settings;
pub mod snapshot;

// Re-export commonly used types for easier access
pub use bus_gateway::{DeviceBus, HttpGateway};
pub use config_reader::{CapacityReader, ModbusConfigReader};
pub use error::{ConfigError, FatalError};
pub use orchestrator::{Event, UpdateOrchestrator};
pub use publisher::PublishedStore;
pub use register_server::RegisterServer;
pub use settings::Settings;
