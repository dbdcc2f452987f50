use crate::error::ConfigError;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DEVICE_NAME: &str = "SmartShunt Aggregate";
pub const DEFAULT_SERVICE_NAME: &str = "com.victronenergy.battery.aggregate_shunts";

/// Static service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub device_name: String,
    pub service_name: String,
    pub bus_url: String,
    pub bus_token: String,
    pub config_modbus: SocketAddr,
    pub listen_address: SocketAddr,
    pub exclude: Vec<DeviceSelector>,
    pub search_trials: u32,
    pub read_trials: u32,
    pub time_before_restart: Duration,
    pub find_devices_interval: Duration,
    pub max_find_devices_interval: Duration,
    /// `None` disables the periodic status log.
    pub log_period: Option<Duration>,
    pub watch_interval: Duration,
    pub temp_cold_danger: f64,
    pub temp_hot_danger: f64,
    pub settings_path: PathBuf,
}

/// Entry of `EXCLUDE_DEVICES`: a device instance or a custom name.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSelector {
    Instance(u32),
    Name(String),
}

impl DeviceSelector {
    pub fn matches(&self, instance: Option<u32>, name: Option<&str>) -> bool {
        match self {
            DeviceSelector::Instance(id) => instance == Some(*id),
            DeviceSelector::Name(excluded) => name == Some(excluded.as_str()),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            bus_url: String::new(),
            bus_token: String::new(),
            config_modbus: SocketAddr::from(([127, 0, 0, 1], 502)),
            listen_address: SocketAddr::from(([0, 0, 0, 0], 5502)),
            exclude: Vec::new(),
            search_trials: 10,
            read_trials: 10,
            time_before_restart: Duration::from_secs(15),
            find_devices_interval: Duration::from_secs(1),
            max_find_devices_interval: Duration::from_secs(1800),
            log_period: Some(Duration::from_secs(300)),
            watch_interval: Duration::from_millis(1000),
            temp_cold_danger: 10.0,
            temp_hot_danger: 40.5,
            settings_path: PathBuf::from("shunt_aggregator_settings.json"),
        }
    }
}

impl Settings {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, collecting every error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();
        let defaults = Settings::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bus_url = get("BUS_URL").unwrap_or_else(|| {
            errors.push("BUS_URL is required".to_string());
            String::new()
        });
        let config_modbus = match get("CONFIG_MODBUS") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                errors.push(format!("CONFIG_MODBUS '{raw}' is not a socket address"));
                defaults.config_modbus
            }),
            None => {
                errors.push("CONFIG_MODBUS is required".to_string());
                defaults.config_modbus
            }
        };
        let listen_address = parse_or(&mut errors, "MODBUS_LISTEN", get("MODBUS_LISTEN"), defaults.listen_address);

        let search_trials = parse_or(&mut errors, "SEARCH_TRIALS", get("SEARCH_TRIALS"), defaults.search_trials);
        let read_trials = parse_or(&mut errors, "READ_TRIALS", get("READ_TRIALS"), defaults.read_trials);
        let restart_secs = parse_or(&mut errors, "TIME_BEFORE_RESTART", get("TIME_BEFORE_RESTART"), 15u64);
        let find_secs = parse_or(
            &mut errors,
            "UPDATE_INTERVAL_FIND_DEVICES",
            get("UPDATE_INTERVAL_FIND_DEVICES"),
            1u64,
        );
        let max_find_secs = parse_or(
            &mut errors,
            "MAX_UPDATE_INTERVAL_FIND_DEVICES",
            get("MAX_UPDATE_INTERVAL_FIND_DEVICES"),
            1800u64,
        );
        let log_secs = parse_or(&mut errors, "LOG_PERIOD", get("LOG_PERIOD"), 300u64);
        let watch_ms = parse_or(&mut errors, "WATCH_INTERVAL_MS", get("WATCH_INTERVAL_MS"), 1000u64);
        let temp_cold_danger = parse_or(
            &mut errors,
            "TEMP_COLD_DANGER",
            get("TEMP_COLD_DANGER"),
            defaults.temp_cold_danger,
        );
        let temp_hot_danger = parse_or(
            &mut errors,
            "TEMP_HOT_DANGER",
            get("TEMP_HOT_DANGER"),
            defaults.temp_hot_danger,
        );

        if search_trials < 1 {
            errors.push("SEARCH_TRIALS must be >= 1".to_string());
        }
        if read_trials < 1 {
            errors.push("READ_TRIALS must be >= 1".to_string());
        }
        if find_secs == 0 {
            errors.push("UPDATE_INTERVAL_FIND_DEVICES must be > 0".to_string());
        }
        if max_find_secs < find_secs {
            errors.push(format!(
                "MAX_UPDATE_INTERVAL_FIND_DEVICES ({max_find_secs}) must be >= UPDATE_INTERVAL_FIND_DEVICES ({find_secs})"
            ));
        }
        if watch_ms == 0 {
            errors.push("WATCH_INTERVAL_MS must be > 0".to_string());
        }
        if temp_cold_danger >= temp_hot_danger {
            errors.push(format!(
                "TEMP_COLD_DANGER ({temp_cold_danger}) must be below TEMP_HOT_DANGER ({temp_hot_danger})"
            ));
        }

        if !errors.is_empty() {
            return Err(ConfigError { errors });
        }

        Ok(Self {
            device_name: get("DEVICE_NAME").unwrap_or(defaults.device_name),
            service_name: get("SERVICE_NAME").unwrap_or(defaults.service_name),
            bus_url,
            bus_token: get("BUS_TOKEN").unwrap_or_default(),
            config_modbus,
            listen_address,
            exclude: parse_selector_list(get("EXCLUDE_DEVICES")),
            search_trials,
            read_trials,
            time_before_restart: Duration::from_secs(restart_secs),
            find_devices_interval: Duration::from_secs(find_secs),
            max_find_devices_interval: Duration::from_secs(max_find_secs),
            log_period: (log_secs > 0).then(|| Duration::from_secs(log_secs)),
            watch_interval: Duration::from_millis(watch_ms),
            temp_cold_danger,
            temp_hot_danger,
            settings_path: get("SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.settings_path),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    errors: &mut Vec<String>,
    key: &str,
    raw: Option<String>,
    default: T,
) -> T {
    match raw {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            errors.push(format!("invalid value '{raw}' for {key}"));
            default
        }),
        None => default,
    }
}

/// Parses a comma separated list of instances or names, tolerating quotes and blanks.
fn parse_selector_list(raw: Option<String>) -> Vec<DeviceSelector> {
    raw.unwrap_or_default()
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|item| !item.is_empty())
        .map(|item| match item.parse::<u32>() {
            Ok(instance) => DeviceSelector::Instance(instance),
            Err(_) => DeviceSelector::Name(item.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("BUS_URL", "http://venus.local:8080"),
        ("CONFIG_MODBUS", "192.168.1.20:502"),
    ];

    #[test]
    fn test_defaults_with_required_values() {
        let settings = Settings::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(settings.device_name, DEFAULT_DEVICE_NAME);
        assert_eq!(settings.bus_url, "http://venus.local:8080");
        assert_eq!(settings.config_modbus, "192.168.1.20:502".parse().unwrap());
        assert_eq!(settings.search_trials, 10);
        assert_eq!(settings.find_devices_interval, Duration::from_secs(1));
        assert_eq!(settings.max_find_devices_interval, Duration::from_secs(1800));
        assert_eq!(settings.log_period, Some(Duration::from_secs(300)));
        assert_eq!(settings.temp_cold_danger, 10.0);
        assert_eq!(settings.temp_hot_danger, 40.5);
        assert!(settings.exclude.is_empty());
    }

    #[test]
    fn test_missing_required_values_are_all_reported() {
        let err = Settings::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert!(err.errors.iter().any(|e| e.contains("BUS_URL")));
        assert!(err.errors.iter().any(|e| e.contains("CONFIG_MODBUS")));
    }

    #[test]
    fn test_invalid_numbers_and_ranges() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SEARCH_TRIALS", "ten"));
        pairs.push(("UPDATE_INTERVAL_FIND_DEVICES", "60"));
        pairs.push(("MAX_UPDATE_INTERVAL_FIND_DEVICES", "30"));
        pairs.push(("TEMP_COLD_DANGER", "45"));
        let err = Settings::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("'ten'")));
        assert!(err.errors.iter().any(|e| e.starts_with("MAX_UPDATE_INTERVAL_FIND_DEVICES")));
        assert!(err.errors.iter().any(|e| e.starts_with("TEMP_COLD_DANGER")));
    }

    #[test]
    fn test_log_period_zero_disables_logging() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("LOG_PERIOD", "0"));
        let settings = Settings::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(settings.log_period, None);
    }

    #[test]
    fn test_parse_selector_list() {
        assert!(parse_selector_list(None).is_empty());
        assert!(parse_selector_list(Some(" , ".into())).is_empty());
        assert_eq!(
            parse_selector_list(Some("277, 'House Bank',\"Starter\" ,12".into())),
            vec![
                DeviceSelector::Instance(277),
                DeviceSelector::Name("House Bank".into()),
                DeviceSelector::Name("Starter".into()),
                DeviceSelector::Instance(12),
            ]
        );
    }

    #[test]
    fn test_selector_matching() {
        assert!(DeviceSelector::Instance(277).matches(Some(277), None));
        assert!(!DeviceSelector::Instance(277).matches(Some(278), Some("277")));
        assert!(DeviceSelector::Name("Starter".into()).matches(Some(1), Some("Starter")));
        assert!(!DeviceSelector::Name("Starter".into()).matches(Some(1), None));
    }
}
