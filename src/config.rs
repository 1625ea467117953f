use crate::model::TemperatureDefaults;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, path::PathBuf, sync::OnceLock, time::Duration};

/// Process configuration loaded from the environment at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Durable store location
    pub store: StoreConfig,

    /// Poll, debounce and timeout intervals
    pub timing: TimingConfig,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub database_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimingConfig {
    pub poll_interval: Duration,
    pub write_debounce: Duration,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    pub upload_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3000),
            write_debounce: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(2000),
            command_timeout: Duration::from_millis(8000),
            upload_timeout: Duration::from_millis(12000),
        }
    }
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// On first call, it loads and validates the configuration from environment
    /// variables. Subsequent calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        let store = StoreConfig::load()?;
        let timing = TimingConfig::load()?;

        Ok(Self { store, timing })
    }
}

impl StoreConfig {
    const DATABASE_FILE: &str = "ago_recipes.db";

    fn load() -> Result<Self> {
        let database_path = match env::var("DATABASE_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                let data_dir = Self::data_dir();
                std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;
                data_dir.join(Self::DATABASE_FILE)
            }
        };

        Ok(Self { database_path })
    }

    #[cfg(not(test))]
    fn data_dir() -> PathBuf {
        env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"))
    }

    #[cfg(test)]
    fn data_dir() -> PathBuf {
        env::temp_dir().join("ago-recipes-test")
    }
}

impl TimingConfig {
    fn load() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            poll_interval: millis_from_env("POLL_INTERVAL_MS", defaults.poll_interval)?,
            write_debounce: millis_from_env("WRITE_DEBOUNCE_MS", defaults.write_debounce)?,
            probe_timeout: millis_from_env("PROBE_TIMEOUT_MS", defaults.probe_timeout)?,
            command_timeout: millis_from_env("DEVICE_COMMAND_TIMEOUT_MS", defaults.command_timeout)?,
            upload_timeout: millis_from_env("UPLOAD_TIMEOUT_MS", defaults.upload_timeout)?,
        })
    }
}

fn millis_from_env(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(value) => parse_millis(name, &value),
        Err(_) => Ok(default),
    }
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .with_context(|| format!("failed to parse {name}: invalid format"))
}

// ============================================================================
// User settings
// ============================================================================

/// Default user settings, seeded into the store on first start.
pub const DEFAULT_SETTINGS: [(&str, &str); 10] = [
    ("ago_ip", "10.10.10.1"),
    ("ago_ssid", "AGO"),
    ("ago_password", "12345678"),
    ("ago_upload_endpoint", "/api/files/programs/custom"),
    ("ago_upload_field", "json"),
    ("default_min_temp", "18"),
    ("default_rated_temp", "20"),
    ("default_max_temp", "24"),
    ("export_folder", ""),
    ("auto_reconnect", "true"),
];

/// Identity of the target device's access point and HTTP surface.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DeviceAddress {
    pub ip: String,
    pub ssid: String,
    pub password: String,
}

impl Default for DeviceAddress {
    fn default() -> Self {
        Self {
            ip: default_setting("ago_ip").to_string(),
            ssid: default_setting("ago_ssid").to_string(),
            password: default_setting("ago_password").to_string(),
        }
    }
}

/// User settings as key/value pairs, with defaults for missing keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings {
    values: HashMap<String, String>,
}

fn default_setting(key: &str) -> &'static str {
    DEFAULT_SETTINGS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .unwrap_or_default()
}

impl Settings {
    pub fn from_rows(rows: HashMap<String, String>) -> Self {
        Self { values: rows }
    }

    /// Stored value, or the default when the key was never stored.
    pub fn get(&self, key: &str) -> &str {
        self.values
            .get(key)
            .map(String::as_str)
            .unwrap_or_else(|| default_setting(key))
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Stored value unless empty, in which case the default applies.
    fn non_empty(&self, key: &str) -> &str {
        match self.get(key) {
            "" => default_setting(key),
            value => value,
        }
    }

    pub fn device_address(&self) -> DeviceAddress {
        DeviceAddress {
            ip: self.non_empty("ago_ip").to_string(),
            ssid: self.non_empty("ago_ssid").to_string(),
            password: self.non_empty("ago_password").to_string(),
        }
    }

    pub fn auto_reconnect(&self) -> bool {
        self.get("auto_reconnect") == "true"
    }

    pub fn upload_endpoint(&self) -> &str {
        self.get("ago_upload_endpoint")
    }

    pub fn upload_field(&self) -> &str {
        self.get("ago_upload_field")
    }

    pub fn temperature_defaults(&self) -> TemperatureDefaults {
        let fallback = TemperatureDefaults::default();
        let parse = |key: &str, fallback: f64| self.get(key).trim().parse().unwrap_or(fallback);

        TemperatureDefaults {
            min: parse("default_min_temp", fallback.min),
            rated: parse("default_rated_temp", fallback.rated),
            max: parse("default_max_temp", fallback.max),
        }
    }
}
