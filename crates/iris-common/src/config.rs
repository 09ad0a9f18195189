//! Configuration structures for the acquisition server.
//!
//! Supports TOML deserialization with defaults matching the IRIS sensor
//! installation (one `128+128` node, 10 ms fieldbus cycle).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Fieldbus session configuration.
    pub fieldbus: FieldbusConfig,

    /// Acquisition protocol configuration.
    pub acquisition: AcquisitionConfig,

    /// Sample file storage configuration.
    pub storage: StorageConfig,
}

/// Supported fieldbus master drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldbusDriver {
    /// Simulated master for testing without hardware.
    #[default]
    Simulated,
}

/// Fieldbus session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldbusConfig {
    /// Master driver.
    pub driver: FieldbusDriver,

    /// Network adapter name (e.g., "enp3s0").
    /// Must be explicitly configured for hardware drivers.
    pub adapter: Option<String>,

    /// Period of the cyclic process data exchange.
    #[serde(with = "humantime_serde")]
    pub exchange_period: Duration,

    /// Period of the slave health check.
    #[serde(with = "humantime_serde")]
    pub health_period: Duration,

    /// Receive timeout for one process data exchange.
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// Receive timeout of the exchange that primes outputs during startup.
    #[serde(with = "humantime_serde")]
    pub prime_timeout: Duration,

    /// Bound on the wait for SAFE_OP during startup.
    #[serde(with = "humantime_serde")]
    pub safe_op_timeout: Duration,

    /// Timeout of a single OP confirmation poll.
    #[serde(with = "humantime_serde")]
    pub op_check_timeout: Duration,

    /// Number of OP confirmation polls.
    pub op_check_attempts: u32,

    /// Expected network topology, one entry per position.
    pub slaves: Vec<SlaveSpec>,
}

impl Default for FieldbusConfig {
    fn default() -> Self {
        Self {
            driver: FieldbusDriver::Simulated,
            adapter: None,
            exchange_period: Duration::from_millis(10),
            health_period: Duration::from_millis(10),
            receive_timeout: Duration::from_millis(100),
            prime_timeout: Duration::from_millis(2),
            safe_op_timeout: Duration::from_millis(50),
            op_check_timeout: Duration::from_millis(50),
            op_check_attempts: 40,
            slaves: vec![SlaveSpec::iris()],
        }
    }
}

/// Expected identity of one network position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveSpec {
    /// Human-readable node name.
    pub name: String,
    /// Expected vendor id.
    pub vendor_id: u32,
    /// Expected product code.
    pub product_code: u32,
}

impl SlaveSpec {
    /// The IRIS `128+128` sensor node.
    #[must_use]
    pub fn iris() -> Self {
        Self {
            name: "128+128".into(),
            vendor_id: 0x79a,
            product_code: 0xdefe_d128,
        }
    }
}

/// Acquisition protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Status code marking a data frame.
    pub data_code: u8,

    /// Code signalling that the device finished sending a sample set.
    pub full_signal: u8,

    /// Value written to output byte 1 to request sampling.
    pub start_command: u8,

    /// Poll period of the measurement sequencer.
    #[serde(with = "humantime_serde")]
    pub sequencer_period: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            data_code: 22,
            full_signal: 33,
            start_command: 11,
            sequencer_period: Duration::from_millis(1),
        }
    }
}

/// Sample file storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory receiving sample files; created on first write.
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("samples"),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.fieldbus.exchange_period, Duration::from_millis(10));
        assert_eq!(config.fieldbus.receive_timeout, Duration::from_millis(100));
        assert_eq!(config.fieldbus.op_check_attempts, 40);
        assert_eq!(config.fieldbus.slaves, vec![SlaveSpec::iris()]);
        assert_eq!(config.acquisition.data_code, 22);
        assert_eq!(config.acquisition.full_signal, 33);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [fieldbus]
            adapter = "enp3s0"
            exchange_period = "5ms"
            safe_op_timeout = "100ms"

            [[fieldbus.slaves]]
            name = "probe"
            vendor_id = 0x79a
            product_code = 0xdefed128

            [acquisition]
            sequencer_period = "2ms"

            [storage]
            base_dir = "/var/lib/iris"
        "#;

        let config = ServiceConfig::from_toml(toml).unwrap();
        assert_eq!(config.fieldbus.adapter, Some("enp3s0".to_string()));
        assert_eq!(config.fieldbus.exchange_period, Duration::from_millis(5));
        assert_eq!(config.fieldbus.safe_op_timeout, Duration::from_millis(100));
        // Unset fields keep their defaults
        assert_eq!(config.fieldbus.health_period, Duration::from_millis(10));
        assert_eq!(config.fieldbus.slaves.len(), 1);
        assert_eq!(config.fieldbus.slaves[0].name, "probe");
        assert_eq!(config.fieldbus.slaves[0].product_code, 0xdefe_d128);
        assert_eq!(config.acquisition.sequencer_period, Duration::from_millis(2));
        assert_eq!(config.storage.base_dir, PathBuf::from("/var/lib/iris"));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = ServiceConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = ServiceConfig::from_toml(&toml).unwrap();
        assert_eq!(config.fieldbus.exchange_period, parsed.fieldbus.exchange_period);
        assert_eq!(config.fieldbus.slaves, parsed.fieldbus.slaves);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let toml = r#"
            [fieldbus]
            exchange_period = "soon"
        "#;
        assert!(ServiceConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_driver_name() {
        let driver: FieldbusDriver = serde_json::from_str("\"simulated\"").unwrap();
        assert_eq!(driver, FieldbusDriver::Simulated);
    }
}
