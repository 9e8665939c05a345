//! Gateway configuration.
//!
//! Loaded from a TOML file, then overridden by command-line flags (which can
//! also come from `CARDGATE_*` environment variables). Everything is validated
//! before the gateway opens the serial link; a bad value is fatal.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::TextEncoding;
use crate::error::ConfigError;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "cardgate.toml";

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Parser, Debug, Default)]
#[command(name = "cardgate", version, about = "RFID reader serial gateway")]
pub struct Cli {
    /// Config file (TOML)
    #[arg(long, env = "CARDGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Serial device the reader is attached to
    #[arg(long, env = "CARDGATE_SERIAL_PORT")]
    pub serial_port: Option<String>,

    /// Baud rate of the reader
    #[arg(long, env = "CARDGATE_SERIAL_BAUDRATE")]
    pub serial_baudrate: Option<u32>,

    /// Encoding used on the wire (utf-8 or ascii)
    #[arg(long, env = "CARDGATE_SERIAL_ENCODING")]
    pub serial_encoding: Option<TextEncodingArg>,

    /// Last two hex digits of block0 accepted during breaks (repeatable)
    #[arg(long = "manufacturer-code", env = "CARDGATE_MANUFACTURER_CODES", value_delimiter = ',')]
    pub manufacturer_codes: Vec<String>,

    /// SQLite database path
    #[arg(long, env = "CARDGATE_DB")]
    pub db: Option<PathBuf>,

    /// Log filter (e.g. "info", "cardgate=debug")
    #[arg(long, env = "CARDGATE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// GPIO line wired to the reader's reset pin
    #[arg(long, env = "CARDGATE_RESET_PIN")]
    pub reset_pin: Option<u32>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the gateway (default)
    Run,
    /// Print the serial ports visible on this machine
    ListPorts,
}

/// Clap wrapper so `TextEncoding` parses via `FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEncodingArg(pub TextEncoding);

impl std::str::FromStr for TextEncodingArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(TextEncodingArg)
    }
}

// ---------------------------------------------------------------------------
// File configuration
// ---------------------------------------------------------------------------

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub interface: InterfaceConfig,
    /// Codes accepted by the fallback check, two hex digits each.
    pub manufacturer_codes: Vec<String>,
    pub gpio: GpioConfig,
    pub timing: TimingConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    pub port: String,
    pub baudrate: u32,
    pub encoding: TextEncoding,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub reset_pin: Option<u32>,
    pub base_path: Option<PathBuf>,
}

/// Periods and backoff bounds, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub frame_pause_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_step_ms: u64,
    pub reconnect_cap_ms: u64,
    pub settings_poll_ms: u64,
    pub reset_pulse_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub dir: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            interface: InterfaceConfig::default(),
            manufacturer_codes: vec!["18".to_string()],
            gpio: GpioConfig::default(),
            timing: TimingConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            port: "/dev/serial0".to_string(),
            baudrate: 115_200,
            encoding: TextEncoding::Utf8,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            frame_pause_ms: 100,
            reconnect_base_ms: 1000,
            reconnect_step_ms: 1000,
            reconnect_cap_ms: 24_000,
            settings_poll_ms: 2000,
            reset_pulse_ms: 1000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cardgate.db"),
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn frame_pause(&self) -> Duration {
        Duration::from_millis(self.frame_pause_ms)
    }

    pub fn settings_poll(&self) -> Duration {
        Duration::from_millis(self.settings_poll_ms)
    }

    pub fn reset_pulse(&self) -> Duration {
        Duration::from_millis(self.reset_pulse_ms)
    }
}

impl GatewayConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Resolve the effective configuration for a command line.
    ///
    /// An explicit `--config` must exist; the default file is optional.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                let content = std::fs::read_to_string(DEFAULT_CONFIG_FILE)?;
                toml::from_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = &cli.serial_port {
            self.interface.port = port.clone();
        }
        if let Some(baud) = cli.serial_baudrate {
            self.interface.baudrate = baud;
        }
        if let Some(TextEncodingArg(encoding)) = cli.serial_encoding {
            self.interface.encoding = encoding;
        }
        if !cli.manufacturer_codes.is_empty() {
            self.manufacturer_codes = cli.manufacturer_codes.clone();
        }
        if let Some(db) = &cli.db {
            self.store.path = db.clone();
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = Some(level.clone());
        }
        if let Some(pin) = cli.reset_pin {
            self.gpio.reset_pin = Some(pin);
        }
    }

    fn normalize(&mut self) {
        self.interface.port = self.interface.port.trim().to_string();
        for code in &mut self.manufacturer_codes {
            *code = code.trim().to_ascii_lowercase();
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.port.is_empty() {
            return Err(ConfigError::Invalid("interface.port is empty".into()));
        }
        if self.interface.baudrate == 0 {
            return Err(ConfigError::Invalid("interface.baudrate must be > 0".into()));
        }
        if self.manufacturer_codes.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one manufacturer code is required".into(),
            ));
        }
        for code in &self.manufacturer_codes {
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::Invalid(format!(
                    "manufacturer code {code:?} must be exactly two hex digits"
                )));
            }
        }
        let timing = &self.timing;
        if timing.reconnect_base_ms == 0 || timing.reconnect_cap_ms < timing.reconnect_base_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect backoff needs 0 < base ({}) <= cap ({})",
                timing.reconnect_base_ms, timing.reconnect_cap_ms
            )));
        }
        if timing.heartbeat_interval_ms == 0 || timing.settings_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat and settings poll intervals must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interface.port, "/dev/serial0");
        assert_eq!(config.interface.baudrate, 115_200);
        assert_eq!(config.manufacturer_codes, vec!["18"]);
    }

    #[test]
    fn test_from_toml_partial_file() {
        let config = GatewayConfig::from_toml(
            r#"
            manufacturer_codes = ["18", "2A"]

            [interface]
            port = "/dev/ttyUSB0"
            encoding = "ascii"

            [timing]
            heartbeat_interval_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.interface.port, "/dev/ttyUSB0");
        assert_eq!(config.interface.baudrate, 115_200);
        assert_eq!(config.interface.encoding, TextEncoding::Ascii);
        assert_eq!(config.manufacturer_codes, vec!["18", "2a"]);
        assert_eq!(config.timing.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.timing.reconnect_cap_ms, 24_000);
    }

    #[test]
    fn test_invalid_manufacturer_code_is_rejected() {
        let err = GatewayConfig::from_toml(r#"manufacturer_codes = ["1"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("two hex digits")));

        let err = GatewayConfig::from_toml(r#"manufacturer_codes = ["zz"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_empty_port_is_rejected() {
        let err = GatewayConfig::from_toml("[interface]\nport = \"  \"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("port")));
    }

    #[test]
    fn test_zero_baudrate_is_rejected() {
        let err = GatewayConfig::from_toml("[interface]\nbaudrate = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_encoding_is_a_parse_error() {
        let err = GatewayConfig::from_toml("[interface]\nencoding = \"latin-2\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_backoff_cap_below_base_is_rejected() {
        let err = GatewayConfig::from_toml(
            "[timing]\nreconnect_base_ms = 5000\nreconnect_cap_ms = 1000",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("backoff")));
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.toml");
        std::fs::write(&path, "[interface]\nport = \"/dev/ttyAMA0\"\nbaudrate = 9600\n").unwrap();

        let cli = Cli::parse_from([
            "cardgate",
            "--config",
            path.to_str().unwrap(),
            "--serial-baudrate",
            "57600",
            "--manufacturer-code",
            "1F,20",
            "--reset-pin",
            "2",
        ]);
        let config = GatewayConfig::load(&cli).unwrap();
        assert_eq!(config.interface.port, "/dev/ttyAMA0");
        assert_eq!(config.interface.baudrate, 57600);
        assert_eq!(config.manufacturer_codes, vec!["1f", "20"]);
        assert_eq!(config.gpio.reset_pin, Some(2));
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let cli = Cli::parse_from(["cardgate", "--config", "/nonexistent/cardgate.toml"]);
        assert!(matches!(GatewayConfig::load(&cli), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_list_ports_subcommand() {
        let cli = Cli::parse_from(["cardgate", "list-ports"]);
        assert_eq!(cli.command, Some(Command::ListPorts));
    }
}
