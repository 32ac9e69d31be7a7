use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_CONFIG_CANDIDATES: [&str; 2] =
    ["unit-updater.toml", "/etc/unit-updater/unit-updater.toml"];

pub const DEFAULT_BROADCAST_TIMEOUT_MS: i64 = 1_000;
pub const DEFAULT_BROADCAST_PORT: i64 = 5_800;
pub const DEFAULT_CONTROL_PORT: i64 = 5_801;
pub const DEFAULT_MAX_CONNECTIONS: i64 = 3;
pub const DEFAULT_POLL_INTERVAL_MS: i64 = 50;
pub const DEFAULT_ACK_PORT: i64 = 0;
pub const MINIMUM_TIMEOUT_MS: i64 = 1_000;
pub const MINIMUM_PORT: i64 = 1_024;
pub const MAXIMUM_PORT: i64 = 65_535;
pub const MINIMUM_CONNECTIONS: i64 = 1;
pub const MAXIMUM_POLL_INTERVAL_MS: i64 = 1_000;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub discovery: DiscoveryConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bind_host: String,
    pub broadcast_port: i64,
    pub timeout_ms: i64,
    pub poll_interval_ms: i64,
    /// Port the acknowledgement is sent to; `0` answers the sender's own port.
    pub ack_port: i64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_owned(),
            broadcast_port: DEFAULT_BROADCAST_PORT,
            timeout_ms: DEFAULT_BROADCAST_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ack_port: DEFAULT_ACK_PORT,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: i64,
    pub max_connections: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: DEFAULT_CONTROL_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub ofs_location: String,
    pub as_built_location: String,
    pub config_location: String,
    pub sdcard_location: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Defaults => f.write_str("built-in defaults"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub source: ConfigSource,
    /// One notice per value that was out of range and replaced by its default.
    pub adjustments: Vec<String>,
}

impl AppConfig {
    /// Resolves the config file from `--config <path>` or the default
    /// candidates, layers it over the defaults and applies the remaining
    /// `--section.key value` overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<LoadedConfig, ConfigError> {
        let (explicit_path, overrides) = split_config_arg(args)?;
        let path = match explicit_path {
            Some(path) => Some(path),
            None => DEFAULT_CONFIG_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.is_file()),
        };

        let mut root_value = defaults_value()?;
        let source = match path {
            Some(path) => {
                let file_value = read_toml(&path)?;
                merge_values(&mut root_value, file_value);
                ConfigSource::File(path)
            }
            None => ConfigSource::Defaults,
        };

        let mut config = apply_overrides_and_build(root_value, overrides)?;
        let adjustments = config.sanitize();

        Ok(LoadedConfig {
            config,
            source,
            adjustments,
        })
    }

    /// Replaces out-of-range values with their documented defaults.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut adjustments = Vec::new();

        if self.discovery.timeout_ms < MINIMUM_TIMEOUT_MS {
            adjustments.push(format!(
                "discovery.timeout_ms {} is below {MINIMUM_TIMEOUT_MS}; \
                 using {DEFAULT_BROADCAST_TIMEOUT_MS}",
                self.discovery.timeout_ms
            ));
            self.discovery.timeout_ms = DEFAULT_BROADCAST_TIMEOUT_MS;
        }

        if !(MINIMUM_PORT..=MAXIMUM_PORT).contains(&self.discovery.broadcast_port) {
            adjustments.push(format!(
                "discovery.broadcast_port {} is outside {MINIMUM_PORT}-{MAXIMUM_PORT}; \
                 using {DEFAULT_BROADCAST_PORT}",
                self.discovery.broadcast_port
            ));
            self.discovery.broadcast_port = DEFAULT_BROADCAST_PORT;
        }

        if !(1..=MAXIMUM_POLL_INTERVAL_MS).contains(&self.discovery.poll_interval_ms) {
            adjustments.push(format!(
                "discovery.poll_interval_ms {} is outside 1-{MAXIMUM_POLL_INTERVAL_MS}; \
                 using {DEFAULT_POLL_INTERVAL_MS}",
                self.discovery.poll_interval_ms
            ));
            self.discovery.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
        }

        if !(0..=MAXIMUM_PORT).contains(&self.discovery.ack_port) {
            adjustments.push(format!(
                "discovery.ack_port {} is outside 0-{MAXIMUM_PORT}; answering the sender's port",
                self.discovery.ack_port
            ));
            self.discovery.ack_port = DEFAULT_ACK_PORT;
        }

        if !(MINIMUM_PORT..=MAXIMUM_PORT).contains(&self.server.port) {
            adjustments.push(format!(
                "server.port {} is outside {MINIMUM_PORT}-{MAXIMUM_PORT}; \
                 using {DEFAULT_CONTROL_PORT}",
                self.server.port
            ));
            self.server.port = DEFAULT_CONTROL_PORT;
        }

        if self.server.max_connections < MINIMUM_CONNECTIONS {
            adjustments.push(format!(
                "server.max_connections {} is below {MINIMUM_CONNECTIONS}; \
                 using {DEFAULT_MAX_CONNECTIONS}",
                self.server.max_connections
            ));
            self.server.max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        adjustments
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    Defaults(toml::ser::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::Defaults(source) => write!(f, "failed to render default config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', \
                 expected '--config <path>' or '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn defaults_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::Defaults)
}

fn read_toml(path: &Path) -> Result<Value, ConfigError> {
    let toml_content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string_lossy().to_string(),
        source,
    })?;

    toml_content
        .parse()
        .map_err(|source| ConfigError::TomlParse {
            path: path.to_string_lossy().to_string(),
            source,
        })
}

fn apply_overrides_and_build(
    mut root_value: Value,
    overrides: Vec<(String, String)>,
) -> Result<AppConfig, ConfigError> {
    for (key_path, raw_value) in overrides {
        apply_override(&mut root_value, &key_path, &raw_value)?;
    }

    root_value.try_into().map_err(ConfigError::Deserialize)
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn split_config_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<(String, String)>), ConfigError> {
    let mut config_path = None;
    let mut overrides = Vec::new();

    for (key, value) in parse_cli_overrides(args)? {
        if key == "config" {
            config_path = Some(PathBuf::from(value));
        } else {
            overrides.push((key, value));
        }
    }

    Ok((config_path, overrides))
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let (final_key, sections) = parts.split_last().ok_or_else(unknown)?;
    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(*final_key))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
