use crate::error::ProxyError;
use crate::request::DEFAULT_MAX_HEADER_SIZE;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_LISTEN_ADDR: &str = ":8080";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    /// Minimum level for this target; falls back to `LoggingConfig::level`.
    pub level: Option<LogLevel>,
}

impl LogTarget {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            output_type: LogOutputType::File,
            path: Some(path.into()),
            level: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Debug),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// `host:port` to listen on; an empty host means all interfaces.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Basic credentials as `username:password`.
    #[serde(default)]
    pub auth: Option<String>,
    /// Generate random credentials at startup, ignoring `auth`.
    #[serde(default)]
    pub gen_auth: bool,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_max_header_size() -> usize {
    DEFAULT_MAX_HEADER_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth: None,
            gen_auth: false,
            max_header_size: default_max_header_size(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Invalid configuration file {}: {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("Failed to serialize configuration: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Listen address in a form `TcpListener::bind` accepts: `":8080"`
    /// becomes `"0.0.0.0:8080"`.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        let port = self
            .listen_addr
            .rsplit_once(':')
            .map(|(_, port)| port)
            .ok_or_else(|| ProxyError::Config(format!("Listen address '{}' has no port", self.listen_addr)))?;
        port.parse::<u16>()
            .map_err(|_| ProxyError::Config(format!("Invalid port in listen address '{}'", self.listen_addr)))?;

        if let Some(auth) = &self.auth {
            if !auth.is_empty() && !auth.contains(':') {
                return Err(ProxyError::Config(
                    "Credentials must be given as username:password".to_string(),
                ));
            }
        }

        if self.max_header_size == 0 {
            return Err(ProxyError::Config("max_header_size must be greater than zero".to_string()));
        }

        Ok(())
    }
}
