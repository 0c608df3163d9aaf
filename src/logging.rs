use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde_json::json;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::panic::Location;
use std::sync::{Arc, Mutex};

const TARGET: &str = "relay_proxy";

/// Handle the proxy core logs through.
///
/// The server receives one at construction and hands a clone to every
/// connection it spawns. `LogSink::default()` forwards to the global `log`
/// logger and honors `log::max_level()`, so installing `env_logger` or
/// [`CustomLogger`] is enough for the default sink to produce output.
#[derive(Clone)]
pub struct LogSink {
    logger: Arc<dyn Log>,
}

impl LogSink {
    pub fn new(logger: Arc<dyn Log>) -> Self {
        Self { logger }
    }

    #[track_caller]
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Debug, args, Location::caller());
    }

    #[track_caller]
    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Info, args, Location::caller());
    }

    #[track_caller]
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Warn, args, Location::caller());
    }

    #[track_caller]
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Error, args, Location::caller());
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>, location: &'static Location<'static>) {
        let metadata = Metadata::builder().level(level).target(TARGET).build();
        if !self.logger.enabled(&metadata) {
            return;
        }
        self.logger.log(
            &Record::builder()
                .metadata(metadata)
                .args(args)
                .file_static(Some(location.file()))
                .line(Some(location.line()))
                .build(),
        );
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(Arc::new(GlobalLogger))
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

struct GlobalLogger;

impl Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level() && log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        log::logger().log(record);
    }

    fn flush(&self) {
        log::logger().flush();
    }
}

/// Logger writing text or JSON lines to stdout and/or append-mode files.
pub struct CustomLogger {
    filters: Vec<LevelFilter>,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, ProxyError> {
        let format = config.format.unwrap_or_default();
        let default_level = config.level.unwrap_or_default();
        let targets = config.targets.unwrap_or_else(|| {
            vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]
        });

        let mut filters = Vec::with_capacity(targets.len());
        let mut writers = Vec::with_capacity(targets.len());

        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or_else(|| {
                        ProxyError::Config("File output type requires path".to_string())
                    })?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            filters.push(target.level.unwrap_or(default_level).to_level_filter());
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self { filters, format, writers })
    }

    /// Installs the logger globally and raises `log::max_level()` to the most
    /// verbose target.
    pub fn init(config: LoggingConfig) -> Result<(), ProxyError> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level();
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| ProxyError::Config(format!("Logger already initialized: {}", e)))?;
        log::set_max_level(max_level);
        Ok(())
    }

    pub fn max_level(&self) -> LevelFilter {
        self.filters.iter().copied().max().unwrap_or(LevelFilter::Off)
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] [{}:{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            short_file(record.file().unwrap_or("unknown")),
            record.line().unwrap_or(0),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        let log_entry = json!({
            "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "level": record.level().to_string().to_lowercase(),
            "target": record.target(),
            "file": short_file(record.file().unwrap_or("unknown")),
            "line": record.line().unwrap_or(0),
            "message": record.args().to_string(),
        });
        log_entry.to_string()
    }
}

/// Final path element, so `src/conn.rs` logs as `conn.rs`.
fn short_file(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.filters.iter().any(|filter| metadata.level() <= *filter)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for (filter, writer) in self.filters.iter().zip(&self.writers) {
            if record.level() <= *filter {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

/// Installs `env_logger` when no structured logging is configured.
pub fn init_fallback(log_level: LogLevel, log_format: LogFormat) -> Result<(), ProxyError> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level.to_string()));

    if log_format == LogFormat::Json {
        builder.format(|buf, record| {
            let timestamp: DateTime<Utc> = Utc::now();
            let log_entry = json!({
                "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "file": short_file(record.file().unwrap_or("unknown")),
                "line": record.line().unwrap_or(0),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", log_entry)
        });
    }

    builder
        .try_init()
        .map_err(|e| ProxyError::Config(format!("Logger already initialized: {}", e)))
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, ProxyError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(ProxyError::Config(format!(
            "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, ProxyError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ProxyError::Config(format!(
            "Invalid log format: {}. Must be one of: text, json",
            s
        ))),
    }
}
