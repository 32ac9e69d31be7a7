use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }

    fn as_colored_str(self) -> &'static str {
        match self {
            Self::Error => "\x1b[31mERROR\x1b[0m",
            Self::Warn => "\x1b[33mWARN\x1b[0m",
            Self::Info => "\x1b[32mINFO\x1b[0m",
            Self::Debug => "\x1b[36mDEBUG\x1b[0m",
            Self::Verbose => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
        }
    }
}

impl LoggerConfig {
    pub fn from_logging_config(value: &config::LoggingConfig) -> Result<Self, String> {
        let min_level = LogLevel::from_config_value(&value.level).ok_or_else(|| {
            format!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                value.level
            )
        })?;

        Ok(Self {
            min_level,
            human_friendly: value.human_friendly,
        })
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Line logger shared by every thread of the agent.
pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn verbose(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Verbose, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let line = self.format_line(level, context, message, payload.as_ref());
        self.sink.write_line(&line);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    fn format_line(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let rendered_level = if self.config.human_friendly {
            level.as_colored_str()
        } else {
            level.as_str()
        };

        let current = thread::current();
        let thread_part = current.name().unwrap_or("unnamed");

        let context_part = match context {
            Some(ctx) if !ctx.is_empty() => format!(" [{ctx}]"),
            _ => String::new(),
        };

        let payload_part = match payload {
            Some(value) => format!(" payload={value}"),
            None => String::new(),
        };

        format!(
            "{timestamp} [{rendered_level}] ({thread_part}){context_part} {message}{payload_part}"
        )
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::{Arc, Mutex};

    use super::{LogLevel, LogSink, Logger, LoggerConfig};

    #[derive(Default)]
    pub struct MemorySink {
        lines: Mutex<Vec<String>>,
    }

    impl MemorySink {
        pub fn lines(&self) -> Vec<String> {
            self.lines.lock().expect("memory sink mutex poisoned").clone()
        }

        pub fn contains(&self, needle: &str) -> bool {
            self.lines().iter().any(|line| line.contains(needle))
        }
    }

    impl LogSink for MemorySink {
        fn write_line(&self, line: &str) {
            self.lines
                .lock()
                .expect("memory sink mutex poisoned")
                .push(line.to_owned());
        }
    }

    pub fn memory_logger() -> (Arc<Logger>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(
            LoggerConfig {
                min_level: LogLevel::Verbose,
                human_friendly: false,
            },
            sink.clone(),
        );
        (Arc::new(logger), sink)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    use super::testing::MemorySink;
    use super::{LogLevel, Logger, LoggerConfig};
    use crate::config::LoggingConfig;

    #[test]
    fn parses_config_levels_case_insensitively() {
        assert_eq!(LogLevel::from_config_value("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_config_value(" warn "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_config_value("verbose"), Some(LogLevel::Verbose));
        assert_eq!(LogLevel::from_config_value("loud"), None);
    }

    #[test]
    fn logger_config_rejects_unknown_level() {
        let error = LoggerConfig::from_logging_config(&LoggingConfig {
            level: "chatty".to_owned(),
            human_friendly: false,
        })
        .expect_err("unknown level should fail");
        assert!(error.contains("chatty"));
    }

    #[test]
    fn info_threshold_excludes_debug_logs() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(LoggerConfig::default(), sink.clone());

        logger.info(Some("tests::logger"), "info message");
        logger.debug(Some("tests::logger"), "debug message");

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[INFO]"));
        assert!(!sink.contains("debug message"));
    }

    #[test]
    fn line_carries_thread_context_and_payload() {
        let sink = Arc::new(MemorySink::default());
        let logger = Arc::new(Logger::with_sink(LoggerConfig::default(), sink.clone()));

        let worker_logger = Arc::clone(&logger);
        thread::Builder::new()
            .name("control-worker-7".to_owned())
            .spawn(move || {
                worker_logger.log(
                    LogLevel::Warn,
                    Some("tests::payload"),
                    "payload attached",
                    Some(json!({"connection_id": 7, "peer_addr": "10.0.0.2:4100"})),
                );
            })
            .expect("thread should spawn")
            .join()
            .expect("thread should finish");

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("20"));
        assert!(lines[0].contains("[WARN] (control-worker-7) [tests::payload]"));
        assert!(lines[0].contains("payload={\"connection_id\":7,\"peer_addr\":\"10.0.0.2:4100\"}"));
    }

    #[test]
    fn human_friendly_output_is_colored() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(
            LoggerConfig {
                min_level: LogLevel::Error,
                human_friendly: true,
            },
            sink.clone(),
        );

        logger.error(None, "boom");
        logger.warn(None, "ignored");

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\x1b[31mERROR\x1b[0m"));
    }
}
