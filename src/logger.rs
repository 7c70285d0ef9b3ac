//! Stderr logger for the host and client.
//!
//! The host runs as a co-process whose stderr is inherited by whatever
//! spawned it, so all diagnostics go to stderr as timestamped, level-tagged
//! lines. The minimum level is read once from `MLX_HOST_LOG`.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    fn from_env() -> Level {
        match std::env::var("MLX_HOST_LOG").as_deref() {
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }
}

pub struct Logger {
    min_level: Level,
    // Serializes writes so concurrent tasks don't interleave lines.
    sink: Mutex<()>,
}

impl Logger {
    fn new() -> Self {
        Logger {
            min_level: Level::from_env(),
            sink: Mutex::new(()),
        }
    }

    pub fn log(&self, level: Level, tag: &str, message: &str) {
        if level < self.min_level {
            return;
        }
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _guard = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        eprintln!("[{}] [{}] [{}] {}", timestamp, level.as_str(), tag, message);
    }

    pub fn debug(&self, tag: &str, message: &str) {
        self.log(Level::Debug, tag, message);
    }

    pub fn info(&self, tag: &str, message: &str) {
        self.log(Level::Info, tag, message);
    }

    pub fn warn(&self, tag: &str, message: &str) {
        self.log(Level::Warn, tag, message);
    }

    pub fn error(&self, tag: &str, message: &str) {
        self.log(Level::Error, tag, message);
    }
}

// Global logger instance
lazy_static::lazy_static! {
    pub static ref LOGGER: Logger = Logger::new();
}

// Convenience macros - component tag as first parameter
#[macro_export]
macro_rules! log_debug {
    ($tag:expr, $($arg:tt)*) => {
        $crate::logger::LOGGER.debug($tag, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_info {
    ($tag:expr, $($arg:tt)*) => {
        $crate::logger::LOGGER.info($tag, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($tag:expr, $($arg:tt)*) => {
        $crate::logger::LOGGER.warn($tag, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_error {
    ($tag:expr, $($arg:tt)*) => {
        $crate::logger::LOGGER.error($tag, &format!($($arg)*));
    };
}
