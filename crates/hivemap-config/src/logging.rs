//! Structured logging utilities for hivemap components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use hivemap_config::{log_view_debug, log_notify_warn};
//!
//! log_view_debug!("Evicting view", offset = 4096u64);
//! log_notify_warn!("Delivery worker gone", pending = 3usize);
//! ```

use std::str::FromStr;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const VIEW: &'static str = "VIEW";
    pub const PIN: &'static str = "PIN";
    pub const HOST: &'static str = "HOST";
    pub const NOTIFY: &'static str = "NOTIFY";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

// === VIEW logging macros ===

#[macro_export]
macro_rules! log_view_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "VIEW", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_view_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "VIEW", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_view_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = "VIEW", $($key = $value,)* $msg)
    };
}

// === PIN logging macros ===

#[macro_export]
macro_rules! log_pin_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "PIN", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_pin_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "PIN", $($key = $value,)* $msg)
    };
}

// === HOST logging macros ===

#[macro_export]
macro_rules! log_host_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "HOST", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_host_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "HOST", $($key = $value,)* $msg)
    };
}

// === NOTIFY logging macros ===

#[macro_export]
macro_rules! log_notify_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "NOTIFY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_notify_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "NOTIFY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_notify_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = "NOTIFY", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `RUST_LOG` wins when set.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::VIEW, "VIEW");
        assert_eq!(Component::NOTIFY, "NOTIFY");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_macros_expand() {
        crate::log_view_debug!("view mapped", offset = 0u64, len = 4096u32);
        crate::log_notify_trace!("no subscribers");
    }
}
