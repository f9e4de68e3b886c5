// Logging utilities for the machine provisioning core
//
// This module provides a small structured logging layer on top of the `log`
// facade:
// - Component-based prefixes (Storage, Kv, Certs, ...)
// - A scope carried by every logger (usually the machine name)
// - Child loggers that remember their parent component

use log::{debug, info, warn, LevelFilter};
use std::fmt::{self, Display, Formatter};

/// Predefined components for logging categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    System,
    Storage,
    Kv,
    Certs,
    RemoteCa,
    Ssh,
    Hosts,
    Migration,
    Custom(&'static str),
}

impl Component {
    /// Get the string representation of the component
    pub fn as_str(&self) -> &str {
        match self {
            Component::System => "System",
            Component::Storage => "Storage",
            Component::Kv => "KV",
            Component::Certs => "Certs",
            Component::RemoteCa => "RemoteCA",
            Component::Ssh => "SSH",
            Component::Hosts => "Hosts",
            Component::Migration => "Migration",
            Component::Custom(name) => name,
        }
    }
}

// Avoids building the prefix String on every call
struct ComponentPrefixDisplay {
    parent: Option<Component>,
    component: Component,
}

impl Display for ComponentPrefixDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) if parent != Component::System => {
                write!(f, "{}.{}", parent.as_str(), self.component.as_str())
            }
            _ => write!(f, "{}", self.component.as_str()),
        }
    }
}

/// A component-specific logger carrying a scope for correlation
#[derive(Debug, Clone)]
pub struct Logger {
    /// Component this logger is for
    component: Component,
    /// Scope shown in every line, e.g. a machine name
    scope: String,
    /// Parent component for hierarchical logging (if any)
    parent_component: Option<Component>,
}

impl Logger {
    /// Create a new root logger for a specific component and scope
    pub fn new_root(component: Component, scope: &str) -> Self {
        Self {
            component,
            scope: scope.to_string(),
            parent_component: None,
        }
    }

    /// Create a child logger with the same scope but a different component
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            scope: self.scope.clone(),
            parent_component: Some(self.component),
        }
    }

    /// Create a logger with the same components but a different scope
    pub fn with_scope(&self, scope: impl Into<String>) -> Self {
        Self {
            component: self.component,
            scope: scope.into(),
            parent_component: self.parent_component,
        }
    }

    /// Get a reference to the scope
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Get the component of this logger
    pub fn component(&self) -> Component {
        self.component
    }

    fn prefix(&self) -> ComponentPrefixDisplay {
        ComponentPrefixDisplay {
            parent: self.parent_component,
            component: self.component,
        }
    }

    /// Log a debug message
    pub fn debug(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Debug) {
            debug!("[{}][{}] {}", self.scope, self.prefix(), message.into());
        }
    }

    /// Log an info message
    pub fn info(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Info) {
            info!("[{}][{}] {}", self.scope, self.prefix(), message.into());
        }
    }

    /// Log a warning message
    pub fn warn(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Warn) {
            warn!("[{}][{}] {}", self.scope, self.prefix(), message.into());
        }
    }
}

/// Log levels accepted by [`LoggingConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Off,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Installs `env_logger` for binaries and tests
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub is_test: bool,
}

impl LoggingConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            is_test: false,
        }
    }

    /// Debug level with output captured by the test harness
    pub fn for_tests() -> Self {
        Self {
            level: LogLevel::Debug,
            is_test: true,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Install the global logger. Safe to call more than once; only the
    /// first call takes effect. `RUST_LOG` still overrides the level.
    pub fn init(&self) {
        let _ = env_logger::Builder::new()
            .filter_level(self.level.into())
            .parse_default_env()
            .is_test(self.is_test)
            .try_init();
    }
}
