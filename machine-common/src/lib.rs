//! Machine Common
//!
//! Common utilities shared by the machine provisioning crates.
//!
//! This crate provides:
//! - Component-based structured logging with a per-logger scope
//! - Process identity helpers (current OS user)

pub mod logging;

pub use logging::{Component, LoggingConfig, Logger};

/// Process identity helpers
pub mod identity {
    /// Fallback used when the OS does not report a user name.
    pub const UNKNOWN_USER: &str = "unknown";

    /// Name of the user running this process, or `"unknown"`.
    pub fn current_username() -> String {
        let name = whoami::username();
        if name.trim().is_empty() {
            UNKNOWN_USER.to_string()
        } else {
            name
        }
    }
}
