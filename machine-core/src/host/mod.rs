//! Host descriptors and their persistence
//!
//! A [`HostRecord`] is stored as `machines/<name>/config.json` below the
//! storage root. Stores run every loaded document through a
//! [`HostMigrator`] and write the upgraded form back.

mod migrate;
mod store;

pub use migrate::{step, HostMigrator, MigrationStep, SchemaMigrator};
pub use store::{open_host_store, FileHostStore, HostRecordStore, KvHostStore};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AuthOptions;

/// Schema version written by this crate
pub const CURRENT_CONFIG_VERSION: u32 = 3;

/// File name of a descriptor inside its machine directory
pub const CONFIG_FILE: &str = "config.json";

/// Pre-migration copy written next to the descriptor
pub const BACKUP_FILE: &str = "config.json.bak";

/// Provisioning options chosen at creation time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostOptions {
    pub driver: String,
    pub memory: u64,
    pub disk: u64,
    pub auth_options: AuthOptions,
}

/// Persisted descriptor of one machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostRecord {
    pub config_version: u32,
    /// Driver state, opaque to this crate
    pub driver: Value,
    pub driver_name: String,
    pub host_options: HostOptions,
    pub name: String,
}

impl Default for HostRecord {
    fn default() -> Self {
        Self {
            config_version: CURRENT_CONFIG_VERSION,
            driver: Value::Null,
            driver_name: String::new(),
            host_options: HostOptions::default(),
            name: String::new(),
        }
    }
}

impl HostRecord {
    pub fn new(name: impl Into<String>, driver_name: impl Into<String>, driver: Value) -> Self {
        let driver_name = driver_name.into();
        Self {
            driver,
            host_options: HostOptions {
                driver: driver_name.clone(),
                ..HostOptions::default()
            },
            driver_name,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_auth_options(mut self, auth: AuthOptions) -> Self {
        self.host_options.auth_options = auth;
        self
    }
}
