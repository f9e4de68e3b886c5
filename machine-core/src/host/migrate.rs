use std::sync::Arc;

use machine_common::logging::{Component, Logger};
use serde_json::Value;

use super::{HostRecord, CURRENT_CONFIG_VERSION};
use crate::error::{MachineError, Result};

/// Upgrades raw descriptor bytes to the current schema.
///
/// Returns the decoded descriptor and whether any upgrade was applied.
pub trait HostMigrator: Send + Sync {
    fn migrate_host(&self, raw: &[u8]) -> Result<(HostRecord, bool)>;
}

/// One schema transformation from `from_version` to `from_version + 1`
pub trait MigrationStep: Send + Sync {
    fn from_version(&self) -> u32;

    fn migrate(&self, doc: Value) -> Result<Value>;
}

struct FnStep<F> {
    from_version: u32,
    apply: F,
}

impl<F> MigrationStep for FnStep<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    fn from_version(&self) -> u32 {
        self.from_version
    }

    fn migrate(&self, doc: Value) -> Result<Value> {
        (self.apply)(doc)
    }
}

/// Build a step from a closure
pub fn step<F>(from_version: u32, apply: F) -> Box<dyn MigrationStep>
where
    F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
{
    Box::new(FnStep {
        from_version,
        apply,
    })
}

/// Applies registered steps in version order on the JSON document.
///
/// The document's `ConfigVersion` (absent means 0) selects the first step;
/// each step must be followed by the one for the next version.
pub struct SchemaMigrator {
    target_version: u32,
    steps: Vec<Box<dyn MigrationStep>>,
    logger: Arc<Logger>,
}

impl SchemaMigrator {
    pub fn new(target_version: u32, logger: Arc<Logger>) -> Self {
        Self {
            target_version,
            steps: Vec::new(),
            logger: Arc::new(logger.with_component(Component::Migration)),
        }
    }

    /// Migrator for [`CURRENT_CONFIG_VERSION`] with no registered steps
    pub fn current(logger: Arc<Logger>) -> Self {
        Self::new(CURRENT_CONFIG_VERSION, logger)
    }

    pub fn with_step(mut self, step: Box<dyn MigrationStep>) -> Self {
        self.steps.push(step);
        self.steps.sort_by_key(|s| s.from_version());
        self
    }

    pub fn target_version(&self) -> u32 {
        self.target_version
    }

    fn step_for(&self, version: u32) -> Option<&dyn MigrationStep> {
        self.steps
            .iter()
            .find(|s| s.from_version() == version)
            .map(|s| s.as_ref())
    }
}

impl HostMigrator for SchemaMigrator {
    fn migrate_host(&self, raw: &[u8]) -> Result<(HostRecord, bool)> {
        let mut doc: Value = serde_json::from_slice(raw)?;
        if !doc.is_object() {
            return Err(MachineError::Migration(
                "descriptor is not a JSON object".to_string(),
            ));
        }

        let found = match doc.get("ConfigVersion") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| MachineError::Migration(format!("invalid ConfigVersion {v}")))?,
        };
        if found > self.target_version {
            return Err(MachineError::Migration(format!(
                "descriptor version {found} is newer than supported version {}",
                self.target_version
            )));
        }

        let mut version = found;
        while version < self.target_version {
            let step = self.step_for(version).ok_or_else(|| {
                MachineError::Migration(format!("no migration from version {version}"))
            })?;
            self.logger
                .debug(format!("Migrating descriptor from version {version}"));
            doc = step.migrate(doc)?;
            version += 1;
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("ConfigVersion".to_string(), Value::from(version));
            }
        }

        let host: HostRecord = serde_json::from_value(doc)?;
        Ok((host, found < self.target_version))
    }
}
