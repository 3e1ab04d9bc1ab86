//! Two-tier settings store used while an endpoint is being assembled.
//!
//! Explicit values always shadow defaults. Once [`SettingsHolder::prevent_changes`]
//! has been called, every mutation fails. [`SettingsHolder::clear`] drops every
//! value the holder owns, running their `Drop` implementations.

use std::{
    any::{Any, type_name},
    collections::HashMap,
    sync::Arc,
};

use tracing::debug;

use crate::error::{Error, Result};

type Value = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct SettingsHolder {
    overrides: HashMap<String, Value>,
    defaults: HashMap<String, Value>,
    locked: bool,
}

impl SettingsHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> Result<()> {
        self.ensure_unlocked()?;
        self.overrides.insert(key.into(), Arc::new(value));
        Ok(())
    }

    pub fn set_default<T: Any + Send + Sync>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<()> {
        self.ensure_unlocked()?;
        self.defaults.insert(key.into(), Arc::new(value));
        Ok(())
    }

    /// Explicit value if present, otherwise the default.
    pub fn try_get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.overrides
            .get(key)
            .or_else(|| self.defaults.get(key))
            .and_then(|value| (**value).downcast_ref::<T>())
    }

    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &str) -> Result<T> {
        let value = self
            .overrides
            .get(key)
            .or_else(|| self.defaults.get(key))
            .ok_or_else(|| Error::SettingNotFound { key: key.into() })?;
        (**value)
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Error::SettingTypeMismatch {
                key: key.into(),
                expected: type_name::<T>(),
            })
    }

    pub fn get_or_default<T: Any + Send + Sync + Clone + Default>(&self, key: &str) -> T {
        self.try_get::<T>(key).cloned().unwrap_or_default()
    }

    pub fn has_setting(&self, key: &str) -> bool {
        self.overrides.contains_key(key) || self.defaults.contains_key(key)
    }

    pub fn has_explicit_value(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Copy every value of `other` into this holder, keeping tiers apart.
    pub fn merge(&mut self, other: &SettingsHolder) -> Result<()> {
        self.ensure_unlocked()?;
        for (key, value) in &other.overrides {
            self.overrides.insert(key.clone(), Arc::clone(value));
        }
        for (key, value) in &other.defaults {
            self.defaults.insert(key.clone(), Arc::clone(value));
        }
        Ok(())
    }

    pub fn prevent_changes(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Release every held value, explicit and default alike.
    pub fn clear(&mut self) {
        let released = self.overrides.len() + self.defaults.len();
        self.overrides.clear();
        self.defaults.clear();
        debug!(released, "settings cleared");
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.locked {
            return Err(Error::SettingsLocked);
        }
        Ok(())
    }
}
