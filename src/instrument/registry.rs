//! Driver registry.
//!
//! Maps a driver name from the configuration to a concrete [`CommandSet`].
//! Lookups happen once, while the bench is being assembled.

use super::commands::{CommandSet, GenericScpi, LoadScpi, ModularScpi};
use crate::error::{BenchError, BenchResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Name -> command set lookup table.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn CommandSet>>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in dialects (`generic`, `modular`, `eload`).
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GenericScpi));
        registry.register(Arc::new(ModularScpi));
        registry.register(Arc::new(LoadScpi));
        registry
    }

    /// Add (or replace) a dialect under its own name.
    pub fn register(&mut self, commands: Arc<dyn CommandSet>) {
        self.drivers.insert(commands.name().to_string(), commands);
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a driver name.
    pub fn resolve(&self, name: &str) -> BenchResult<Arc<dyn CommandSet>> {
        self.drivers.get(name).cloned().ok_or_else(|| {
            BenchError::Configuration(format!(
                "unknown driver '{}'. Must be one of: {}",
                name,
                self.names().join(", ")
            ))
        })
    }
}
