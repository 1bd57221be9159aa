//! Unit type registry
//!
//! Maps the `type` names used in pipeline definitions to factories that build
//! a unit from its settings. `sub_pipeline` and `batch` are resolved by the
//! definition loader itself because they reference other pipelines.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::unit::{ExecutionUnit, Settings};
use crate::units::{Delay, Fail, Passthrough, SetFields, SplitField};

/// Builds a unit from the settings block of its definition
pub type UnitFactory = Arc<dyn Fn(&Settings) -> Result<Arc<dyn ExecutionUnit>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct UnitRegistry {
    factories: HashMap<String, UnitFactory>,
}

impl UnitRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `passthrough`, `set_fields`, `split_field`,
    /// `delay` and `fail`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("passthrough", |_| Ok(Arc::new(Passthrough) as Arc<dyn ExecutionUnit>))
            .register("set_fields", |settings| {
                Ok(Arc::new(SetFields::from_settings(settings)?) as Arc<dyn ExecutionUnit>)
            })
            .register("split_field", |settings| {
                Ok(Arc::new(SplitField::from_settings(settings)?) as Arc<dyn ExecutionUnit>)
            })
            .register("delay", |settings| {
                Ok(Arc::new(Delay::from_settings(settings)?) as Arc<dyn ExecutionUnit>)
            })
            .register("fail", |settings| {
                Ok(Arc::new(Fail::from_settings(settings)?) as Arc<dyn ExecutionUnit>)
            });
        registry
    }

    /// Register a factory, replacing any previous one with the same name
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Settings) -> Result<Arc<dyn ExecutionUnit>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn create(&self, unit_type: &str, settings: &Settings) -> Result<Arc<dyn ExecutionUnit>> {
        let factory = self
            .factories
            .get(unit_type)
            .ok_or_else(|| PipelineError::UnknownUnitType(unit_type.to_string()))?;
        factory(settings)
    }

    pub fn contains(&self, unit_type: &str) -> bool {
        self.factories.contains_key(unit_type)
    }

    /// Registered type names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("types", &self.names())
            .finish()
    }
}
