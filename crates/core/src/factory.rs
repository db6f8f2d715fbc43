//! Factory registry: factory key -> job reconstruction.
//!
//! Each job type registers exactly one factory under its stable key before
//! the manager starts. The table is read-only afterwards.

use std::collections::HashMap;

use tracing::debug;

use crate::data::Data;
use crate::error::{DataError, FactoryError};
use crate::job::Job;

/// Reconstruction function for one job type.
pub type JobFactory = Box<dyn Fn(&Data) -> Result<Box<dyn Job>, DataError> + Send + Sync>;

/// Registry of job factories keyed by factory key.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, JobFactory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Registering the same key twice is a programming
    /// error and is reported, not ignored.
    pub fn register<F>(&mut self, factory_key: impl Into<String>, factory: F) -> Result<(), FactoryError>
    where
        F: Fn(&Data) -> Result<Box<dyn Job>, DataError> + Send + Sync + 'static,
    {
        let factory_key = factory_key.into();
        if self.factories.contains_key(&factory_key) {
            return Err(FactoryError::DuplicateFactory(factory_key));
        }
        debug!(factory_key = %factory_key, "registered job factory");
        self.factories.insert(factory_key, Box::new(factory));
        Ok(())
    }

    /// Build a live job from its persisted form.
    pub fn instantiate(&self, factory_key: &str, data: &Data) -> Result<Box<dyn Job>, FactoryError> {
        let factory = self
            .factories
            .get(factory_key)
            .ok_or_else(|| FactoryError::MissingFactory(factory_key.to_string()))?;

        factory(data).map_err(|source| FactoryError::Reconstruct {
            factory_key: factory_key.to_string(),
            source,
        })
    }

    pub fn contains(&self, factory_key: &str) -> bool {
        self.factories.contains_key(factory_key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("FactoryRegistry").field("keys", &keys).finish()
    }
}
