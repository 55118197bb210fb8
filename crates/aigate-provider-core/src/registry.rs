//! Write-once table of filter constructors, built in one explicit
//! initialization pass and read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProviderError, ProviderResult};
use crate::filter::Filter;

pub type FilterFactory =
    Arc<dyn Fn(&str, &Value) -> ProviderResult<Box<dyn Filter>> + Send + Sync>;

/// A filter reference in a route definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

impl FilterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Value::Null,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("filter {0:?} is already registered")]
    Duplicate(String),
    #[error("filter {0:?} is not registered")]
    Unknown(String),
    #[error("filter {name:?} rejected its config: {source}")]
    Construct {
        name: String,
        #[source]
        source: ProviderError,
    },
}

#[derive(Default)]
pub struct FilterRegistryBuilder {
    factories: BTreeMap<String, FilterFactory>,
}

impl FilterRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&str, &Value) -> ProviderResult<Box<dyn Filter>> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    pub fn build(self) -> Arc<FilterRegistry> {
        Arc::new(FilterRegistry {
            factories: self.factories,
        })
    }
}

pub struct FilterRegistry {
    factories: BTreeMap<String, FilterFactory>,
}

impl FilterRegistry {
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds a fresh instance. Instances may hold per-stream state and are
    /// never shared between requests.
    pub fn create(&self, spec: &FilterSpec) -> Result<Box<dyn Filter>, RegistryError> {
        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| RegistryError::Unknown(spec.name.clone()))?;
        factory(&spec.name, &spec.config).map_err(|source| RegistryError::Construct {
            name: spec.name.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(String);

    impl Filter for Named {
        fn name(&self) -> &str {
            &self.0
        }
    }

    fn named(name: &str, _config: &Value) -> ProviderResult<Box<dyn Filter>> {
        Ok(Box::new(Named(name.to_string())))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut builder = FilterRegistryBuilder::new();
        builder.register("context", named).unwrap();
        let err = builder.register("context", named).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "context"));
    }

    #[test]
    fn create_builds_fresh_instances_and_reports_unknown() {
        let mut builder = FilterRegistryBuilder::new();
        builder.register("a", named).unwrap();
        builder
            .register("strict", |_: &str, config: &Value| {
                if config.is_null() {
                    Err(ProviderError::InvalidConfig("config required".into()))
                } else {
                    named("strict", config)
                }
            })
            .unwrap();
        let registry = builder.build();

        assert_eq!(registry.create(&FilterSpec::new("a")).unwrap().name(), "a");
        assert!(matches!(
            registry.create(&FilterSpec::new("missing")),
            Err(RegistryError::Unknown(_))
        ));
        assert!(matches!(
            registry.create(&FilterSpec::new("strict")),
            Err(RegistryError::Construct { .. })
        ));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "strict"]);
    }
}
