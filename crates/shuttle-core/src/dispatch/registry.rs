//! Layer registry: layer kind name -> factory.
//!
//! Built once at startup, then used immutably to assemble stacks. Third
//! party layers plug in by registering their own factory under a new kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::config::{LayerSpec, StackConfig};
use super::layer::DispatchLayer;
use super::stack::StackLayers;
use super::{error_bounce, failover, invoke, parallelize, retry};
use crate::error::ConfigError;

/// Creates one fresh layer instance from its settings.
pub trait LayerFactory: Send + Sync {
    fn create(&self, config: &Value) -> Result<Arc<dyn DispatchLayer>, ConfigError>;
}

impl<F> LayerFactory for F
where
    F: Fn(&Value) -> Result<Arc<dyn DispatchLayer>, ConfigError> + Send + Sync,
{
    fn create(&self, config: &Value) -> Result<Arc<dyn DispatchLayer>, ConfigError> {
        self(config)
    }
}

#[derive(Default, Clone)]
pub struct LayerRegistry {
    factories: HashMap<String, Arc<dyn LayerFactory>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the five built-in layers.
    pub fn with_builtin() -> Self {
        let mut factories: HashMap<String, Arc<dyn LayerFactory>> = HashMap::new();
        factories.insert(parallelize::KIND.into(), Arc::new(parallelize::Parallelize::from_config));
        factories.insert(error_bounce::KIND.into(), Arc::new(error_bounce::ErrorBounce::from_config));
        factories.insert(failover::KIND.into(), Arc::new(failover::Failover::from_config));
        factories.insert(retry::KIND.into(), Arc::new(retry::Retry::from_config));
        factories.insert(invoke::KIND.into(), Arc::new(invoke::Invoke::from_config));
        Self { factories }
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: Arc<dyn LayerFactory>,
    ) -> Result<(), ConfigError> {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(ConfigError::DuplicateLayerKind(kind));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Resolve every layer of `config` and check that the stack assembles.
    /// The returned template creates fresh layers for each run.
    pub fn prepare(&self, config: &StackConfig) -> Result<StackTemplate, ConfigError> {
        let entries = config
            .layers
            .iter()
            .map(|spec| {
                let factory = self
                    .factories
                    .get(&spec.kind)
                    .ok_or_else(|| ConfigError::UnknownLayer(spec.kind.clone()))?;
                Ok((spec.clone(), Arc::clone(factory)))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let template = StackTemplate { entries };
        template.instantiate()?;
        Ok(template)
    }
}

impl fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("LayerRegistry").field("kinds", &kinds).finish()
    }
}

/// A validated stack configuration bound to its factories.
#[derive(Clone)]
pub struct StackTemplate {
    entries: Vec<(LayerSpec, Arc<dyn LayerFactory>)>,
}

impl StackTemplate {
    /// Fresh layer instances. Layer state is never shared between two
    /// stacks made from one template.
    pub fn instantiate(&self) -> Result<StackLayers, ConfigError> {
        let layers = self
            .entries
            .iter()
            .map(|(spec, factory)| factory.create(&spec.config))
            .collect::<Result<Vec<_>, _>>()?;
        StackLayers::new(layers)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.entries.iter().map(|(spec, _)| spec.kind.as_str()).collect()
    }
}

impl fmt::Debug for StackTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.kinds()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::PassThrough;
    use serde_json::json;

    #[test]
    fn builtin_registry_assembles_default_stack() {
        let registry = LayerRegistry::with_builtin();
        assert_eq!(registry.len(), 5);
        let template = registry.prepare(&StackConfig::default_stack()).unwrap();
        assert_eq!(
            template.instantiate().unwrap().kinds(),
            vec!["parallelize", "errorbounce", "failover", "retry", "invoke"]
        );
    }

    #[test]
    fn unknown_kind_fails_at_assembly() {
        let config = StackConfig::new(vec![LayerSpec::new("teleport"), LayerSpec::new("invoke")]);
        let err = LayerRegistry::with_builtin().prepare(&config).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLayer(ref k) if k == "teleport"));
    }

    #[test]
    fn bad_layer_settings_fail_at_assembly() {
        let config = StackConfig::default_stack().configure("parallelize", json!({"max_jobs": "many"}));
        let err = LayerRegistry::with_builtin().prepare(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLayerConfig { ref layer, .. } if layer == "parallelize"));
    }

    #[test]
    fn terminal_must_be_last() {
        let config = StackConfig::new(vec![LayerSpec::new("invoke"), LayerSpec::new("retry")]);
        let err = LayerRegistry::with_builtin().prepare(&config).unwrap_err();
        assert!(matches!(err, ConfigError::TerminalNotLast(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = LayerRegistry::with_builtin();
        let err = registry
            .register("retry", Arc::new(retry::Retry::from_config))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateLayerKind(ref k) if k == "retry"));
    }

    #[test]
    fn custom_layer_kinds_can_be_added() {
        let mut registry = LayerRegistry::with_builtin();
        registry
            .register(
                "passthrough",
                Arc::new(|_: &Value| -> Result<Arc<dyn DispatchLayer>, ConfigError> {
                    Ok(Arc::new(PassThrough))
                }),
            )
            .unwrap();
        let config = StackConfig::new(vec![LayerSpec::new("passthrough"), LayerSpec::new("invoke")]);
        assert_eq!(registry.prepare(&config).unwrap().kinds(), vec!["passthrough", "invoke"]);
    }

    #[test]
    fn instances_are_not_shared() {
        let template = LayerRegistry::with_builtin()
            .prepare(&StackConfig::default_stack())
            .unwrap();
        let a = template.instantiate().unwrap();
        let b = template.instantiate().unwrap();
        assert_eq!(a.kinds(), b.kinds());
        assert!(a.iter().zip(b.iter()).all(|(x, y)| !Arc::ptr_eq(x, y)));
    }
}
