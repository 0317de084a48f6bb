//! Stack configuration: which layers, in which order, with what settings.
//!
//! Layer settings stay opaque JSON until the layer's factory parses them
//! into its own typed struct at assembly time.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// One entry of a stack configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSpec {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl LayerSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: Value::Null,
        }
    }

    pub fn with_config(kind: impl Into<String>, config: Value) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }
}

/// Ordered layer list, top first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackConfig {
    pub layers: Vec<LayerSpec>,
}

impl StackConfig {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self { layers }
    }

    /// Parallelize, ErrorBounce, Failover, Retry, Invoke, all with default
    /// settings.
    pub fn default_stack() -> Self {
        Self::new(vec![
            LayerSpec::new("parallelize"),
            LayerSpec::new("errorbounce"),
            LayerSpec::new("failover"),
            LayerSpec::new("retry"),
            LayerSpec::new("invoke"),
        ])
    }

    /// Replace the settings of the first layer of `kind`. Returns `self`
    /// unchanged if there is none.
    pub fn configure(mut self, kind: &str, config: Value) -> Self {
        if let Some(spec) = self.layers.iter_mut().find(|l| l.kind == kind) {
            spec.config = config;
        }
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.kind.as_str()).collect()
    }
}

/// Parse a layer's settings. `null` means "all defaults".
pub fn parse_config<C>(layer: &str, config: &Value) -> Result<C, ConfigError>
where
    C: DeserializeOwned + Default,
{
    if config.is_null() {
        return Ok(C::default());
    }
    serde_json::from_value(config.clone()).map_err(|source| ConfigError::InvalidLayerConfig {
        layer: layer.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    struct Demo {
        limit: u32,
    }

    #[test]
    fn default_stack_order() {
        assert_eq!(
            StackConfig::default_stack().kinds(),
            vec!["parallelize", "errorbounce", "failover", "retry", "invoke"]
        );
    }

    #[test]
    fn stack_config_reads_json_list() {
        let config: StackConfig = serde_json::from_value(json!([
            {"kind": "parallelize", "config": {"max_jobs": 4}},
            {"kind": "invoke"}
        ]))
        .unwrap();
        assert_eq!(config.kinds(), vec!["parallelize", "invoke"]);
        assert_eq!(config.layers[0].config, json!({"max_jobs": 4}));
        assert!(config.layers[1].config.is_null());
    }

    #[test]
    fn configure_replaces_settings() {
        let config = StackConfig::default_stack().configure("retry", json!({"max_retries": 3}));
        assert_eq!(config.layers[3].config, json!({"max_retries": 3}));
    }

    #[test]
    fn null_config_is_default() {
        let demo: Demo = parse_config("demo", &Value::Null).unwrap();
        assert_eq!(demo, Demo::default());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = parse_config::<Demo>("demo", &json!({"limti": 3})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLayerConfig { ref layer, .. } if layer == "demo"));
    }
}
