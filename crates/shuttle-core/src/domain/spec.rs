//! Port declarations shared by workflows and processors.

use serde::{Deserialize, Serialize};

/// A named port and the collection depth it expects (0 = single value,
/// 1 = list, 2 = list of lists, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    #[serde(default)]
    pub depth: usize,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, depth: usize) -> Self {
        Self {
            name: name.into(),
            depth,
        }
    }
}

/// Input and output ports of one processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSet {
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
}

impl PortSet {
    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }
}
