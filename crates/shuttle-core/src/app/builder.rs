//! WorkflowBuilder: declare ports, processors and links, then validate.
//!
//! Everything that can be checked statically is checked in `build`, so a
//! run never starts from a broken definition:
//! - names are unique (workflow ports, processors, ports of a processor)
//! - every link endpoint exists
//! - every processor input and workflow output has exactly one link
//! - processors form no cycle
//! - every processor has an activity and a stack that assembles
//!
//! ```ignore
//! let workflow = WorkflowBuilder::new("demo")
//!     .input("words", 1)
//!     .output("shout", 1)
//!     .processor(ProcessorDef::new("upper").input("in", 0).output("out", 0).activity(upper))
//!     .link(Source::input("words"), Sink::input("upper", "in"))
//!     .link(Source::output("upper", "out"), Sink::output("shout"))
//!     .build(&LayerRegistry::with_builtin())?;
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::dispatch::{LayerRegistry, StackConfig, StackTemplate};
use crate::domain::{PortSet, PortSpec};
use crate::error::ConfigError;
use crate::ports::Activity;

/// Where a link takes its tokens from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    WorkflowInput(String),
    ProcessorOutput { processor: String, port: String },
}

impl Source {
    pub fn input(port: impl Into<String>) -> Self {
        Source::WorkflowInput(port.into())
    }

    pub fn output(processor: impl Into<String>, port: impl Into<String>) -> Self {
        Source::ProcessorOutput {
            processor: processor.into(),
            port: port.into(),
        }
    }
}

/// Where a link delivers its tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sink {
    ProcessorInput { processor: String, port: String },
    WorkflowOutput(String),
}

impl Sink {
    pub fn input(processor: impl Into<String>, port: impl Into<String>) -> Self {
        Sink::ProcessorInput {
            processor: processor.into(),
            port: port.into(),
        }
    }

    pub fn output(port: impl Into<String>) -> Self {
        Sink::WorkflowOutput(port.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub from: Source,
    pub to: Sink,
}

/// Declaration of one processor.
#[derive(Clone)]
pub struct ProcessorDef {
    pub name: String,
    pub ports: PortSet,
    /// Alternatives in failover order; the first is the primary.
    pub activities: Vec<Arc<dyn Activity>>,
    pub stack: StackConfig,
}

impl ProcessorDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ports: PortSet::default(),
            activities: Vec::new(),
            stack: StackConfig::default_stack(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, depth: usize) -> Self {
        self.ports.inputs.push(PortSpec::new(name, depth));
        self
    }

    pub fn output(mut self, name: impl Into<String>, depth: usize) -> Self {
        self.ports.outputs.push(PortSpec::new(name, depth));
        self
    }

    pub fn activity(mut self, activity: Arc<dyn Activity>) -> Self {
        self.activities.push(activity);
        self
    }

    pub fn stack(mut self, stack: StackConfig) -> Self {
        self.stack = stack;
        self
    }
}

impl fmt::Debug for ProcessorDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let activities: Vec<&str> = self.activities.iter().map(|a| a.name()).collect();
        f.debug_struct("ProcessorDef")
            .field("name", &self.name)
            .field("ports", &self.ports)
            .field("activities", &activities)
            .field("stack", &self.stack.kinds())
            .finish()
    }
}

/// A processor whose stack configuration has been resolved.
#[derive(Debug, Clone)]
pub struct ProcessorPlan {
    pub def: ProcessorDef,
    pub template: StackTemplate,
}

/// Validated, immutable workflow. Cheap to share between runs.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    processors: Vec<ProcessorPlan>,
    links: Vec<Link>,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[PortSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortSpec] {
        &self.outputs
    }

    pub fn processors(&self) -> &[ProcessorPlan] {
        &self.processors
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Default)]
pub struct WorkflowBuilder {
    name: String,
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    processors: Vec<ProcessorDef>,
    links: Vec<Link>,
}

fn check_unique<'a>(kind: &'static str, names: impl IntoIterator<Item = &'a str>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn input(mut self, name: impl Into<String>, depth: usize) -> Self {
        self.inputs.push(PortSpec::new(name, depth));
        self
    }

    pub fn output(mut self, name: impl Into<String>, depth: usize) -> Self {
        self.outputs.push(PortSpec::new(name, depth));
        self
    }

    pub fn processor(mut self, processor: ProcessorDef) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn link(mut self, from: Source, to: Sink) -> Self {
        self.links.push(Link { from, to });
        self
    }

    pub fn build(self, registry: &LayerRegistry) -> Result<Workflow, ConfigError> {
        check_unique("workflow input", self.inputs.iter().map(|p| p.name.as_str()))?;
        check_unique("workflow output", self.outputs.iter().map(|p| p.name.as_str()))?;
        check_unique("processor", self.processors.iter().map(|p| p.name.as_str()))?;

        let by_name: HashMap<&str, &ProcessorDef> =
            self.processors.iter().map(|p| (p.name.as_str(), p)).collect();

        for processor in &self.processors {
            let ports = processor.ports.inputs.iter().chain(&processor.ports.outputs);
            check_unique("port", ports.map(|p| p.name.as_str()))?;
            if processor.activities.is_empty() {
                return Err(ConfigError::NoActivity(processor.name.clone()));
            }
        }

        let mut incoming: HashMap<&Sink, usize> = HashMap::new();
        for link in &self.links {
            self.check_source(&link.from, &by_name)?;
            self.check_sink(&link.to, &by_name)?;
            *incoming.entry(&link.to).or_default() += 1;
        }

        let required = self
            .processors
            .iter()
            .flat_map(|p| {
                p.ports
                    .inputs
                    .iter()
                    .map(|port| (format!("processor '{}'", p.name), Sink::input(&p.name, &port.name)))
            })
            .chain(
                self.outputs
                    .iter()
                    .map(|port| (format!("workflow '{}'", self.name), Sink::output(&port.name))),
            );
        for (owner, sink) in required {
            let port = match &sink {
                Sink::ProcessorInput { port, .. } | Sink::WorkflowOutput(port) => port.clone(),
            };
            match incoming.get(&sink).copied().unwrap_or(0) {
                0 => return Err(ConfigError::UnlinkedPort { owner, port }),
                1 => {}
                _ => return Err(ConfigError::MultipleLinks { owner, port }),
            }
        }

        self.check_acyclic()?;

        let processors = self
            .processors
            .into_iter()
            .map(|def| {
                let template = registry.prepare(&def.stack)?;
                Ok(ProcessorPlan { def, template })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Workflow {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            processors,
            links: self.links,
        })
    }

    fn check_source(&self, source: &Source, by_name: &HashMap<&str, &ProcessorDef>) -> Result<(), ConfigError> {
        match source {
            Source::WorkflowInput(port) => {
                if !self.inputs.iter().any(|p| &p.name == port) {
                    return Err(ConfigError::UnknownPort {
                        owner: format!("workflow '{}'", self.name),
                        port: port.clone(),
                    });
                }
            }
            Source::ProcessorOutput { processor, port } => {
                let def = by_name
                    .get(processor.as_str())
                    .ok_or_else(|| ConfigError::UnknownProcessor(processor.clone()))?;
                if def.ports.output(port).is_none() {
                    return Err(ConfigError::UnknownPort {
                        owner: format!("processor '{processor}'"),
                        port: port.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_sink(&self, sink: &Sink, by_name: &HashMap<&str, &ProcessorDef>) -> Result<(), ConfigError> {
        match sink {
            Sink::WorkflowOutput(port) => {
                if !self.outputs.iter().any(|p| &p.name == port) {
                    return Err(ConfigError::UnknownPort {
                        owner: format!("workflow '{}'", self.name),
                        port: port.clone(),
                    });
                }
            }
            Sink::ProcessorInput { processor, port } => {
                let def = by_name
                    .get(processor.as_str())
                    .ok_or_else(|| ConfigError::UnknownProcessor(processor.clone()))?;
                if def.ports.input(port).is_none() {
                    return Err(ConfigError::UnknownPort {
                        owner: format!("processor '{processor}'"),
                        port: port.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over processor-to-processor links.
    fn check_acyclic(&self) -> Result<(), ConfigError> {
        let mut indegree: BTreeMap<&str, usize> =
            self.processors.iter().map(|p| (p.name.as_str(), 0)).collect();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for link in &self.links {
            if let (
                Source::ProcessorOutput { processor: from, .. },
                Sink::ProcessorInput { processor: to, .. },
            ) = (&link.from, &link.to)
            {
                edges.entry(from.as_str()).or_default().push(to.as_str());
                *indegree.entry(to.as_str()).or_default() += 1;
            }
        }

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(name, _)| *name)
            .collect();
        while let Some(name) = ready.pop() {
            indegree.remove(name);
            for next in edges.get(name).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(next);
                    }
                }
            }
        }
        match indegree.keys().next() {
            Some(name) => Err(ConfigError::Cycle((*name).to_string())),
            None => Ok(()),
        }
    }
}
