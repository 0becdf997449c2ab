//! Project/phase topology input
//!
//! The project reference graph and the phase definitions come from an
//! external collaborator; the engine only consumes them through
//! [`TopologyProvider`]. [`StaticTopology`] is a plain in-memory (or YAML)
//! implementation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::operation::OperationSpec;

/// Dependency rules declared by a phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRule {
    /// "depends on the same project's phase X"
    #[serde(default)]
    pub self_dependencies: Vec<String>,
    /// "depends on every upstream project's phase Y"
    #[serde(default)]
    pub upstream_dependencies: Vec<String>,
}

impl PhaseRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after_self(mut self, phase: impl Into<String>) -> Self {
        self.self_dependencies.push(phase.into());
        self
    }

    pub fn after_upstream(mut self, phase: impl Into<String>) -> Self {
        self.upstream_dependencies.push(phase.into());
        self
    }
}

pub trait TopologyProvider {
    /// Every (project, phase) pair to schedule, in declaration order
    fn operations(&self) -> Vec<OperationSpec>;

    fn phase_rule(&self, phase: &str) -> Option<PhaseRule>;

    /// Projects `project` depends on, in declaration order
    fn upstream_projects(&self, project: &str) -> Vec<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticTopology {
    /// project -> upstream projects
    #[serde(default)]
    pub projects: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseRule>,
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn with_project<I, S>(mut self, name: impl Into<String>, upstream: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projects
            .insert(name.into(), upstream.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_phase(mut self, name: impl Into<String>, rule: PhaseRule) -> Self {
        self.phases.insert(name.into(), rule);
        self
    }

    pub fn with_operation(mut self, spec: OperationSpec) -> Self {
        self.operations.push(spec);
        self
    }

    /// Select every phase for every known project, projects in name order,
    /// phases in the order given.
    pub fn select_all(mut self, phases: &[&str]) -> Self {
        let projects: Vec<String> = self.projects.keys().cloned().collect();
        for project in &projects {
            for phase in phases {
                self.operations.push(OperationSpec::new(project.clone(), *phase));
            }
        }
        self
    }
}

impl TopologyProvider for StaticTopology {
    fn operations(&self) -> Vec<OperationSpec> {
        self.operations.clone()
    }

    fn phase_rule(&self, phase: &str) -> Option<PhaseRule> {
        self.phases.get(phase).cloned()
    }

    fn upstream_projects(&self, project: &str) -> Vec<String> {
        self.projects.get(project).cloned().unwrap_or_default()
    }
}
