use std::path::{Path, PathBuf};

use buildgraph_storage::OperationRef;
use serde::{Deserialize, Serialize};

/// Identity of a schedulable unit: one project's one phase
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    pub project: String,
    pub phase: String,
}

impl OperationKey {
    pub fn new(project: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            phase: phase.into(),
        }
    }

    pub fn to_storage_ref(&self) -> OperationRef {
        OperationRef::new(self.project.clone(), self.phase.clone())
    }
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.project, self.phase)
    }
}

/// Dense index of an operation inside its graph (declaration order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) usize);

impl OperationId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Requested (project, phase) pair as handed over by the topology provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub project: String,
    pub phase: String,
    /// False when the phase declares no command for this project
    #[serde(default = "default_true")]
    pub has_work: bool,
    /// False when the operation is outside the requested run scope
    #[serde(default = "default_true")]
    pub included: bool,
    /// False when the project opted out of the build cache for this phase
    #[serde(default = "default_true")]
    pub cacheable: bool,
    /// Cache restore destination
    #[serde(default)]
    pub project_folder: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl OperationSpec {
    pub fn new(project: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            phase: phase.into(),
            has_work: true,
            included: true,
            cacheable: true,
            project_folder: None,
        }
    }

    pub fn no_op(mut self) -> Self {
        self.has_work = false;
        self
    }

    pub fn excluded(mut self) -> Self {
        self.included = false;
        self
    }

    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn with_project_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.project_folder = Some(folder.into());
        self
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.project.clone(), self.phase.clone())
    }
}

/// A node of the operation graph. Immutable once the graph is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub(crate) id: OperationId,
    pub(crate) key: OperationKey,
    pub(crate) dependencies: Vec<OperationId>,
    pub(crate) dependents: Vec<OperationId>,
    pub(crate) has_work: bool,
    pub(crate) included: bool,
    pub(crate) cacheable: bool,
    pub(crate) project_folder: Option<PathBuf>,
    pub(crate) transitive_dependents: usize,
}

impl Operation {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    /// Upstream operations, in the order the phase rules declared them
    pub fn dependencies(&self) -> &[OperationId] {
        &self.dependencies
    }

    /// Downstream operations, in declaration order
    pub fn dependents(&self) -> &[OperationId] {
        &self.dependents
    }

    pub fn has_work(&self) -> bool {
        self.has_work
    }

    pub fn is_included(&self) -> bool {
        self.included
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn project_folder(&self) -> Option<&Path> {
        self.project_folder.as_deref()
    }

    /// Number of distinct operations downstream of this one (dispatch priority)
    pub fn transitive_dependents(&self) -> usize {
        self.transitive_dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = OperationKey::new("@acme/web", "_phase:build");
        assert_eq!(key.to_string(), "@acme/web (_phase:build)");
    }

    #[test]
    fn test_key_to_storage_ref() {
        let key = OperationKey::new("web", "build");
        let r = key.to_storage_ref();
        assert_eq!(r.project, "web");
        assert_eq!(r.phase, "build");
    }

    #[test]
    fn test_spec_builders() {
        let spec = OperationSpec::new("web", "lint").no_op().excluded().uncacheable();
        assert!(!spec.has_work);
        assert!(!spec.included);
        assert!(!spec.cacheable);
        assert_eq!(spec.key(), OperationKey::new("web", "lint"));
    }

    #[test]
    fn test_spec_deserialize_defaults() {
        let spec: OperationSpec = serde_yaml::from_str("project: web\nphase: build\n").unwrap();
        assert!(spec.has_work);
        assert!(spec.included);
        assert!(spec.cacheable);
        assert_eq!(spec.project_folder, None);
    }
}
