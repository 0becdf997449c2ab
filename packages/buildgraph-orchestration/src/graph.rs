use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::operation::{Operation, OperationId, OperationKey, OperationSpec};
use crate::topology::{PhaseRule, TopologyProvider};

/// Directed acyclic graph of operations with symmetric dependency/dependent edges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationGraph {
    operations: Vec<Operation>,
    index: HashMap<OperationKey, OperationId>,
    levels: Vec<Vec<OperationId>>, // Vec of parallel groups
}

impl OperationGraph {
    /// Build the graph for every (project, phase) pair the provider yields.
    ///
    /// Fails with `CycleDetected` (carrying the shortest cycle found) and never
    /// returns a partially built graph.
    pub fn build<T: TopologyProvider + ?Sized>(topology: &T) -> Result<Self> {
        let specs = topology.operations();

        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.key(), OperationId(i)).is_some() {
                return Err(OperationGraph::duplicate(spec));
            }
        }

        let dependencies = Self::resolve_dependencies(topology, &specs, &index);

        let mut dependents: Vec<Vec<OperationId>> = vec![Vec::new(); specs.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for dep in deps {
                dependents[dep.0].push(OperationId(i));
            }
        }

        let levels = Self::topological_levels(&specs, &dependencies, &dependents)?;
        let transitive = Self::count_transitive_dependents(&dependents);

        let operations = specs
            .into_iter()
            .zip(dependencies)
            .zip(dependents)
            .zip(transitive)
            .enumerate()
            .map(|(i, (((spec, dependencies), dependents), transitive_dependents))| Operation {
                id: OperationId(i),
                key: OperationKey::new(spec.project, spec.phase),
                dependencies,
                dependents,
                has_work: spec.has_work,
                included: spec.included,
                cacheable: spec.cacheable,
                project_folder: spec.project_folder,
                transitive_dependents,
            })
            .collect::<Vec<_>>();

        debug!(
            operations = operations.len(),
            levels = levels.len(),
            "Built operation graph"
        );

        Ok(Self {
            operations,
            index,
            levels,
        })
    }

    fn resolve_dependencies<T: TopologyProvider + ?Sized>(
        topology: &T,
        specs: &[OperationSpec],
        index: &HashMap<OperationKey, OperationId>,
    ) -> Vec<Vec<OperationId>> {
        let mut rules: HashMap<&str, PhaseRule> = HashMap::new();
        let mut dependencies: Vec<Vec<OperationId>> = Vec::with_capacity(specs.len());
        for spec in specs {
            let rule = rules
                .entry(spec.phase.as_str())
                .or_insert_with(|| topology.phase_rule(&spec.phase).unwrap_or_default());

            let mut seen = HashSet::new();
            let mut deps = Vec::new();
            let mut push = |key: OperationKey| {
                // Pairs outside the requested set are not scheduled, so not waited on
                if let Some(&id) = index.get(&key) {
                    if seen.insert(id) {
                        deps.push(id);
                    }
                }
            };

            for phase in &rule.self_dependencies {
                push(OperationKey::new(spec.project.clone(), phase.clone()));
            }
            if !rule.upstream_dependencies.is_empty() {
                for upstream in topology.upstream_projects(&spec.project) {
                    for phase in &rule.upstream_dependencies {
                        push(OperationKey::new(upstream.clone(), phase.clone()));
                    }
                }
            }
            dependencies.push(deps);
        }
        dependencies
    }

    fn duplicate(spec: &OperationSpec) -> OrchestratorError {
        OrchestratorError::DuplicateOperation(spec.key().to_string())
    }

    /// Kahn's algorithm with parallel group detection
    fn topological_levels(
        specs: &[OperationSpec],
        dependencies: &[Vec<OperationId>],
        dependents: &[Vec<OperationId>],
    ) -> Result<Vec<Vec<OperationId>>> {
        let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut current: Vec<OperationId> = (0..specs.len())
            .filter(|&i| in_degree[i] == 0)
            .map(OperationId)
            .collect();

        let mut levels = Vec::new();
        let mut processed = 0;
        while !current.is_empty() {
            processed += current.len();
            let mut next = Vec::new();
            for id in &current {
                for dependent in &dependents[id.0] {
                    in_degree[dependent.0] -= 1;
                    if in_degree[dependent.0] == 0 {
                        next.push(*dependent);
                    }
                }
            }
            next.sort();
            levels.push(std::mem::replace(&mut current, next));
        }

        if processed < specs.len() {
            let remaining: Vec<usize> = (0..specs.len()).filter(|&i| in_degree[i] > 0).collect();
            let cycle = Self::shortest_cycle(&remaining, dependencies);
            let path = cycle
                .into_iter()
                .map(|i| specs[i].key().to_string())
                .collect();
            return Err(OrchestratorError::CycleDetected { path });
        }

        Ok(levels)
    }

    /// Shortest dependency cycle among the nodes Kahn could not drain.
    /// The returned path starts and ends on the same node.
    fn shortest_cycle(remaining: &[usize], dependencies: &[Vec<OperationId>]) -> Vec<usize> {
        let in_cycle_region: HashSet<usize> = remaining.iter().copied().collect();
        let mut best: Option<Vec<usize>> = None;

        for &start in remaining {
            let mut parent: HashMap<usize, usize> = HashMap::new();
            let mut queue = VecDeque::from([start]);
            let mut closing = None;

            'bfs: while let Some(node) = queue.pop_front() {
                for dep in &dependencies[node] {
                    let dep = dep.0;
                    if !in_cycle_region.contains(&dep) {
                        continue;
                    }
                    if dep == start {
                        closing = Some(node);
                        break 'bfs;
                    }
                    if !parent.contains_key(&dep) {
                        parent.insert(dep, node);
                        queue.push_back(dep);
                    }
                }
            }

            if let Some(last) = closing {
                let mut path = vec![last];
                let mut node = last;
                while node != start {
                    node = parent[&node];
                    path.push(node);
                }
                path.reverse();
                path.push(start);

                if best.as_ref().map_or(true, |b| path.len() < b.len()) {
                    best = Some(path);
                }
            }
        }

        best.unwrap_or_else(|| remaining.to_vec())
    }

    fn count_transitive_dependents(dependents: &[Vec<OperationId>]) -> Vec<usize> {
        (0..dependents.len())
            .map(|start| {
                let mut seen = HashSet::new();
                let mut stack: Vec<usize> = dependents[start].iter().map(|d| d.0).collect();
                while let Some(node) = stack.pop() {
                    if seen.insert(node) {
                        stack.extend(dependents[node].iter().map(|d| d.0));
                    }
                }
                seen.len()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations in declaration order
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn get(&self, id: OperationId) -> &Operation {
        &self.operations[id.0]
    }

    pub fn find(&self, key: &OperationKey) -> Option<&Operation> {
        self.index.get(key).map(|id| &self.operations[id.0])
    }

    /// Groups of operations whose dependencies all lie in earlier groups
    pub fn levels(&self) -> &[Vec<OperationId>] {
        &self.levels
    }

    /// Every (dependent, dependency) edge
    pub fn edges(&self) -> impl Iterator<Item = (OperationId, OperationId)> + '_ {
        self.operations
            .iter()
            .flat_map(|op| op.dependencies.iter().map(move |dep| (op.id, *dep)))
    }

    /// Get execution plan as string (for logging)
    pub fn execution_plan(&self) -> String {
        self.levels
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let names: Vec<_> = group
                    .iter()
                    .map(|id| self.operations[id.0].key.to_string())
                    .collect();

                if group.len() > 1 {
                    format!("Level {}: {} (parallel)", i + 1, names.join(" ∥ "))
                } else {
                    format!("Level {}: {}", i + 1, names[0])
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
