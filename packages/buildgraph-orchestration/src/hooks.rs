//! Extension points fired by the executor
//!
//! Hooks observe a run and may warn about or veto an individual operation
//! right before dispatch. They cannot change the graph. Registered hooks
//! are invoked synchronously, in registration order.

use std::sync::Arc;

use crate::graph::OperationGraph;
use crate::operation::Operation;
use crate::record::ExecutionRecord;
use crate::summary::RunSummary;

/// What a hook thinks of an operation about to be dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Proceed,
    /// Attach a warning; a later `Success` becomes `SuccessWithWarning`
    Warn(String),
    /// Do not dispatch; the operation fails with this reason
    Veto(String),
}

impl HookVerdict {
    fn strength(&self) -> u8 {
        match self {
            HookVerdict::Proceed => 0,
            HookVerdict::Warn(_) => 1,
            HookVerdict::Veto(_) => 2,
        }
    }

    /// Keep the stronger verdict; on a tie the earlier one wins
    pub fn merge(self, other: HookVerdict) -> HookVerdict {
        if other.strength() > self.strength() {
            other
        } else {
            self
        }
    }
}

#[allow(unused_variables)]
pub trait ExecutionHook: Send + Sync {
    fn name(&self) -> &str;

    /// Once, before anything is dispatched
    fn before_execute_operations(&self, graph: &OperationGraph) {}

    fn before_execute_operation(&self, operation: &Operation) -> HookVerdict {
        HookVerdict::Proceed
    }

    /// After a dispatched operation reported back
    fn after_execute_operation(&self, operation: &Operation, record: &ExecutionRecord) {}

    /// After every terminal transition, including `Blocked`, `Skipped` and `Cancelled`
    fn on_operation_status_changed(&self, operation: &Operation, record: &ExecutionRecord) {}

    fn after_execute_operations(&self, summary: &RunSummary) {}
}

#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn ExecutionHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn ExecutionHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    pub fn before_execute_operations(&self, graph: &OperationGraph) {
        for hook in &self.hooks {
            hook.before_execute_operations(graph);
        }
    }

    /// Every hook is consulted; the strongest verdict wins
    pub fn before_execute_operation(&self, operation: &Operation) -> HookVerdict {
        self.hooks
            .iter()
            .map(|hook| hook.before_execute_operation(operation))
            .fold(HookVerdict::Proceed, HookVerdict::merge)
    }

    pub fn after_execute_operation(&self, operation: &Operation, record: &ExecutionRecord) {
        for hook in &self.hooks {
            hook.after_execute_operation(operation, record);
        }
    }

    pub fn on_operation_status_changed(&self, operation: &Operation, record: &ExecutionRecord) {
        for hook in &self.hooks {
            hook.on_operation_status_changed(operation, record);
        }
    }

    pub fn after_execute_operations(&self, summary: &RunSummary) {
        for hook in &self.hooks {
            hook.after_execute_operations(summary);
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationSpec;
    use crate::topology::StaticTopology;
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        verdict: HookVerdict,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ExecutionHook for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn before_execute_operation(&self, operation: &Operation) -> HookVerdict {
            self.log.lock().push(format!("{}:{}", self.name, operation.key()));
            self.verdict.clone()
        }
    }

    fn operation() -> Operation {
        let topology = StaticTopology::new().with_operation(OperationSpec::new("web", "build"));
        OperationGraph::build(&topology).unwrap().operations()[0].clone()
    }

    #[test]
    fn test_merge_prefers_strongest() {
        let warn = HookVerdict::Warn("slow".into());
        let veto = HookVerdict::Veto("policy".into());

        assert_eq!(HookVerdict::Proceed.merge(warn.clone()), warn);
        assert_eq!(warn.clone().merge(veto.clone()), veto);
        assert_eq!(veto.clone().merge(warn.clone()), veto);
        assert_eq!(
            warn.clone().merge(HookVerdict::Warn("later".into())),
            warn
        );
    }

    #[test]
    fn test_registry_invokes_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        for (name, verdict) in [
            ("first", HookVerdict::Proceed),
            ("second", HookVerdict::Warn("deprecated".into())),
            ("third", HookVerdict::Proceed),
        ] {
            registry.register(Arc::new(Recording {
                name,
                verdict,
                log: log.clone(),
            }));
        }

        let verdict = registry.before_execute_operation(&operation());
        assert_eq!(verdict, HookVerdict::Warn("deprecated".into()));
        assert_eq!(
            *log.lock(),
            vec![
                "first:web (build)".to_string(),
                "second:web (build)".to_string(),
                "third:web (build)".to_string(),
            ]
        );
        assert_eq!(registry.names(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_empty_registry_proceeds() {
        let registry = HookRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.before_execute_operation(&operation()), HookVerdict::Proceed);
    }
}
