use serde::{Deserialize, Serialize};

/// Status of one operation within a run
///
/// "Waiting" is deliberately absent: an operation whose dependencies are not
/// all terminal is derived as waiting by the scheduler, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Ready,
    Queued,
    Executing,
    Success,
    SuccessWithWarning,
    FromCache,
    NoOp,
    Skipped,
    Blocked,
    Failure,
    Cancelled,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 11] = [
        OperationStatus::Ready,
        OperationStatus::Queued,
        OperationStatus::Executing,
        OperationStatus::Success,
        OperationStatus::SuccessWithWarning,
        OperationStatus::FromCache,
        OperationStatus::NoOp,
        OperationStatus::Skipped,
        OperationStatus::Blocked,
        OperationStatus::Failure,
        OperationStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Ready => "ready",
            OperationStatus::Queued => "queued",
            OperationStatus::Executing => "executing",
            OperationStatus::Success => "success",
            OperationStatus::SuccessWithWarning => "success_with_warning",
            OperationStatus::FromCache => "from_cache",
            OperationStatus::NoOp => "no_op",
            OperationStatus::Skipped => "skipped",
            OperationStatus::Blocked => "blocked",
            OperationStatus::Failure => "failure",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            OperationStatus::Ready | OperationStatus::Queued | OperationStatus::Executing
        )
    }

    /// Terminal and lets dependents proceed
    pub fn unblocks_dependents(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success
                | OperationStatus::SuccessWithWarning
                | OperationStatus::FromCache
                | OperationStatus::NoOp
                | OperationStatus::Skipped
        )
    }

    /// Terminal and forces dependents to `Blocked`
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            OperationStatus::Failure | OperationStatus::Cancelled | OperationStatus::Blocked
        )
    }

    /// Whether the state machine permits `self -> next`
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        match (self, next) {
            (Ready, Queued) => true,
            (Ready | Queued, FromCache | NoOp | Blocked | Cancelled | Failure) => true,
            (Queued, Executing) => true,
            (Executing, Success | SuccessWithWarning | Failure | Cancelled) => true,
            // Assigned before scheduling begins
            (Ready, Skipped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Overall verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Success,
    SuccessWithWarning,
    Failure,
}

impl AggregateStatus {
    /// `Failure` if any operation failed, else `SuccessWithWarning` if any
    /// warned, else `Success`. Blocked, skipped and cancelled operations do
    /// not change the verdict by themselves.
    pub fn from_statuses<I: IntoIterator<Item = OperationStatus>>(statuses: I) -> Self {
        let mut aggregate = AggregateStatus::Success;
        for status in statuses {
            match status {
                OperationStatus::Failure => return AggregateStatus::Failure,
                OperationStatus::SuccessWithWarning => {
                    aggregate = AggregateStatus::SuccessWithWarning
                }
                _ => {}
            }
        }
        aggregate
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::Success => "success",
            AggregateStatus::SuccessWithWarning => "success_with_warning",
            AggregateStatus::Failure => "failure",
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, AggregateStatus::Failure)
    }
}

impl std::fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationStatus::*;

    #[test]
    fn test_terminal_partition() {
        let terminal: Vec<_> = OperationStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 8);
        for s in OperationStatus::ALL.iter().filter(|s| s.is_terminal()) {
            assert!(s.unblocks_dependents() ^ s.blocks_dependents(), "{}", s);
        }
    }

    #[test]
    fn test_terminal_states_never_reopen() {
        for from in OperationStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in OperationStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_cache_and_noop_skip_executing() {
        assert!(Ready.can_transition_to(FromCache));
        assert!(Queued.can_transition_to(NoOp));
        assert!(!Executing.can_transition_to(FromCache));
        assert!(!Ready.can_transition_to(Executing));
    }

    #[test]
    fn test_aggregate_precedence() {
        assert_eq!(
            AggregateStatus::from_statuses([Success, FromCache, NoOp]),
            AggregateStatus::Success
        );
        assert_eq!(
            AggregateStatus::from_statuses([Success, SuccessWithWarning, Blocked, Skipped]),
            AggregateStatus::SuccessWithWarning
        );
        assert_eq!(
            AggregateStatus::from_statuses([SuccessWithWarning, Failure, Blocked]),
            AggregateStatus::Failure
        );
        assert_eq!(
            AggregateStatus::from_statuses([Cancelled, Blocked]),
            AggregateStatus::Success
        );
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&SuccessWithWarning).unwrap();
        assert_eq!(json, "\"success_with_warning\"");
        assert_eq!(FromCache.to_string(), "from_cache");
    }
}
