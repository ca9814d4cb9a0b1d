//! Lifecycle conditions for tasks and instances.

use serde::{Deserialize, Serialize};

/// Closed enumeration describing where a task or instance is in its
/// lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Known to the tracker but not yet handed to the external manager.
    Created,
    /// Resources are reserved for the task but nothing is running.
    Reserved,
    /// The external manager accepted the launch and is staging it.
    Staging,
    /// The executor is starting the workload.
    Starting,
    /// The workload is running.
    Running,
    /// A kill was issued and is in flight.
    Killing,
    /// The workload was killed.
    Killed,
    /// The workload exited successfully.
    Finished,
    /// The workload exited with a failure.
    Failed,
    /// The external manager rejected or lost the task with an error.
    Error,
    /// The agent is gone; the task will never report again.
    Gone,
    /// The task was dropped before reaching an agent.
    Dropped,
    /// The external manager does not know the task.
    Unknown,
    /// The agent stopped reporting; the task may still be running.
    Unreachable,
    /// Unreachable for longer than the configured inactivity window.
    UnreachableInactive,
}

impl Condition {
    /// Conditions that still occupy a slot in the fleet. An unreachable
    /// instance keeps its slot until the expunge policy removes it.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Condition::Staging
                | Condition::Starting
                | Condition::Running
                | Condition::Killing
                | Condition::Unreachable
        )
    }

    /// Terminal conditions; the task will never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Condition::Killed
                | Condition::Finished
                | Condition::Failed
                | Condition::Error
                | Condition::Gone
                | Condition::Dropped
                | Condition::Unknown
        )
    }

    /// Whether the instance is out of contact with the external manager.
    pub fn is_unreachable(self) -> bool {
        matches!(self, Condition::Unreachable | Condition::UnreachableInactive)
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Condition::Created => "created",
            Condition::Reserved => "reserved",
            Condition::Staging => "staging",
            Condition::Starting => "starting",
            Condition::Running => "running",
            Condition::Killing => "killing",
            Condition::Killed => "killed",
            Condition::Finished => "finished",
            Condition::Failed => "failed",
            Condition::Error => "error",
            Condition::Gone => "gone",
            Condition::Dropped => "dropped",
            Condition::Unknown => "unknown",
            Condition::Unreachable => "unreachable",
            Condition::UnreachableInactive => "unreachable_inactive",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_and_terminal_are_disjoint() {
        let all = [
            Condition::Created,
            Condition::Reserved,
            Condition::Staging,
            Condition::Starting,
            Condition::Running,
            Condition::Killing,
            Condition::Killed,
            Condition::Finished,
            Condition::Failed,
            Condition::Error,
            Condition::Gone,
            Condition::Dropped,
            Condition::Unknown,
            Condition::Unreachable,
            Condition::UnreachableInactive,
        ];
        for c in all {
            assert!(!(c.is_active() && c.is_terminal()), "{c} both active and terminal");
        }
    }

    #[test]
    fn test_unreachable_is_active_but_inactive_is_not() {
        assert!(Condition::Unreachable.is_active());
        assert!(!Condition::UnreachableInactive.is_active());
        assert!(Condition::UnreachableInactive.is_unreachable());
        assert!(!Condition::UnreachableInactive.is_terminal());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&Condition::UnreachableInactive).unwrap(),
            "\"unreachable_inactive\""
        );
    }
}
