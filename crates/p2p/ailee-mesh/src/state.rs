use serde::{Deserialize, Serialize};

/// Lifecycle state of one worker as the coordinator sees it.
///
/// Transitions are driven by telemetry ingest, safety evaluation,
/// discovery timeouts, and explicit unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkerState {
    #[default]
    Unregistered,
    Registered,
    Active,
    SafeMode,
    Stale,
}

impl WorkerState {
    /// Whether the state machine permits `self -> to`.
    pub fn can_transition(self, to: WorkerState) -> bool {
        use WorkerState::*;
        match (self, to) {
            // Anything may drop back to Unregistered.
            (_, Unregistered) => true,
            (Unregistered, Registered) => true,
            // Fresh telemetry activates; the safety breaker flips both ways.
            (Registered, Active) | (Registered, SafeMode) => true,
            (Active, SafeMode) | (SafeMode, Active) => true,
            // Telemetry older than the horizon.
            (Registered, Stale) | (Active, Stale) | (SafeMode, Stale) => true,
            // A stale worker that reports again comes back.
            (Stale, Active) | (Stale, SafeMode) => true,
            _ => false,
        }
    }

    /// Only active workers are eligible for scheduling.
    pub fn schedulable(self) -> bool {
        self == WorkerState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerState::*;

    #[test]
    fn legal_lifecycle_paths() {
        assert!(Unregistered.can_transition(Registered));
        assert!(Registered.can_transition(Active));
        assert!(Active.can_transition(SafeMode));
        assert!(SafeMode.can_transition(Active));
        assert!(Active.can_transition(Stale));
        assert!(Stale.can_transition(Active));
        assert!(SafeMode.can_transition(Unregistered));
    }

    #[test]
    fn illegal_jumps_are_refused() {
        assert!(!Unregistered.can_transition(Active));
        assert!(!Unregistered.can_transition(SafeMode));
        assert!(!Stale.can_transition(Registered));
        assert!(!Active.can_transition(Registered));
    }

    #[test]
    fn only_active_schedules() {
        assert!(Active.schedulable());
        for state in [Unregistered, Registered, SafeMode, Stale] {
            assert!(!state.schedulable());
        }
    }
}
