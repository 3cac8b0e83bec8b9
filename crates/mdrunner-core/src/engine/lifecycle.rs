use super::error::EngineError;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Planning,
    Bootstrapped,
    Configured,
    Tuning,
    Restoring,
    Running,
    Finalizing,
    Terminated,
}

impl LifecycleState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Planning => "Planning",
            Self::Bootstrapped => "Bootstrapped",
            Self::Configured => "Configured",
            Self::Tuning => "Tuning",
            Self::Restoring => "Restoring",
            Self::Running => "Running",
            Self::Finalizing => "Finalizing",
            Self::Terminated => "Terminated",
        }
    }

    /// Whether the lifecycle may move from `self` to `next`.
    ///
    /// Tuning and Restoring are optional. Any state before Running may move straight to
    /// Finalizing so a failed run still releases what it holds.
    pub fn can_advance_to(self, next: Self) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Planning, Bootstrapped) => true,
            (Bootstrapped, Configured) => true,
            (Configured, Tuning | Restoring | Running) => true,
            (Tuning, Restoring | Running) => true,
            (Restoring, Running) => true,
            (Running, Finalizing) => true,
            (Finalizing, Terminated) => true,
            (Planning | Bootstrapped | Configured | Tuning | Restoring, Finalizing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracks the lifecycle of one rank and the wall time spent in each state.
#[derive(Debug)]
pub struct Lifecycle {
    rank: usize,
    state: LifecycleState,
    entered: Instant,
    durations: Vec<(LifecycleState, Duration)>,
}

impl Lifecycle {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            state: LifecycleState::Planning,
            entered: Instant::now(),
            durations: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn advance(&mut self, next: LifecycleState) -> Result<(), EngineError> {
        if !self.state.can_advance_to(next) {
            return Err(EngineError::Internal(format!(
                "illegal lifecycle transition {} -> {} on rank {}",
                self.state, next, self.rank
            )));
        }
        let now = Instant::now();
        self.durations.push((self.state, now - self.entered));
        debug!(rank = self.rank, from = %self.state, to = %next, "Lifecycle transition.");
        self.state = next;
        self.entered = now;
        Ok(())
    }

    /// Time spent in each completed state, in the order they were left.
    pub fn durations(&self) -> &[(LifecycleState, Duration)] {
        &self.durations
    }
}
