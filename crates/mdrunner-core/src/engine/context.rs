use super::resources::DeviceRegistry;
use nalgebra::Matrix3;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Why a run stopped, in increasing urgency. The discriminant is the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum StopCondition {
    #[default]
    None = 0,
    /// Stop at the next pair-list update, where the state is cheapest to resume from.
    NextListUpdate = 1,
    NextStep = 2,
    /// Stop immediately without writing a final checkpoint.
    Abort = 3,
}

impl StopCondition {
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    fn from_level(level: u8) -> Self {
        match level {
            0 => Self::None,
            1 => Self::NextListUpdate,
            2 => Self::NextStep,
            _ => Self::Abort,
        }
    }
}

impl fmt::Display for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::NextListUpdate => "stop at next list update",
            Self::NextStep => "stop at next step",
            Self::Abort => "abort",
        })
    }
}

/// A stop request that can only grow more urgent. Set from signal handlers or a
/// controlling thread; sampled by the coordinating rank between steps.
#[derive(Debug, Default)]
pub struct StopSignal {
    level: AtomicU8,
}

impl StopSignal {
    pub fn request(&self, condition: StopCondition) {
        self.level.fetch_max(condition as u8, Ordering::SeqCst);
    }

    /// Raises the request by one level and returns the new condition.
    pub fn escalate(&self) -> StopCondition {
        let previous = self
            .level
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |l| {
                Some((l + 1).min(StopCondition::Abort as u8))
            })
            .unwrap_or(StopCondition::Abort as u8);
        StopCondition::from_level((previous + 1).min(StopCondition::Abort as u8))
    }

    pub fn current(&self) -> StopCondition {
        StopCondition::from_level(self.level.load(Ordering::SeqCst))
    }
}

/// The box that deformation is measured from, with the step it belongs to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeformReference {
    pub init_step: i64,
    pub box_matrix: Matrix3<f64>,
}

/// State shared by all ranks of one run that does not fit any single phase.
#[derive(Debug, Default)]
pub struct SharedRunContext {
    deform_reference: OnceCell<DeformReference>,
    pub stop: StopSignal,
    pub devices: DeviceRegistry,
}

impl SharedRunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the deform reference. Only the first call has an effect; returns whether
    /// this call set it.
    pub fn record_deform_reference(&self, reference: DeformReference) -> bool {
        self.deform_reference.set(reference).is_ok()
    }

    pub fn deform_reference(&self) -> Option<&DeformReference> {
        self.deform_reference.get()
    }
}
