//! Overall progress of a pipeline run
//!
//! Progress is the highest checkpoint reached. Stage checkpoints strictly exceed those
//! of their dependencies, so a stage is never reported below anything it waited on.

use spk_common::events::StageName;

/// Reported when a run begins
pub const INITIALIZING: u8 = 5;

/// Reported with the completion aggregate
pub const COMPLETED: u8 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressTracker {
    current: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    /// Advance to `checkpoint` unless already past it
    pub fn reach(&mut self, checkpoint: u8) -> u8 {
        self.current = self.current.max(checkpoint.min(COMPLETED));
        self.current
    }

    /// Record a resolved stage
    pub fn resolve(&mut self, stage: StageName) -> u8 {
        self.reach(stage.checkpoint())
    }
}
