//! Process lifecycle phases.

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    WaitingForCacheSync,
    Running,
    ShuttingDown,
    Stopped,
}

impl Phase {
    fn can_become(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Starting, Phase::WaitingForCacheSync)
                | (Phase::WaitingForCacheSync, Phase::Running)
                | (Phase::WaitingForCacheSync, Phase::ShuttingDown)
                | (Phase::Running, Phase::ShuttingDown)
                | (Phase::ShuttingDown, Phase::Stopped)
        )
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal lifecycle transition from {from:?} to {to:?}")]
pub struct IllegalTransition {
    pub from: Phase,
    pub to: Phase,
}

/// Current phase plus every phase entered so far.
#[derive(Debug)]
pub struct Lifecycle {
    history: Vec<Phase>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            history: vec![Phase::Starting],
        }
    }

    pub fn phase(&self) -> Phase {
        self.history.last().copied().unwrap_or(Phase::Starting)
    }

    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    /// Moves to `next`. The phase is left unchanged if the move is not allowed.
    pub fn transition(&mut self, next: Phase) -> Result<(), IllegalTransition> {
        let current = self.phase();
        if !current.can_become(next) {
            return Err(IllegalTransition { from: current, to: next });
        }
        debug!("Lifecycle {:?} -> {:?}", current, next);
        self.history.push(next);
        Ok(())
    }
}
