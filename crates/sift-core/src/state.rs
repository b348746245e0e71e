use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SiftError};

/// Lifecycle of one request through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Decomposing,
    AwaitingConfirmation,
    Executing,
    Synthesizing,
    Done,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decomposing => "decomposing",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Executing => "executing",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Execution is reachable only from decomposition (no confirmation needed)
    /// or from awaiting confirmation (explicit approval).
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Decomposing, AwaitingConfirmation)
                | (Decomposing, Executing)
                | (Decomposing, Failed)
                | (Decomposing, Cancelled)
                | (AwaitingConfirmation, Executing)
                | (AwaitingConfirmation, Failed)
                | (AwaitingConfirmation, Cancelled)
                | (Executing, Synthesizing)
                | (Executing, Failed)
                | (Executing, Cancelled)
                | (Synthesizing, Done)
                | (Synthesizing, Failed)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
}

/// Tracks the current state of one request and refuses illegal moves.
#[derive(Debug, Clone)]
pub struct StateTracker {
    current: PipelineState,
    history: Vec<Transition>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: PipelineState::Decomposing,
            history: Vec::new(),
        }
    }

    /// Resume tracking from a known state (e.g. a paused confirmation).
    pub fn resume_at(state: PipelineState) -> Self {
        Self {
            current: state,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn advance(&mut self, to: PipelineState) -> Result<PipelineState> {
        let from = self.current;
        if !from.can_transition_to(to) {
            return Err(SiftError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.current = to;
        self.history.push(Transition {
            from,
            to,
            at: Utc::now(),
        });
        Ok(from)
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut tracker = StateTracker::new();
        tracker.advance(PipelineState::Executing).unwrap();
        tracker.advance(PipelineState::Synthesizing).unwrap();
        tracker.advance(PipelineState::Done).unwrap();
        assert_eq!(tracker.current(), PipelineState::Done);
        assert_eq!(tracker.history().len(), 3);
        assert!(tracker.current().is_terminal());
    }

    #[test]
    fn test_confirmation_cannot_be_skipped() {
        let mut tracker = StateTracker::resume_at(PipelineState::AwaitingConfirmation);
        assert!(tracker.advance(PipelineState::Synthesizing).is_err());
        assert!(tracker.advance(PipelineState::Done).is_err());
        tracker.advance(PipelineState::Executing).unwrap();
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [PipelineState::Done, PipelineState::Failed, PipelineState::Cancelled] {
            for next in [
                PipelineState::Decomposing,
                PipelineState::Executing,
                PipelineState::Synthesizing,
                PipelineState::Done,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_serde_names() {
        let s = serde_json::to_string(&PipelineState::AwaitingConfirmation).unwrap();
        assert_eq!(s, "\"awaiting_confirmation\"");
    }
}
