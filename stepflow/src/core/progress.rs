//! Checkpoint data and resume-window arithmetic.
//!
//! Everything here is pure: the checkpoint file itself is owned by
//! [`crate::io::checkpoint`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted record of which step indices have been approved.
///
/// `total_steps` must equal the current plan's step count; a mismatched record is
/// stale and must be treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    /// 0-based indices, serialized in ascending order.
    pub completed_step_indices: BTreeSet<usize>,
    pub total_steps: usize,
    pub last_updated: DateTime<Utc>,
}

impl StepProgress {
    pub fn new(total_steps: usize) -> Self {
        Self {
            completed_step_indices: BTreeSet::new(),
            total_steps,
            last_updated: Utc::now(),
        }
    }

    pub fn is_completed(&self, index: usize) -> bool {
        self.completed_step_indices.contains(&index)
    }

    pub fn mark_completed(&mut self, index: usize) {
        self.completed_step_indices.insert(index);
    }

    pub fn completed_count(&self) -> usize {
        self.completed_step_indices.len()
    }

    /// First index in `0..total_steps` that is not completed.
    pub fn next_incomplete(&self) -> Option<usize> {
        (0..self.total_steps).find(|idx| !self.is_completed(*idx))
    }

    /// Highest completed index.
    pub fn last_completed(&self) -> Option<usize> {
        self.completed_step_indices.iter().next_back().copied()
    }

    pub fn matches_plan(&self, plan_len: usize) -> bool {
        self.total_steps == plan_len
    }
}

/// What a loaded checkpoint means for the current plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointAssessment {
    /// No usable progress: absent, empty, or stale.
    Fresh,
    /// Every step is already complete.
    AllComplete(StepProgress),
    /// Some prefix (possibly with gaps) is complete.
    Partial {
        progress: StepProgress,
        next_incomplete: usize,
        last_completed: usize,
    },
}

/// Classify a loaded checkpoint against the current plan length.
///
/// A checkpoint whose `total_steps` disagrees with `plan_len` is discarded here so
/// that no resume decision is ever made from it.
pub fn assess_checkpoint(loaded: Option<StepProgress>, plan_len: usize) -> CheckpointAssessment {
    let Some(progress) = loaded else {
        return CheckpointAssessment::Fresh;
    };
    if !progress.matches_plan(plan_len) || progress.completed_step_indices.is_empty() {
        return CheckpointAssessment::Fresh;
    }
    match (progress.next_incomplete(), progress.last_completed()) {
        (None, _) => CheckpointAssessment::AllComplete(progress),
        (Some(next_incomplete), Some(last_completed)) => CheckpointAssessment::Partial {
            progress,
            next_incomplete,
            last_completed,
        },
        (Some(_), None) => CheckpointAssessment::Fresh,
    }
}

/// How the human chose to continue from a partial checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    Resume,
    Restart,
    FastExecute,
}

/// Fast-execute replay range `[0, end_index]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FastExecuteWindow {
    pub enabled: bool,
    pub end_index: usize,
}

impl FastExecuteWindow {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn through(end_index: usize) -> Self {
        Self {
            enabled: true,
            end_index,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.enabled && index <= self.end_index
    }
}

/// Where execution starts and which indices replay without gates or learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionWindow {
    /// Indices below this are skipped.
    pub start_cursor: usize,
    pub fast_execute: FastExecuteWindow,
}

impl ExecutionWindow {
    pub fn from_start() -> Self {
        Self::default()
    }

    /// True when index `i` must not run in this invocation.
    ///
    /// Completed indices inside the fast-execute window still run, as replays.
    pub fn skips(&self, index: usize, progress: &StepProgress) -> bool {
        index < self.start_cursor
            || (progress.is_completed(index) && !self.fast_execute.contains(index))
    }
}

/// Apply a resume choice to a partial checkpoint.
///
/// Returns the window plus the progress record execution should continue from.
/// `Restart` yields an empty record; the caller is responsible for deleting the
/// checkpoint file. `FastExecute` keeps the record intact, so a replay that stops
/// partway never loses steps approved in an earlier session.
pub fn apply_resume_choice(
    choice: ResumeChoice,
    progress: StepProgress,
    next_incomplete: usize,
    last_completed: usize,
) -> (ExecutionWindow, StepProgress) {
    match choice {
        ResumeChoice::Resume => (
            ExecutionWindow {
                start_cursor: next_incomplete,
                fast_execute: FastExecuteWindow::disabled(),
            },
            progress,
        ),
        ResumeChoice::Restart => (
            ExecutionWindow::from_start(),
            StepProgress::new(progress.total_steps),
        ),
        ResumeChoice::FastExecute => (
            ExecutionWindow {
                start_cursor: 0,
                fast_execute: FastExecuteWindow::through(last_completed),
            },
            progress,
        ),
    }
}
