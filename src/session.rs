use serde::Serialize;
use thiserror::Error;

use crate::config::ExperimentConfig;
use crate::layout::Position;
use crate::util::mean;

/// Response time recorded for every trial when an admin skips the block.
pub const SKIPPED_RESPONSE_SECS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TrialOutcome {
    Correct,
    Incorrect,
    Timeout,
}

/// The participant's answer to "did anything move?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Change,
    NoChange,
}

impl Response {
    pub fn is_correct(self, change_occurred: bool) -> bool {
        (self == Response::Change) == change_occurred
    }
}

/// Read-only snapshot for the UI and the save pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub current_trial: usize,
    pub total_trials: usize,
    pub accuracy_pct: f64,
    pub avg_response_time_sec: f64,
    pub timeout_count: usize,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrityIssue {
    #[error("{actual} response times recorded for {expected} completed trials")]
    ResponseTimesLength { expected: usize, actual: usize },
    #[error("{actual} outcomes recorded for {expected} completed trials")]
    OutcomesLength { expected: usize, actual: usize },
    #[error("correct count {correct} exceeds completed trials {completed}")]
    CorrectExceedsCompleted { correct: usize, completed: usize },
    #[error("correct count {counted} disagrees with {recorded} correct outcomes")]
    CorrectCountMismatch { counted: usize, recorded: usize },
    #[error("trial index {index} is past the configured {total} trials")]
    IndexPastTotal { index: usize, total: usize },
}

/// Per-attempt trial bookkeeping for the main block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub current_trial_index: usize,
    pub correct_count: usize,
    pub response_times: Vec<f64>,
    pub trial_outcomes: Vec<TrialOutcome>,
    pub is_trial_active: bool,
    pub data_submitted: bool,
    pub current_layout: Vec<Position>,
    pub test_layout: Vec<Position>,
    pub color_assignment: Vec<usize>,
    pub change_occurred_this_trial: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to an empty attempt. Timers are owned by the engine, which
    /// cancels them alongside this.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn record_response(&mut self, elapsed_secs: f64, correct: bool) -> TrialOutcome {
        let outcome = if correct {
            self.correct_count += 1;
            TrialOutcome::Correct
        } else {
            TrialOutcome::Incorrect
        };
        self.response_times.push(elapsed_secs);
        self.trial_outcomes.push(outcome);
        self.current_trial_index += 1;
        outcome
    }

    pub(crate) fn record_timeout(&mut self, limit_secs: f64) {
        self.response_times.push(limit_secs);
        self.trial_outcomes.push(TrialOutcome::Timeout);
        self.current_trial_index += 1;
    }

    /// Fabricate a perfect run of `num_trials`.
    pub(crate) fn fill_skipped(&mut self, num_trials: usize) {
        self.is_trial_active = false;
        self.current_trial_index = num_trials;
        self.correct_count = num_trials;
        self.response_times = vec![SKIPPED_RESPONSE_SECS; num_trials];
        self.trial_outcomes = vec![TrialOutcome::Correct; num_trials];
    }

    /// Zero-based indices of trials that ran out the clock.
    pub fn timeout_trials(&self) -> Vec<usize> {
        self.trial_outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| **o == TrialOutcome::Timeout)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn accuracy_pct(&self) -> f64 {
        if self.current_trial_index == 0 {
            0.0
        } else {
            self.correct_count as f64 / self.current_trial_index as f64 * 100.0
        }
    }

    pub fn progress(&self, total_trials: usize) -> Progress {
        Progress {
            current_trial: self.current_trial_index,
            total_trials,
            accuracy_pct: self.accuracy_pct(),
            avg_response_time_sec: mean(&self.response_times).unwrap_or(0.0),
            timeout_count: self.timeout_trials().len(),
            is_complete: self.current_trial_index >= total_trials,
        }
    }

    /// Check the bookkeeping invariants. Meant for tests and debug logging.
    pub fn validate(&self, cfg: &ExperimentConfig) -> Vec<IntegrityIssue> {
        let mut issues = vec![];
        let completed = self.current_trial_index;

        if self.response_times.len() != completed {
            issues.push(IntegrityIssue::ResponseTimesLength {
                expected: completed,
                actual: self.response_times.len(),
            });
        }
        if self.trial_outcomes.len() != completed {
            issues.push(IntegrityIssue::OutcomesLength {
                expected: completed,
                actual: self.trial_outcomes.len(),
            });
        }
        if self.correct_count > completed {
            issues.push(IntegrityIssue::CorrectExceedsCompleted {
                correct: self.correct_count,
                completed,
            });
        }
        let recorded = self
            .trial_outcomes
            .iter()
            .filter(|o| **o == TrialOutcome::Correct)
            .count();
        if recorded != self.correct_count {
            issues.push(IntegrityIssue::CorrectCountMismatch {
                counted: self.correct_count,
                recorded,
            });
        }
        if completed > cfg.num_trials {
            issues.push(IntegrityIssue::IndexPastTotal {
                index: completed,
                total: cfg.num_trials,
            });
        }
        issues
    }
}
