//! Trial engine.
//!
//! One trial runs `Idle -> Presenting -> Blank -> AwaitingResponse -> Scored`
//! and then either chains into the next trial, waits for the participant
//! again, or completes the block. All delays are timers on the engine's own
//! [`Scheduler`]; every timer is stamped with the generation that scheduled
//! it, and the generation moves on whenever a trial starts, the block
//! changes, or the engine is reset or disposed. A timer from an older
//! generation is dropped when it fires, so nothing scheduled for one trial
//! can act on the next.
//!
//! Response and timeout race for the same trial. Whichever is handled first
//! clears `is_trial_active` before doing anything else; the other sees the
//! flag down and does nothing.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::admin::AdminGrant;
use crate::clock::{Clock, Scheduler, TimerHandle};
use crate::config::ExperimentConfig;
use crate::layout::{apply_change, assign_colors, generate_layout, Position};
use crate::session::{Progress, Response, SessionState, TrialOutcome};
use crate::training::PracticeSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Block {
    #[strum(serialize = "no-change training")]
    NoChangeTraining,
    #[strum(serialize = "change training")]
    ChangeTraining,
    #[strum(serialize = "practice")]
    Practice,
    #[strum(serialize = "main")]
    Main,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    Idle,
    Presenting,
    Blank,
    AwaitingResponse { started_at: Duration },
    Scored,
    Retrying,
    Complete,
    Disposed,
}

/// What the participant is told after a graded (non-main) trial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Correct,
    Incorrect,
    PracticeComplete,
}

/// Notable things that happened during a call into the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    Scored { block: Block, outcome: TrialOutcome },
    Retrying { block: Block },
    /// Back in `Idle`, waiting for the next start.
    Ready { block: Block },
    Completed(Block),
}

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("engine has been disposed")]
    Disposed,
    #[error("{0} block is already complete")]
    BlockComplete(Block),
    #[error("a trial is already in progress ({0:?})")]
    TrialInProgress(Phase),
}

/// Display side of the engine. Every method defaults to doing nothing.
pub trait Presenter {
    fn show_stimuli(&mut self, _layout: &[Position], _colors: &[usize]) {}
    fn clear_stimuli(&mut self) {}
    fn set_responses_enabled(&mut self, _enabled: bool) {}
    fn show_timeout_notice(&mut self, _visible: bool) {}
    fn show_feedback(&mut self, _block: Block, _feedback: Option<Feedback>) {}
    fn progress_changed(&mut self, _progress: &Progress) {}
    fn elapsed_readout(&mut self, _elapsed: Option<Duration>) {}
    fn block_complete(&mut self, _block: Block) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullPresenter;

impl Presenter for NullPresenter {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    StudyElapsed,
    BlankElapsed,
    ResponseTimeout,
    NoticeElapsed,
    HideNotice,
    Settle,
    Advance,
    RetryElapsed,
    Readout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimer {
    generation: u64,
    kind: TimerKind,
}

pub struct TrialEngine<C: Clock, P: Presenter = NullPresenter> {
    config: ExperimentConfig,
    block: Block,
    phase: Phase,
    session: SessionState,
    practice: PracticeSession,
    timers: Scheduler<C, EngineTimer>,
    display_timer: Option<TimerHandle>,
    response_timer: Option<TimerHandle>,
    readout_timer: Option<TimerHandle>,
    generation: u64,
    rng: StdRng,
    presenter: P,
    show_readout: bool,
}

impl<C: Clock, P: Presenter> TrialEngine<C, P> {
    /// New engine sitting idle at the start of the main block.
    pub fn new(config: ExperimentConfig, clock: C, presenter: P, mut rng: StdRng) -> Self {
        let practice = PracticeSession::generate(&mut rng, &config);
        Self {
            config,
            block: Block::Main,
            phase: Phase::Idle,
            session: SessionState::new(),
            practice,
            timers: Scheduler::new(clock),
            display_timer: None,
            response_timer: None,
            readout_timer: None,
            generation: 0,
            rng,
            presenter,
            show_readout: false,
        }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn block(&self) -> Block {
        self.block
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub(crate) fn session_mut(&mut self) -> &mut SessionState {
        &mut self.session
    }

    pub fn practice(&self) -> &PracticeSession {
        &self.practice
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    pub fn progress(&self) -> Progress {
        self.session.progress(self.config.num_trials)
    }

    pub fn now(&self) -> Duration {
        self.timers.now()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.timers.next_due()
    }

    pub fn is_disposed(&self) -> bool {
        self.phase == Phase::Disposed
    }

    /// Switch to `block` and wait in `Idle` for its first trial.
    ///
    /// Entering practice deals a fresh set; entering the main block starts a
    /// fresh session.
    pub fn begin_block(&mut self, block: Block) -> Result<(), EngineError> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        self.abandon_trial();
        self.block = block;
        self.phase = Phase::Idle;
        match block {
            Block::Practice => {
                self.practice = PracticeSession::generate(&mut self.rng, &self.config);
            }
            Block::Main => {
                self.session.reset();
                let progress = self.progress();
                self.presenter.progress_changed(&progress);
            }
            Block::NoChangeTraining | Block::ChangeTraining => {}
        }
        info!(%block, "block started");
        Ok(())
    }

    /// Start a trial from `Idle`.
    pub fn start_trial(&mut self) -> Result<(), EngineError> {
        match self.phase {
            Phase::Idle => {}
            Phase::Disposed => return Err(EngineError::Disposed),
            Phase::Complete => return Err(EngineError::BlockComplete(self.block)),
            other => return Err(EngineError::TrialInProgress(other)),
        }
        self.present_next();
        Ok(())
    }

    /// Submit the participant's answer. `None` when no response window is
    /// open, including when the timeout already scored this trial.
    pub fn respond(&mut self, response: Response) -> Option<TrialOutcome> {
        let started_at = match self.phase {
            Phase::AwaitingResponse { started_at } if self.session.is_trial_active => started_at,
            phase => {
                debug!(?phase, ?response, "response ignored");
                return None;
            }
        };
        let elapsed = self.now().saturating_sub(started_at);
        if elapsed >= self.config.response_time_limit() {
            // The timeout is due but no tick has delivered it yet.
            debug!(?elapsed, ?response, "response after the limit scored as timeout");
            return self.on_timeout();
        }
        self.session.is_trial_active = false;
        self.close_response_window();

        let elapsed = elapsed.as_secs_f64();
        let correct = response.is_correct(self.session.change_occurred_this_trial);
        self.phase = Phase::Scored;

        let outcome = match self.block {
            Block::Main => {
                let outcome = self.session.record_response(elapsed, correct);
                info!(
                    trial = self.session.current_trial_index,
                    elapsed = %format!("{elapsed:.2}"),
                    "trial processed"
                );
                debug!(?response, %outcome, "main trial scored");
                let progress = self.progress();
                self.presenter.progress_changed(&progress);
                self.display_timer = Some(self.schedule(self.config.settle_ms, TimerKind::Settle));
                outcome
            }
            _ => {
                debug!(block = %self.block, ?response, correct, "graded trial answered");
                self.grade(correct);
                if correct {
                    TrialOutcome::Correct
                } else {
                    TrialOutcome::Incorrect
                }
            }
        };
        Some(outcome)
    }

    /// Deliver every due timer, oldest first.
    pub fn tick(&mut self) -> Vec<EngineEvent> {
        let mut events = vec![];
        while let Some(fired) = self.timers.pop_due() {
            if self.is_disposed() {
                break;
            }
            let EngineTimer { generation, kind } = fired.event;
            if generation != self.generation {
                warn!(?kind, generation, current = self.generation, "stale timer dropped");
                continue;
            }
            if self.display_timer == Some(fired.handle) {
                self.display_timer = None;
            }
            if self.response_timer == Some(fired.handle) {
                self.response_timer = None;
            }
            self.on_timer(kind, &mut events);
        }
        events
    }

    /// Admin shortcut: record a perfect main block and complete it at once.
    pub fn skip_all_trials(&mut self, _grant: &AdminGrant<'_>) -> Result<EngineEvent, EngineError> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        info!("admin skipped all trials");
        self.abandon_trial();
        self.block = Block::Main;
        self.session.fill_skipped(self.config.num_trials);
        let progress = self.progress();
        self.presenter.progress_changed(&progress);
        Ok(self.complete())
    }

    /// Show or hide the running response-time readout.
    pub fn set_readout_visible(&mut self, visible: bool) {
        self.show_readout = visible;
        if !visible {
            self.stop_readout();
            return;
        }
        if matches!(self.phase, Phase::AwaitingResponse { .. }) && self.readout_timer.is_none() {
            self.start_readout();
        }
    }

    /// Empty the session and cancel every timer. The block is kept.
    pub fn reset(&mut self) {
        if self.is_disposed() {
            return;
        }
        self.abandon_trial();
        self.session.reset();
        self.phase = Phase::Idle;
        self.presenter.show_feedback(self.block, None);
        let progress = self.progress();
        self.presenter.progress_changed(&progress);
        info!(block = %self.block, "engine reset");
    }

    /// Cancel everything and refuse further work.
    pub fn dispose(&mut self) {
        let cancelled = self.timers.cancel_all();
        self.generation += 1;
        self.display_timer = None;
        self.response_timer = None;
        self.readout_timer = None;
        self.session.is_trial_active = false;
        self.phase = Phase::Disposed;
        debug!(cancelled, "engine disposed");
    }

    fn schedule(&mut self, ms: u64, kind: TimerKind) -> TimerHandle {
        let timer = EngineTimer {
            generation: self.generation,
            kind,
        };
        self.timers.after(Duration::from_millis(ms), timer)
    }

    /// Drop the current trial's timers and move to a fresh generation.
    fn abandon_trial(&mut self) {
        let cancelled = self.timers.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding timers");
        }
        self.display_timer = None;
        self.response_timer = None;
        self.readout_timer = None;
        self.generation += 1;
        self.session.is_trial_active = false;
        self.presenter.set_responses_enabled(false);
        self.presenter.show_timeout_notice(false);
        self.presenter.elapsed_readout(None);
        self.presenter.clear_stimuli();
    }

    fn present_next(&mut self) {
        self.abandon_trial();

        let (layout, colors) = match self.block {
            Block::Practice => match self.practice.current() {
                Some(spec) => (spec.layout.clone(), spec.color_assignment.clone()),
                None => {
                    self.complete();
                    return;
                }
            },
            _ => {
                let area = self.config.stimulus_area();
                let layout = generate_layout(&mut self.rng, &area, self.config.num_stimuli);
                let colors = assign_colors(&mut self.rng, self.config.num_stimuli);
                (layout, colors)
            }
        };

        self.session.current_layout = layout;
        self.session.color_assignment = colors;
        self.session.test_layout.clear();
        self.session.change_occurred_this_trial = false;
        self.session.is_trial_active = true;
        self.phase = Phase::Presenting;

        self.presenter.show_feedback(self.block, None);
        self.presenter
            .show_stimuli(&self.session.current_layout, &self.session.color_assignment);
        self.display_timer = Some(self.schedule(self.config.study_time_ms, TimerKind::StudyElapsed));

        match self.block {
            Block::Main => info!(trial = self.session.current_trial_index + 1, "trial started"),
            Block::Practice => info!(
                trial = self.practice.practice_index + 1,
                attempt = self.practice.attempt_number,
                "practice trial started"
            ),
            block => info!(%block, "training trial started"),
        }
    }

    fn on_timer(&mut self, kind: TimerKind, events: &mut Vec<EngineEvent>) {
        match (kind, self.phase) {
            (TimerKind::StudyElapsed, Phase::Presenting) => {
                self.phase = Phase::Blank;
                self.presenter.clear_stimuli();
                self.display_timer =
                    Some(self.schedule(self.config.blank_time_ms, TimerKind::BlankElapsed));
            }
            (TimerKind::BlankElapsed, Phase::Blank) => self.open_response_window(),
            (TimerKind::ResponseTimeout, Phase::AwaitingResponse { .. }) => {
                if let Some(outcome) = self.on_timeout() {
                    events.push(EngineEvent::Scored {
                        block: self.block,
                        outcome,
                    });
                }
                if self.phase == Phase::Retrying {
                    events.push(EngineEvent::Retrying { block: self.block });
                }
            }
            (TimerKind::HideNotice, _) => self.presenter.show_timeout_notice(false),
            (TimerKind::NoticeElapsed, Phase::Scored) => {
                self.presenter.show_timeout_notice(false);
                self.display_timer = Some(self.schedule(self.config.settle_ms, TimerKind::Settle));
            }
            (TimerKind::Settle, Phase::Scored) => {
                if self.session.current_trial_index >= self.config.num_trials {
                    events.push(self.complete());
                } else {
                    self.present_next();
                }
            }
            (TimerKind::Advance, Phase::Scored) => match self.block {
                Block::Practice if !self.practice.is_complete() => {
                    self.phase = Phase::Idle;
                    self.presenter.show_feedback(self.block, None);
                    events.push(EngineEvent::Ready { block: self.block });
                }
                _ => events.push(self.complete()),
            },
            (TimerKind::RetryElapsed, Phase::Retrying) => {
                if self.block == Block::Practice {
                    self.practice.restart(&mut self.rng, &self.config);
                    info!(attempt = self.practice.attempt_number, "practice set restarted");
                }
                self.phase = Phase::Idle;
                self.presenter.show_feedback(self.block, None);
                events.push(EngineEvent::Ready { block: self.block });
            }
            (TimerKind::Readout, Phase::AwaitingResponse { started_at }) => {
                let elapsed = self.now().saturating_sub(started_at);
                self.presenter.elapsed_readout(Some(elapsed));
            }
            (kind, phase) => {
                debug!(?kind, ?phase, "timer does not apply to phase");
            }
        }
    }

    fn open_response_window(&mut self) {
        let (has_change, test_layout) = match self.block {
            Block::NoChangeTraining => (false, self.session.current_layout.clone()),
            Block::ChangeTraining => self.changed_layout(),
            Block::Practice => match self.practice.current() {
                Some(spec) => (spec.has_change, spec.test_layout.clone()),
                None => (false, self.session.current_layout.clone()),
            },
            Block::Main => {
                if self.rng.gen::<f64>() < self.config.change_probability {
                    self.changed_layout()
                } else {
                    (false, self.session.current_layout.clone())
                }
            }
        };
        debug!(block = %self.block, has_change, "test layout ready");

        self.session.change_occurred_this_trial = has_change;
        self.session.test_layout = test_layout;

        let started_at = self.now();
        self.phase = Phase::AwaitingResponse { started_at };
        self.presenter
            .show_stimuli(&self.session.test_layout, &self.session.color_assignment);
        self.presenter.set_responses_enabled(true);
        self.response_timer = Some(self.schedule(
            self.config.response_time_limit_ms,
            TimerKind::ResponseTimeout,
        ));
        if self.show_readout {
            self.start_readout();
        }
    }

    fn changed_layout(&mut self) -> (bool, Vec<Position>) {
        let (test, change) = apply_change(
            &mut self.rng,
            &self.config.stimulus_area(),
            &self.config.change_params(),
            &self.session.current_layout,
        );
        debug!(changed = ?change.changed_indices(), ?change, "change applied");
        (true, test)
    }

    fn on_timeout(&mut self) -> Option<TrialOutcome> {
        if !self.session.is_trial_active {
            return None;
        }
        self.session.is_trial_active = false;
        self.close_response_window();
        self.phase = Phase::Scored;
        self.presenter.show_timeout_notice(true);

        if self.block == Block::Main {
            self.session
                .record_timeout(self.config.response_time_limit_secs());
            info!(trial = self.session.current_trial_index, "trial timed out");
            let progress = self.progress();
            self.presenter.progress_changed(&progress);
            self.display_timer =
                Some(self.schedule(self.config.timeout_notice_ms, TimerKind::NoticeElapsed));
        } else {
            info!(block = %self.block, "graded trial timed out");
            self.schedule(self.config.timeout_notice_ms, TimerKind::HideNotice);
            self.grade(false);
        }
        Some(TrialOutcome::Timeout)
    }

    /// Apply the must-be-correct rule of the training blocks.
    fn grade(&mut self, correct: bool) {
        if !correct {
            self.phase = Phase::Retrying;
            self.presenter
                .show_feedback(self.block, Some(Feedback::Incorrect));
            self.display_timer =
                Some(self.schedule(self.config.retry_delay_ms, TimerKind::RetryElapsed));
            return;
        }

        let (feedback, delay) = match self.block {
            Block::Practice => {
                let done = self.practice.record_correct();
                let feedback = if done {
                    Feedback::PracticeComplete
                } else {
                    Feedback::Correct
                };
                (feedback, self.config.practice_advance_ms)
            }
            _ => (Feedback::Correct, self.config.training_advance_ms),
        };
        self.presenter.show_feedback(self.block, Some(feedback));
        self.display_timer = Some(self.schedule(delay, TimerKind::Advance));
    }

    fn close_response_window(&mut self) {
        if let Some(handle) = self.response_timer.take() {
            self.timers.cancel(handle);
        }
        self.stop_readout();
        self.presenter.set_responses_enabled(false);
    }

    fn start_readout(&mut self) {
        let timer = EngineTimer {
            generation: self.generation,
            kind: TimerKind::Readout,
        };
        let interval = Duration::from_millis(self.config.readout_interval_ms);
        self.readout_timer = Some(self.timers.every(interval, timer));
    }

    fn stop_readout(&mut self) {
        if let Some(handle) = self.readout_timer.take() {
            self.timers.cancel(handle);
        }
        self.presenter.elapsed_readout(None);
    }

    fn complete(&mut self) -> EngineEvent {
        self.abandon_trial();
        self.phase = Phase::Complete;
        self.presenter.block_complete(self.block);
        info!(block = %self.block, "block complete");
        if self.block == Block::Main {
            let progress = self.progress();
            info!(
                trials = progress.current_trial,
                accuracy = %format!("{:.1}", progress.accuracy_pct),
                timeouts = progress.timeout_count,
                "main block finished"
            );
            let issues = self.session.validate(&self.config);
            if !issues.is_empty() {
                warn!(?issues, "session bookkeeping inconsistent");
            }
        }
        EngineEvent::Completed(self.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use assert_matches::assert_matches;
    use rand::SeedableRng;

    #[derive(Debug, Default)]
    struct Recorder {
        responses_enabled: bool,
        notice: bool,
        shown: usize,
        cleared: usize,
        feedback: Option<Feedback>,
        readouts: Vec<Duration>,
        completed: Vec<Block>,
    }

    impl Presenter for Recorder {
        fn show_stimuli(&mut self, _layout: &[Position], _colors: &[usize]) {
            self.shown += 1;
        }
        fn clear_stimuli(&mut self) {
            self.cleared += 1;
        }
        fn set_responses_enabled(&mut self, enabled: bool) {
            self.responses_enabled = enabled;
        }
        fn show_timeout_notice(&mut self, visible: bool) {
            self.notice = visible;
        }
        fn show_feedback(&mut self, _block: Block, feedback: Option<Feedback>) {
            self.feedback = feedback;
        }
        fn elapsed_readout(&mut self, elapsed: Option<Duration>) {
            if let Some(e) = elapsed {
                self.readouts.push(e);
            }
        }
        fn block_complete(&mut self, block: Block) {
            self.completed.push(block);
        }
    }

    fn engine(cfg: ExperimentConfig) -> (TrialEngine<ManualClock, Recorder>, ManualClock) {
        let clock = ManualClock::new();
        let e = TrialEngine::new(
            cfg,
            clock.clone(),
            Recorder::default(),
            StdRng::seed_from_u64(42),
        );
        (e, clock)
    }

    fn to_response(e: &mut TrialEngine<ManualClock, Recorder>, clock: &ManualClock) {
        clock.advance_ms(500);
        e.tick();
        assert_eq!(e.phase(), Phase::Blank);
        clock.advance_ms(900);
        e.tick();
        assert_matches!(e.phase(), Phase::AwaitingResponse { .. });
    }

    fn correct_answer(e: &TrialEngine<ManualClock, Recorder>) -> Response {
        if e.session().change_occurred_this_trial {
            Response::Change
        } else {
            Response::NoChange
        }
    }

    fn wrong_answer(e: &TrialEngine<ManualClock, Recorder>) -> Response {
        if e.session().change_occurred_this_trial {
            Response::NoChange
        } else {
            Response::Change
        }
    }

    #[test]
    fn phases_follow_configured_timing() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.start_trial().unwrap();
        assert_eq!(e.phase(), Phase::Presenting);
        assert!(e.session().is_trial_active);
        assert!(!e.presenter().responses_enabled);

        clock.advance_ms(499);
        e.tick();
        assert_eq!(e.phase(), Phase::Presenting);

        clock.advance_ms(1);
        e.tick();
        assert_eq!(e.phase(), Phase::Blank);

        clock.advance_ms(899);
        e.tick();
        assert_eq!(e.phase(), Phase::Blank);
        assert!(e.respond(Response::Change).is_none());

        clock.advance_ms(1);
        e.tick();
        assert_matches!(e.phase(), Phase::AwaitingResponse { started_at } if started_at == Duration::from_millis(1400));
        assert!(e.presenter().responses_enabled);
        assert_eq!(e.session().test_layout.len(), 5);
    }

    #[test]
    fn response_records_elapsed_and_chains_next_trial() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.start_trial().unwrap();
        to_response(&mut e, &clock);

        clock.advance_ms(750);
        let answer = correct_answer(&e);
        assert_eq!(e.respond(answer), Some(TrialOutcome::Correct));
        assert_eq!(e.phase(), Phase::Scored);
        assert!(!e.presenter().responses_enabled);
        assert_eq!(e.session().response_times, vec![0.75]);
        assert_eq!(e.session().current_trial_index, 1);

        assert!(e.respond(answer).is_none());
        assert_eq!(e.session().current_trial_index, 1);

        clock.advance_ms(1_000);
        e.tick();
        assert_eq!(e.phase(), Phase::Presenting);
    }

    #[test]
    fn timeout_after_response_does_not_double_count() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.start_trial().unwrap();
        to_response(&mut e, &clock);

        let answer = wrong_answer(&e);
        assert_eq!(e.respond(answer), Some(TrialOutcome::Incorrect));

        clock.advance_ms(20_000);
        let events = e.tick();
        assert!(events.is_empty());
        assert_eq!(e.session().current_trial_index, 1);
        assert_eq!(e.session().trial_outcomes, vec![TrialOutcome::Incorrect]);
        assert!(e.session().validate(e.config()).is_empty());
    }

    #[test]
    fn timeout_records_limit_then_shows_notice_then_settles() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.start_trial().unwrap();
        to_response(&mut e, &clock);

        clock.advance_ms(15_000);
        let events = e.tick();
        assert_eq!(
            events,
            vec![EngineEvent::Scored {
                block: Block::Main,
                outcome: TrialOutcome::Timeout
            }]
        );
        assert_eq!(e.session().response_times, vec![15.0]);
        assert_eq!(e.session().timeout_trials(), vec![0]);
        assert_eq!(e.session().correct_count, 0);
        assert!(e.presenter().notice);
        assert!(e.respond(Response::Change).is_none());

        clock.advance_ms(1_500);
        e.tick();
        assert!(!e.presenter().notice);
        assert_eq!(e.phase(), Phase::Scored);

        clock.advance_ms(1_000);
        e.tick();
        assert_eq!(e.phase(), Phase::Presenting);
    }

    #[test]
    fn last_trial_completes_block() {
        let cfg = ExperimentConfig {
            num_trials: 2,
            ..ExperimentConfig::default()
        };
        let (mut e, clock) = engine(cfg);
        e.start_trial().unwrap();
        for _ in 0..2 {
            to_response(&mut e, &clock);
            let answer = correct_answer(&e);
            e.respond(answer);
            clock.advance_ms(1_000);
            e.tick();
        }
        assert_eq!(e.phase(), Phase::Complete);
        assert_eq!(e.presenter().completed, vec![Block::Main]);
        assert!(e.progress().is_complete);
        assert_eq!(e.pending_timers(), 0);
        assert_matches!(e.start_trial(), Err(EngineError::BlockComplete(Block::Main)));
    }

    #[test]
    fn start_rejected_mid_trial() {
        let (mut e, _clock) = engine(ExperimentConfig::default());
        e.start_trial().unwrap();
        assert_matches!(
            e.start_trial(),
            Err(EngineError::TrialInProgress(Phase::Presenting))
        );
    }

    #[test]
    fn reset_cancels_timers_and_drops_stale_ones() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        e.reset();
        assert_eq!(e.phase(), Phase::Idle);
        assert_eq!(e.pending_timers(), 0);

        clock.advance_ms(60_000);
        assert!(e.tick().is_empty());
        assert_eq!(e.session().current_trial_index, 0);
    }

    #[test]
    fn disposed_engine_refuses_work() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.start_trial().unwrap();
        e.dispose();
        clock.advance_ms(60_000);
        assert!(e.tick().is_empty());
        assert_eq!(e.start_trial(), Err(EngineError::Disposed));
        assert!(e.respond(Response::Change).is_none());
        assert_eq!(e.phase(), Phase::Disposed);
    }

    #[test]
    fn no_change_training_retries_on_miss_then_advances() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.begin_block(Block::NoChangeTraining).unwrap();
        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        assert!(!e.session().change_occurred_this_trial);
        assert_eq!(e.session().test_layout, e.session().current_layout);

        assert_eq!(e.respond(Response::Change), Some(TrialOutcome::Incorrect));
        assert_eq!(e.phase(), Phase::Retrying);
        assert_eq!(e.presenter().feedback, Some(Feedback::Incorrect));

        clock.advance_ms(4_999);
        e.tick();
        assert_matches!(e.start_trial(), Err(EngineError::TrialInProgress(Phase::Retrying)));
        clock.advance_ms(1);
        assert_eq!(
            e.tick(),
            vec![EngineEvent::Ready {
                block: Block::NoChangeTraining
            }]
        );

        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        assert_eq!(e.respond(Response::NoChange), Some(TrialOutcome::Correct));
        clock.advance_ms(2_000);
        assert_eq!(
            e.tick(),
            vec![EngineEvent::Completed(Block::NoChangeTraining)]
        );
        assert_eq!(e.session().current_trial_index, 0);
    }

    #[test]
    fn change_training_always_changes() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.begin_block(Block::ChangeTraining).unwrap();
        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        assert!(e.session().change_occurred_this_trial);
        assert_ne!(e.session().test_layout, e.session().current_layout);
    }

    #[test]
    fn training_timeout_counts_as_miss() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.begin_block(Block::ChangeTraining).unwrap();
        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        clock.advance_ms(15_000);
        let events = e.tick();
        assert_eq!(
            events,
            vec![
                EngineEvent::Scored {
                    block: Block::ChangeTraining,
                    outcome: TrialOutcome::Timeout
                },
                EngineEvent::Retrying {
                    block: Block::ChangeTraining
                },
            ]
        );
        assert_eq!(e.phase(), Phase::Retrying);
    }

    #[test]
    fn training_timeout_notice_is_transient() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.begin_block(Block::ChangeTraining).unwrap();
        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        clock.advance_ms(15_000);
        e.tick();
        assert!(e.presenter().notice);

        clock.advance_ms(1_500);
        e.tick();
        assert!(!e.presenter().notice);
        assert_eq!(e.phase(), Phase::Retrying);

        clock.advance_ms(3_500);
        e.tick();
        assert_eq!(e.phase(), Phase::Idle);
        e.start_trial().unwrap();
        assert!(!e.presenter().notice);
    }

    #[test]
    fn leaving_a_block_hides_the_timeout_notice() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.begin_block(Block::Practice).unwrap();
        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        clock.advance_ms(15_000);
        e.tick();
        assert!(e.presenter().notice);

        e.begin_block(Block::Main).unwrap();
        assert!(!e.presenter().notice);
        e.start_trial().unwrap();
        assert!(!e.presenter().notice);
    }

    #[test]
    fn response_at_the_limit_before_the_tick_is_a_timeout() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.start_trial().unwrap();
        to_response(&mut e, &clock);

        clock.advance_ms(15_030);
        let answer = correct_answer(&e);
        assert_eq!(e.respond(answer), Some(TrialOutcome::Timeout));
        assert_eq!(e.session().response_times, vec![15.0]);
        assert_eq!(e.session().trial_outcomes, vec![TrialOutcome::Timeout]);
        assert_eq!(e.session().correct_count, 0);
        assert!(e.presenter().notice);

        // The due timeout finds the trial already scored.
        assert!(e.tick().is_empty());
        assert_eq!(e.session().current_trial_index, 1);
        assert!(e.session().validate(e.config()).is_empty());
    }

    #[test]
    fn ten_instant_correct_responses_score_full_accuracy() {
        let cfg = ExperimentConfig {
            num_trials: 10,
            ..ExperimentConfig::default()
        };
        let (mut e, clock) = engine(cfg);
        e.start_trial().unwrap();
        for _ in 0..10 {
            to_response(&mut e, &clock);
            let answer = correct_answer(&e);
            assert_eq!(e.respond(answer), Some(TrialOutcome::Correct));
            clock.advance_ms(1_000);
            e.tick();
        }

        assert_eq!(e.phase(), Phase::Complete);
        let session = e.session();
        assert_eq!(session.current_trial_index, 10);
        assert_eq!(session.correct_count, 10);
        assert_eq!(session.accuracy_pct(), 100.0);
        assert_eq!(session.response_times, vec![0.0; 10]);
        assert_eq!(session.trial_outcomes, vec![TrialOutcome::Correct; 10]);
        assert!(session.timeout_trials().is_empty());
        assert!(e.progress().is_complete);
        assert!(session.validate(e.config()).is_empty());
    }

    #[test]
    fn practice_miss_restarts_whole_set() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.begin_block(Block::Practice).unwrap();
        let first_set = e.practice().trials.clone();

        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        assert_eq!(
            e.session().change_occurred_this_trial,
            first_set[0].has_change
        );
        let answer = correct_answer(&e);
        e.respond(answer);
        clock.advance_ms(1_500);
        assert_eq!(e.tick(), vec![EngineEvent::Ready { block: Block::Practice }]);
        assert_eq!(e.practice().practice_index, 1);

        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        let answer = wrong_answer(&e);
        e.respond(answer);
        clock.advance_ms(5_000);
        e.tick();

        assert_eq!(e.phase(), Phase::Idle);
        assert_eq!(e.practice().attempt_number, 2);
        assert_eq!(e.practice().practice_index, 0);
        assert_eq!(e.practice().practice_correct_count, 0);
        assert_ne!(e.practice().trials, first_set);
    }

    #[test]
    fn practice_all_correct_completes() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.begin_block(Block::Practice).unwrap();
        let mut last = vec![];
        for _ in 0..3 {
            e.start_trial().unwrap();
            to_response(&mut e, &clock);
            let answer = correct_answer(&e);
            e.respond(answer);
            clock.advance_ms(1_500);
            last = e.tick();
        }
        assert_eq!(last, vec![EngineEvent::Completed(Block::Practice)]);
        assert_eq!(e.presenter().feedback, Some(Feedback::PracticeComplete));
        assert_eq!(e.practice().attempt_number, 1);
    }

    #[test]
    fn readout_ticks_while_window_open() {
        let (mut e, clock) = engine(ExperimentConfig::default());
        e.set_readout_visible(true);
        e.start_trial().unwrap();
        to_response(&mut e, &clock);
        for _ in 0..3 {
            clock.advance_ms(100);
            e.tick();
        }
        assert_eq!(
            e.presenter().readouts,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
        let answer = correct_answer(&e);
        e.respond(answer);
        clock.advance_ms(100);
        e.tick();
        assert_eq!(e.presenter().readouts.len(), 3);
    }
}
