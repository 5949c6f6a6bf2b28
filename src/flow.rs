//! Experiment flow: which screen the participant is on and what moves them
//! to the next one.
//!
//! The flow owns the single [`TrialEngine`] and switches it between blocks
//! as stages change, the admin gate that guards every shortcut, and the
//! submitter that saves the main block's results.

use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::admin::{AdminError, AdminGate};
use crate::archive::ResultsArchive;
use crate::clock::{Clock, Scheduler, TimerHandle};
use crate::config::ExperimentConfig;
use crate::engine::{Block, EngineError, EngineEvent, Presenter, TrialEngine};
use crate::lang::Language;
use crate::network::Endpoint;
use crate::session::{Response, TrialOutcome};
use crate::storage::{self, DurableStore};
use crate::submission::{SubmissionContext, SubmitOutcome, Submitter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Connecting,
    ConnectionError,
    ParticipationWarning,
    Instructions,
    NoChangeTraining,
    ChangeTraining,
    Practice,
    Main,
    Finished,
}

impl Stage {
    /// Engine block driven while on this stage
    pub fn block(self) -> Option<Block> {
        match self {
            Stage::NoChangeTraining => Some(Block::NoChangeTraining),
            Stage::ChangeTraining => Some(Block::ChangeTraining),
            Stage::Practice => Some(Block::Practice),
            Stage::Main => Some(Block::Main),
            _ => None,
        }
    }

    fn after(block: Block) -> Stage {
        match block {
            Block::NoChangeTraining => Stage::ChangeTraining,
            Block::ChangeTraining => Stage::Practice,
            Block::Practice => Stage::Main,
            Block::Main => Stage::Finished,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FlowError {
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("instructions unlock in {0}s")]
    StillReading(u64),
    #[error("not available on the {0} screen")]
    WrongStage(Stage),
}

/// Result of the most recent save attempt
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SaveStatus {
    #[default]
    NotAttempted,
    Saved,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowTimer {
    Countdown,
}

/// Everything the flow talks to outside the engine
pub struct Services {
    pub durable: Rc<dyn DurableStore>,
    pub endpoint: Rc<dyn Endpoint>,
    pub archive: Option<ResultsArchive>,
    pub device_id: String,
    pub language: Language,
    pub admin_password: Option<String>,
}

pub struct Experiment<C: Clock + Clone, P: Presenter> {
    stage: Stage,
    engine: TrialEngine<C, P>,
    admin: AdminGate<C>,
    submitter: Submitter,
    durable: Rc<dyn DurableStore>,
    endpoint: Rc<dyn Endpoint>,
    archive: Option<ResultsArchive>,
    timers: Scheduler<C, FlowTimer>,
    countdown_timer: Option<TimerHandle>,
    countdown_started: Duration,
    countdown_remaining: u64,
    device_id: String,
    language: Language,
    save_status: SaveStatus,
    rng: StdRng,
}

impl<C: Clock + Clone, P: Presenter> Experiment<C, P> {
    pub fn new(config: ExperimentConfig, clock: C, presenter: P, mut rng: StdRng, services: Services) -> Self {
        let engine_rng = StdRng::from_rng(&mut rng).unwrap_or_else(|_| StdRng::seed_from_u64(0));
        let admin = AdminGate::new(
            services.durable.clone(),
            services.endpoint.clone(),
            services.admin_password,
            clock.clone(),
        );
        Self {
            stage: Stage::Connecting,
            engine: TrialEngine::new(config, clock.clone(), presenter, engine_rng),
            admin,
            submitter: Submitter::new(services.endpoint.clone()),
            durable: services.durable,
            endpoint: services.endpoint,
            archive: services.archive,
            timers: Scheduler::new(clock),
            countdown_timer: None,
            countdown_started: Duration::ZERO,
            countdown_remaining: 0,
            device_id: services.device_id,
            language: services.language,
            save_status: SaveStatus::NotAttempted,
            rng,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn engine(&self) -> &TrialEngine<C, P> {
        &self.engine
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        self.engine.presenter_mut()
    }

    pub fn admin(&self) -> &AdminGate<C> {
        &self.admin
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn set_language(&mut self, language: Language) {
        if language != self.language {
            info!(%language, "language changed");
        }
        self.language = language;
    }

    pub fn is_offline(&self) -> bool {
        !self.endpoint.is_configured()
    }

    pub fn countdown_remaining(&self) -> u64 {
        self.countdown_remaining
    }

    pub fn save_status(&self) -> &SaveStatus {
        &self.save_status
    }

    pub fn completion_code(&self) -> Option<&str> {
        self.submitter.completion_code()
    }

    /// Check the endpoint and previous participation, then land on the
    /// first screen the participant should see.
    pub fn start(&mut self) -> Stage {
        if self.endpoint.is_configured() {
            if let Err(err) = self.endpoint.probe() {
                warn!(%err, "endpoint unreachable");
                self.enter(Stage::ConnectionError);
                return self.stage;
            }
            info!("endpoint reachable");
        } else {
            info!("no endpoint configured, running offline");
        }

        if storage::has_participated(self.durable.as_ref(), &self.device_id) {
            info!(device_id = %self.device_id, "device already participated");
            self.enter(Stage::ParticipationWarning);
        } else {
            self.enter(Stage::Instructions);
        }
        self.stage
    }

    pub fn retry_connection(&mut self) -> Result<Stage, FlowError> {
        self.expect_stage(Stage::ConnectionError)?;
        info!("retrying connection");
        Ok(self.start())
    }

    pub fn acknowledge_instructions(&mut self) -> Result<(), FlowError> {
        self.expect_stage(Stage::Instructions)?;
        if self.countdown_remaining > 0 {
            return Err(FlowError::StillReading(self.countdown_remaining));
        }
        self.enter(Stage::NoChangeTraining);
        Ok(())
    }

    /// Start the next trial of the current block.
    pub fn start_trial(&mut self) -> Result<(), FlowError> {
        if self.stage.block().is_none() {
            return Err(FlowError::WrongStage(self.stage));
        }
        self.engine.start_trial()?;
        Ok(())
    }

    pub fn respond(&mut self, response: Response) -> Option<TrialOutcome> {
        self.stage.block()?;
        self.engine.respond(response)
    }

    /// Fire due timers, of the flow and of the engine, and follow any block
    /// completion to the next stage.
    pub fn tick(&mut self) -> Vec<EngineEvent> {
        while let Some(fired) = self.timers.pop_due() {
            match fired.event {
                FlowTimer::Countdown => self.on_countdown(),
            }
        }

        let events = self.engine.tick();
        for event in &events {
            if let EngineEvent::Completed(block) = event {
                self.on_block_complete(*block);
            }
        }
        events
    }

    /// Earliest instant anything is scheduled to happen
    pub fn next_due(&self) -> Option<Duration> {
        match (self.timers.next_due(), self.engine.next_due()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Send the results again after a failed save.
    pub fn retry_save(&mut self) -> Result<SubmitOutcome, FlowError> {
        self.expect_stage(Stage::Finished)?;
        info!("retrying save");
        Ok(self.submit())
    }

    pub fn login(&mut self, password: &str) -> Result<(), FlowError> {
        let result = self.admin.login(password);
        self.sync_admin_surfaces();
        Ok(result?)
    }

    pub fn logout(&mut self) {
        self.admin.logout();
        self.sync_admin_surfaces();
    }

    pub fn on_focus_lost(&mut self) {
        self.admin.on_focus_lost();
        self.sync_admin_surfaces();
    }

    pub fn set_admin_mode(&mut self, active: bool) -> Result<(), FlowError> {
        let result = self.admin.set_mode_active(active);
        self.sync_admin_surfaces();
        Ok(result?)
    }

    pub fn clear_local_data(&self) -> Result<usize, FlowError> {
        Ok(self.admin.clear_local_data()?)
    }

    pub fn request_clear_code(&mut self, password: &str) -> Result<(), FlowError> {
        Ok(self.admin.request_clear_code(password)?)
    }

    pub fn confirm_clear(&mut self, code: &str) -> Result<(), FlowError> {
        Ok(self.admin.confirm_clear(code)?)
    }

    pub fn cancel_clear(&mut self) {
        self.admin.cancel_clear();
    }

    pub fn bypass_participation_check(&mut self) -> Result<(), FlowError> {
        self.admin.authorize()?;
        self.expect_stage(Stage::ParticipationWarning)?;
        info!("admin bypassed participation check");
        self.enter(Stage::Instructions);
        Ok(())
    }

    pub fn skip_instructions(&mut self) -> Result<(), FlowError> {
        self.skip_stage(Stage::Instructions)
    }

    pub fn skip_no_change_training(&mut self) -> Result<(), FlowError> {
        self.skip_stage(Stage::NoChangeTraining)
    }

    pub fn skip_change_training(&mut self) -> Result<(), FlowError> {
        self.skip_stage(Stage::ChangeTraining)
    }

    pub fn skip_practice(&mut self) -> Result<(), FlowError> {
        self.skip_stage(Stage::Practice)
    }

    /// Fill the main block with perfect answers and go straight to saving.
    pub fn skip_all_trials(&mut self) -> Result<(), FlowError> {
        self.admin.authorize()?;
        if !matches!(
            self.stage,
            Stage::Instructions
                | Stage::NoChangeTraining
                | Stage::ChangeTraining
                | Stage::Practice
                | Stage::Main
        ) {
            return Err(FlowError::WrongStage(self.stage));
        }
        self.stop_countdown();
        let event = {
            let grant = self.admin.authorize()?;
            self.engine.skip_all_trials(&grant)?
        };
        if let EngineEvent::Completed(block) = event {
            self.on_block_complete(block);
        }
        Ok(())
    }

    fn skip_stage(&mut self, stage: Stage) -> Result<(), FlowError> {
        self.admin.authorize()?;
        self.expect_stage(stage)?;
        let next = match stage.block() {
            Some(block) => Stage::after(block),
            None => Stage::NoChangeTraining,
        };
        info!(from = %stage, to = %next, "admin skipped stage");
        self.enter(next);
        Ok(())
    }

    fn expect_stage(&self, stage: Stage) -> Result<(), FlowError> {
        if self.stage == stage {
            Ok(())
        } else {
            Err(FlowError::WrongStage(self.stage))
        }
    }

    fn enter(&mut self, stage: Stage) {
        if self.stage == Stage::Instructions && stage != Stage::Instructions {
            self.stop_countdown();
        }
        debug!(from = %self.stage, to = %stage, "stage change");
        self.stage = stage;

        if stage == Stage::Instructions {
            self.start_countdown();
        }
        if let Some(block) = stage.block() {
            if let Err(err) = self.engine.begin_block(block) {
                warn!(%err, %block, "could not begin block");
            }
        }
        info!(%stage, "entered stage");
    }

    fn start_countdown(&mut self) {
        self.stop_countdown();
        self.countdown_remaining = self.engine.config().instructions_countdown_secs;
        self.countdown_started = self.timers.now();
        if self.countdown_remaining > 0 {
            self.countdown_timer = Some(
                self.timers
                    .every(Duration::from_secs(1), FlowTimer::Countdown),
            );
        }
    }

    fn stop_countdown(&mut self) {
        if let Some(handle) = self.countdown_timer.take() {
            self.timers.cancel(handle);
        }
    }

    fn on_countdown(&mut self) {
        let total = self.engine.config().instructions_countdown_secs;
        let elapsed = self.timers.now().saturating_sub(self.countdown_started).as_secs();
        self.countdown_remaining = total.saturating_sub(elapsed);
        debug!(remaining = self.countdown_remaining, "instructions countdown");
        if self.countdown_remaining == 0 {
            self.stop_countdown();
        }
    }

    fn on_block_complete(&mut self, block: Block) {
        let next = Stage::after(block);
        if next == Stage::Finished {
            self.enter(Stage::Finished);
            self.submit();
        } else {
            self.enter(next);
        }
    }

    fn submit(&mut self) -> SubmitOutcome {
        let ctx = SubmissionContext {
            device_id: self.device_id.clone(),
            language: self.language,
            admin_mode: self.admin.mode_active(),
        };
        let outcome = self
            .submitter
            .finalize(self.engine.session_mut(), &ctx, &mut self.rng);

        if let (Some(payload), Some(delivery), Some(archive)) =
            (self.submitter.payload(), outcome.delivery(), &self.archive)
        {
            if let Err(err) = archive.record(payload, delivery) {
                warn!(%err, "could not archive session");
            }
        }

        match &outcome {
            SubmitOutcome::Sent(_) => {
                self.save_status = SaveStatus::Saved;
                if ctx.admin_mode {
                    info!("admin mode active, participation not recorded");
                } else if let Err(err) =
                    storage::record_participation(self.durable.as_ref(), &self.device_id)
                {
                    warn!(%err, "could not record participation");
                }
            }
            SubmitOutcome::AlreadySubmitted => self.save_status = SaveStatus::Saved,
            SubmitOutcome::Failed(reason) => self.save_status = SaveStatus::Failed(reason.clone()),
        }
        outcome
    }

    fn sync_admin_surfaces(&mut self) {
        let visible = self.admin.privileged_controls_visible();
        self.engine.set_readout_visible(visible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{NullPresenter, Phase};
    use crate::network::ScriptedEndpoint;
    use crate::storage::MemoryStore;
    use assert_matches::assert_matches;

    struct Fixture {
        flow: Experiment<ManualClock, NullPresenter>,
        clock: ManualClock,
        endpoint: Rc<ScriptedEndpoint>,
        store: Rc<MemoryStore>,
    }

    fn fixture_with(cfg: ExperimentConfig, store: Rc<MemoryStore>) -> Fixture {
        let clock = ManualClock::new();
        let endpoint = Rc::new(ScriptedEndpoint::new());
        let flow = Experiment::new(
            cfg,
            clock.clone(),
            NullPresenter,
            StdRng::seed_from_u64(17),
            Services {
                durable: store.clone(),
                endpoint: endpoint.clone(),
                archive: Some(ResultsArchive::open_in_memory().unwrap()),
                device_id: "0badcafe".into(),
                language: Language::En,
                admin_password: Some("secret".into()),
            },
        );
        Fixture {
            flow,
            clock,
            endpoint,
            store,
        }
    }

    fn fixture() -> Fixture {
        let cfg = ExperimentConfig {
            num_trials: 3,
            ..ExperimentConfig::default()
        };
        fixture_with(cfg, Rc::new(MemoryStore::new()))
    }

    /// Run the current trial up to its response window and answer.
    fn answer(f: &mut Fixture, correct: bool) -> TrialOutcome {
        f.clock.advance_ms(500);
        f.flow.tick();
        f.clock.advance_ms(900);
        f.flow.tick();
        assert_matches!(f.flow.engine().phase(), Phase::AwaitingResponse { .. });
        let change = f.flow.engine().session().change_occurred_this_trial;
        let response = match (change, correct) {
            (true, true) | (false, false) => Response::Change,
            _ => Response::NoChange,
        };
        f.flow.respond(response).unwrap()
    }

    fn read_instructions(f: &mut Fixture) {
        for _ in 0..5 {
            f.clock.advance_ms(1000);
            f.flow.tick();
        }
        f.flow.acknowledge_instructions().unwrap();
    }

    fn pass_training(f: &mut Fixture) {
        f.flow.start_trial().unwrap();
        assert_eq!(answer(f, true), TrialOutcome::Correct);
        f.clock.advance_ms(2000);
        f.flow.tick();
    }

    #[test]
    fn unreachable_endpoint_blocks_until_retry() {
        let mut f = fixture();
        f.endpoint.set_unreachable(true);
        assert_eq!(f.flow.start(), Stage::ConnectionError);
        assert_matches!(f.flow.start_trial(), Err(FlowError::WrongStage(Stage::ConnectionError)));

        f.endpoint.set_unreachable(false);
        assert_eq!(f.flow.retry_connection().unwrap(), Stage::Instructions);
        assert_matches!(f.flow.retry_connection(), Err(FlowError::WrongStage(_)));
    }

    #[test]
    fn instructions_unlock_after_countdown() {
        let mut f = fixture();
        f.flow.start();
        assert_eq!(f.flow.countdown_remaining(), 5);
        assert_eq!(f.flow.acknowledge_instructions(), Err(FlowError::StillReading(5)));

        f.clock.advance_ms(3000);
        f.flow.tick();
        assert_eq!(f.flow.countdown_remaining(), 2);

        f.clock.advance_ms(2000);
        f.flow.tick();
        assert_eq!(f.flow.countdown_remaining(), 0);
        f.flow.acknowledge_instructions().unwrap();
        assert_eq!(f.flow.stage(), Stage::NoChangeTraining);
        assert_eq!(f.flow.engine().block(), Block::NoChangeTraining);
        assert_eq!(f.flow.next_due(), None);
    }

    #[test]
    fn full_walk_submits_and_records_participation() {
        let mut f = fixture();
        f.flow.start();
        read_instructions(&mut f);

        pass_training(&mut f);
        assert_eq!(f.flow.stage(), Stage::ChangeTraining);
        pass_training(&mut f);
        assert_eq!(f.flow.stage(), Stage::Practice);

        for _ in 0..3 {
            f.flow.start_trial().unwrap();
            answer(&mut f, true);
            f.clock.advance_ms(1500);
            f.flow.tick();
        }
        assert_eq!(f.flow.stage(), Stage::Main);

        f.flow.start_trial().unwrap();
        for _ in 0..3 {
            answer(&mut f, true);
            f.clock.advance_ms(1000);
            f.flow.tick();
        }

        assert_eq!(f.flow.stage(), Stage::Finished);
        assert_eq!(f.flow.save_status(), &SaveStatus::Saved);
        let code = f.flow.completion_code().unwrap();
        assert_eq!(code.len(), 8);

        let payloads = f.endpoint.sent_with_action(None);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["trialsCompleted"], 3);
        assert_eq!(payloads[0]["trialStatuses"], "correct,correct,correct");
        assert!(storage::has_participated(f.store.as_ref(), "0badcafe"));
    }

    #[test]
    fn previous_participant_is_stopped() {
        let store = Rc::new(MemoryStore::new());
        storage::record_participation(store.as_ref(), "0badcafe").unwrap();
        let mut f = fixture_with(ExperimentConfig::default(), store);

        assert_eq!(f.flow.start(), Stage::ParticipationWarning);
        assert_matches!(
            f.flow.bypass_participation_check(),
            Err(FlowError::Admin(AdminError::NotAuthenticated))
        );

        f.flow.login("secret").unwrap();
        f.flow.bypass_participation_check().unwrap();
        assert_eq!(f.flow.stage(), Stage::Instructions);
    }

    #[test]
    fn skips_need_live_authentication() {
        let mut f = fixture();
        f.flow.start();
        assert_matches!(
            f.flow.skip_instructions(),
            Err(FlowError::Admin(AdminError::NotAuthenticated))
        );

        f.flow.login("secret").unwrap();
        f.flow.skip_instructions().unwrap();
        f.flow.skip_no_change_training().unwrap();
        assert_eq!(f.flow.stage(), Stage::ChangeTraining);

        f.flow.on_focus_lost();
        assert_matches!(
            f.flow.skip_change_training(),
            Err(FlowError::Admin(AdminError::NotAuthenticated))
        );
        assert_eq!(f.flow.stage(), Stage::ChangeTraining);
    }

    #[test]
    fn skip_all_trials_in_admin_mode_does_not_record_participation() {
        let mut f = fixture();
        f.flow.start();
        f.flow.login("secret").unwrap();
        f.flow.set_admin_mode(true).unwrap();
        f.flow.skip_all_trials().unwrap();

        assert_eq!(f.flow.stage(), Stage::Finished);
        let sent = f.endpoint.sent_with_action(None);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["adminMode"], true);
        assert_eq!(sent[0]["correctResponses"], 3);
        assert_eq!(sent[0]["responseTimes"], "0.50,0.50,0.50");
        assert!(!storage::has_participated(f.store.as_ref(), "0badcafe"));
        assert_eq!(f.flow.next_due(), None);
    }

    #[test]
    fn failed_save_can_be_retried_once() {
        let mut f = fixture();
        f.flow.start();
        f.flow.login("secret").unwrap();
        f.endpoint.set_unreachable(true);
        f.flow.skip_all_trials().unwrap();
        assert_matches!(f.flow.save_status(), SaveStatus::Failed(_));
        assert!(!storage::has_participated(f.store.as_ref(), "0badcafe"));
        let code = f.flow.completion_code().unwrap().to_string();

        f.endpoint.set_unreachable(false);
        assert_eq!(
            f.flow.retry_save().unwrap(),
            SubmitOutcome::Sent(crate::submission::Delivery::Confirmed)
        );
        assert_eq!(f.flow.retry_save().unwrap(), SubmitOutcome::AlreadySubmitted);
        assert_eq!(f.flow.completion_code(), Some(code.as_str()));
        assert_eq!(f.endpoint.sent_with_action(None).len(), 1);
        assert!(storage::has_participated(f.store.as_ref(), "0badcafe"));
    }

    #[test]
    fn training_miss_waits_for_retry() {
        let mut f = fixture();
        f.flow.start();
        read_instructions(&mut f);

        f.flow.start_trial().unwrap();
        assert_eq!(answer(&mut f, false), TrialOutcome::Incorrect);
        assert_eq!(f.flow.engine().phase(), Phase::Retrying);
        assert_matches!(f.flow.start_trial(), Err(FlowError::Engine(_)));

        f.clock.advance_ms(5000);
        f.flow.tick();
        assert_eq!(f.flow.engine().phase(), Phase::Idle);
        assert_eq!(f.flow.stage(), Stage::NoChangeTraining);
        pass_training(&mut f);
        assert_eq!(f.flow.stage(), Stage::ChangeTraining);
    }

    #[test]
    fn responses_outside_trial_stages_are_ignored() {
        let mut f = fixture();
        f.flow.start();
        assert_eq!(f.flow.respond(Response::Change), None);
    }
}
