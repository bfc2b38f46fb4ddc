use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::ExperimentConfig;
use crate::display::StimulusDisplay;
use crate::ii::build_ii_trials;
use crate::input::InputArbiter;
use crate::rb::build_rb_trials;
use crate::runner::{Flow, TrialRunner};
use crate::trial::{Block, Trial, TrialResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Aborted,
}

/// Receives the finished session exactly once.
pub trait SessionExporter {
    fn export(&mut self, session: &Session) -> Result<()>;
}

/// One participant's run: the append-only result log plus its end state.
#[derive(Debug, Clone)]
pub struct Session {
    participant: String,
    results: Vec<TrialResult>,
    outcome: Option<SessionOutcome>,
}

impl Session {
    pub fn new(participant: &str) -> Self {
        Self {
            participant: participant.to_string(),
            results: Vec::new(),
            outcome: None,
        }
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn results(&self) -> &[TrialResult] {
        &self.results
    }

    pub fn results_for(&self, block: Block) -> impl Iterator<Item = &TrialResult> {
        self.results.iter().filter(move |r| r.trial.block == block)
    }

    pub fn record(&mut self, result: TrialResult) {
        if self.outcome.is_some() {
            warn!(index = result.index, "result arrived after finalize; ignored");
            return;
        }
        self.results.push(result);
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome
    }

    pub fn is_aborted(&self) -> bool {
        self.outcome == Some(SessionOutcome::Aborted)
    }

    /// Seals the session and hands it to `exporter`. Only the first call has
    /// any effect; it returns `true` when this call did the finalizing.
    pub fn finalize(
        &mut self,
        outcome: SessionOutcome,
        exporter: &mut dyn SessionExporter,
    ) -> Result<bool> {
        if self.outcome.is_some() {
            return Ok(false);
        }
        self.outcome = Some(outcome);
        info!(
            participant = %self.participant,
            ?outcome,
            trials = self.results.len(),
            "session finalized"
        );
        exporter.export(self)?;
        Ok(true)
    }
}

/// Runs the RB block, then the II block, then finalizes once.
///
/// Owns the session-wide abort token: the arbiter's fallback abort handler
/// cancels it, which interrupts whichever phase is waiting.
pub struct SessionController<'a> {
    config: &'a ExperimentConfig,
    arbiter: Arc<InputArbiter>,
    cancel: CancelToken,
}

impl<'a> SessionController<'a> {
    pub fn new(config: &'a ExperimentConfig, arbiter: Arc<InputArbiter>) -> Self {
        let cancel = CancelToken::new();
        let on_abort = cancel.clone();
        arbiter.set_global_abort_handler(Arc::new(move || {
            if !on_abort.is_cancelled() {
                info!("abort requested outside a trial");
            }
            on_abort.cancel();
        }));
        Self {
            config,
            arbiter,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(
        self,
        participant: &str,
        display: &mut dyn StimulusDisplay,
        exporter: &mut dyn SessionExporter,
    ) -> Result<Session> {
        let mut session = Session::new(participant);
        let config = self.config;
        let fullscreen = display.request_fullscreen();
        info!(participant, fullscreen, "session started");

        let rb = build_rb_trials(participant, &config.stimulus, &config.rb);
        let mut flow = self.run_block(Block::RuleBased, &rb, display, &mut session);

        if flow == Flow::Continue && !self.cancel.is_cancelled() {
            let ii = build_ii_trials(participant, &config.stimulus, &config.ii);
            flow = self.run_block(Block::InformationIntegration, &ii, display, &mut session);
        }

        let outcome = if flow == Flow::Stop || self.cancel.is_cancelled() {
            SessionOutcome::Aborted
        } else {
            SessionOutcome::Completed
        };
        session.finalize(outcome, exporter)?;
        Ok(session)
    }

    fn run_block(
        &self,
        block: Block,
        trials: &[Trial],
        display: &mut dyn StimulusDisplay,
        session: &mut Session,
    ) -> Flow {
        info!(%block, trials = trials.len(), "block started");
        let runner = TrialRunner::new(&self.arbiter, &self.config.timing, &self.cancel);
        for (i, trial) in trials.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Flow::Stop;
            }
            if runner.run(display, session, trial, i + 1) == Flow::Stop {
                info!(%block, completed = i, "block stopped early");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }
}
