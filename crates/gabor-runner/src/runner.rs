use chrono::Utc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::TimingConfig;
use crate::display::{Feedback, StimulusDisplay};
use crate::input::{InputArbiter, TrialSignal};
use crate::session::Session;
use crate::trial::{Outcome, Response, Trial, TrialResult};

/// What the caller should do after a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resolution {
    Responded {
        response: Response,
        reaction_time: Duration,
    },
    TimedOut,
    Aborted,
}

/// Drives one trial at a time through
/// fixation -> preblank -> stimulus/response -> feedback -> inter-trial.
///
/// The response window resolves on the first of: a response, the response
/// limit, or an abort. The trial's input slots are released before the
/// result is recorded, so nothing that arrives later can leak into the next
/// trial.
pub struct TrialRunner<'a> {
    arbiter: &'a InputArbiter,
    timing: &'a TimingConfig,
    cancel: &'a CancelToken,
}

impl<'a> TrialRunner<'a> {
    pub fn new(arbiter: &'a InputArbiter, timing: &'a TimingConfig, cancel: &'a CancelToken) -> Self {
        Self {
            arbiter,
            timing,
            cancel,
        }
    }

    pub fn run(
        &self,
        display: &mut dyn StimulusDisplay,
        session: &mut Session,
        trial: &Trial,
        index: usize,
    ) -> Flow {
        let started_at = Utc::now();

        if let Some(fixation) = self.timing.fixation() {
            display.fixation();
            if self.cancel.wait_timeout(fixation) {
                return self.abandon(trial, index, "fixation");
            }
        }
        if let Some(preblank) = self.timing.preblank() {
            display.blank();
            if self.cancel.wait_timeout(preblank) {
                return self.abandon(trial, index, "preblank");
            }
        }
        if self.cancel.is_cancelled() {
            return self.abandon(trial, index, "stimulus");
        }

        let mut subscription = self.arbiter.subscribe();
        let onset = Instant::now();
        display.stimulus(trial.orientation, trial.stripes);

        let resolution = match subscription.recv_timeout(self.timing.response_limit()) {
            Ok(signal) => resolve(signal, onset),
            Err(RecvTimeoutError::Timeout) => Resolution::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                // Another owner took the slots; nothing can reach us now.
                let remaining = (onset + self.timing.response_limit())
                    .saturating_duration_since(Instant::now());
                if self.cancel.wait_timeout(remaining) {
                    Resolution::Aborted
                } else {
                    Resolution::TimedOut
                }
            }
        };
        let (resolution, stop_after) = settle(resolution, &subscription.close());
        if stop_after {
            debug!(index, "abort arrived after the trial resolved; stopping session");
            self.cancel.cancel();
        }

        let expected = trial.label.expected_response();
        let result = match resolution {
            Resolution::Responded {
                response,
                reaction_time,
            } => TrialResult {
                trial: *trial,
                index,
                response: Some(response),
                correct: response == expected,
                reaction_time: Some(reaction_time),
                outcome: Outcome::Responded,
                started_at,
            },
            Resolution::TimedOut => TrialResult {
                trial: *trial,
                index,
                response: None,
                correct: false,
                reaction_time: None,
                outcome: Outcome::TimedOut,
                started_at,
            },
            Resolution::Aborted => TrialResult {
                trial: *trial,
                index,
                response: None,
                correct: false,
                reaction_time: None,
                outcome: Outcome::Aborted,
                started_at,
            },
        };
        debug!(
            block = %trial.block,
            index,
            outcome = ?result.outcome,
            correct = result.correct,
            rt_ms = result.reaction_time.map(|d| d.as_millis() as u64),
            "trial resolved"
        );
        let feedback = match result.outcome {
            Outcome::Responded if result.correct => Feedback::Correct,
            Outcome::Responded | Outcome::TimedOut => Feedback::Wrong,
            Outcome::Aborted => Feedback::Aborting,
        };
        session.record(result);

        display.feedback(feedback);
        if resolution == Resolution::Aborted {
            thread::sleep(self.timing.feedback());
            self.cancel.cancel();
            return Flow::Stop;
        }
        if self.cancel.wait_timeout(self.timing.feedback()) {
            return Flow::Stop;
        }
        display.blank();
        if let Some(iti) = self.timing.inter_trial() {
            if self.cancel.wait_timeout(iti) {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn abandon(&self, trial: &Trial, index: usize, phase: &str) -> Flow {
        debug!(block = %trial.block, index, phase, "session aborted before stimulus; trial dropped");
        Flow::Stop
    }
}

/// Reconciles the winning event with whatever was still queued when the
/// slots were released. Returns the final resolution and whether the session
/// must stop after this trial.
fn settle(resolution: Resolution, late: &[TrialSignal]) -> (Resolution, bool) {
    let late_abort = late.contains(&TrialSignal::Abort);
    match resolution {
        // An abort queued alongside the expiring timer still wins.
        Resolution::TimedOut if late_abort => (Resolution::Aborted, false),
        Resolution::Aborted => (Resolution::Aborted, false),
        other => (other, late_abort),
    }
}

fn resolve(signal: TrialSignal, onset: Instant) -> Resolution {
    match signal {
        TrialSignal::Abort => Resolution::Aborted,
        TrialSignal::Response { response, at } => Resolution::Responded {
            response,
            reaction_time: at.saturating_duration_since(onset),
        },
    }
}
