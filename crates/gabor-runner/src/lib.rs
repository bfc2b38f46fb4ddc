//! Two-block visual categorization experiment: seeded trial sequences for a
//! rule-based (RB) and an information-integration (II) block, and the timed
//! trial engine that runs them against keyboard, pointer and controller
//! input.

pub mod cancel;
pub mod config;
pub mod display;
pub mod export;
pub mod gamepad;
pub mod ii;
pub mod input;
pub mod rb;
pub mod rng;
pub mod runner;
pub mod session;
pub mod trial;

pub use cancel::CancelToken;
pub use config::{load_config, write_default_config, ConfigError, ExperimentConfig};
pub use display::{Feedback, StimulusDisplay, TracingDisplay};
pub use export::{rows_to_csv, session_rows, CsvExporter};
pub use gamepad::{ControllerPoller, EdgeTracker, GamepadSource, NoGamepads, PadAction, PadSnapshot};
pub use ii::{build_ii_sequence, build_ii_trials, IiSequence};
pub use input::{InputArbiter, KeyDisposition, PointerCapability, PressKind};
pub use rb::build_rb_trials;
pub use rng::SeededRng;
pub use runner::{Flow, TrialRunner};
pub use session::{Session, SessionController, SessionExporter, SessionOutcome};
pub use trial::{Block, Label, Outcome, Response, Trial, TrialResult};

/// Builds the trial list for `block` as a session would.
pub fn build_block(config: &ExperimentConfig, participant: &str, block: Block) -> Vec<Trial> {
    match block {
        Block::RuleBased => build_rb_trials(participant, &config.stimulus, &config.rb),
        Block::InformationIntegration => {
            build_ii_trials(participant, &config.stimulus, &config.ii)
        }
    }
}
