use tracing::{debug, info};

/// Outcome shown during the feedback phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Correct,
    Wrong,
    Aborting,
}

impl Feedback {
    pub fn text(&self) -> &'static str {
        match self {
            Feedback::Correct => "Correct",
            Feedback::Wrong => "Wrong",
            Feedback::Aborting => "Aborting...",
        }
    }
}

/// Rendering seam. Implementations draw; the trial runner decides when.
pub trait StimulusDisplay {
    /// Best-effort request for an exclusive full-screen surface. Returns
    /// whether it was granted; a refusal is not an error.
    fn request_fullscreen(&mut self) -> bool {
        false
    }
    fn fixation(&mut self);
    fn blank(&mut self);
    /// Render request for one grating.
    fn stimulus(&mut self, orientation: f64, stripes: u32);
    /// Clears the stimulus and shows the outcome.
    fn feedback(&mut self, feedback: Feedback);
}

/// Headless display that reports each phase through `tracing`.
#[derive(Debug, Default)]
pub struct TracingDisplay {
    pub stimuli_shown: usize,
}

impl StimulusDisplay for TracingDisplay {
    fn fixation(&mut self) {
        debug!("display: fixation");
    }

    fn blank(&mut self) {
        debug!("display: blank");
    }

    fn stimulus(&mut self, orientation: f64, stripes: u32) {
        self.stimuli_shown += 1;
        info!(
            orientation = format!("{:.3}", orientation),
            stripes, "display: stimulus"
        );
    }

    fn feedback(&mut self, feedback: Feedback) {
        info!(feedback = feedback.text(), "display: feedback");
    }
}
