use tracing::{debug, warn};

use crate::config::{RbConfig, StimulusConfig};
use crate::rng::SeededRng;
use crate::trial::{Block, Label, Trial};

/// Builds the rule-based block for `participant`.
///
/// Every sweep visits each (stripe level, anchor) pair once, jitters the
/// anchor and files the trial under its label while that label is below
/// quota. Sweeps stop when both labels are full or `max_sweeps` is spent;
/// in the latter case the list comes back short rather than padded.
pub fn build_rb_trials(
    participant: &str,
    stim: &StimulusConfig,
    rb: &RbConfig,
) -> Vec<Trial> {
    let mut rng = SeededRng::from_seed(&Block::RuleBased.seed(participant));
    let quota = rb.trials / 2;
    let mut trials_a: Vec<Trial> = Vec::with_capacity(quota);
    let mut trials_b: Vec<Trial> = Vec::with_capacity(quota);

    let mut sweeps = 0;
    while (trials_a.len() < quota || trials_b.len() < quota) && sweeps < rb.max_sweeps {
        sweeps += 1;
        for &stripes in &stim.stripe_levels {
            for &anchor in &rb.anchors {
                let orientation = rng.jitter(
                    anchor,
                    rb.jitter,
                    stim.orientation_min,
                    stim.orientation_max,
                );
                let trial = Trial::rule_based(stripes, orientation, rb);
                let bin = match trial.label {
                    Label::A => &mut trials_a,
                    Label::B => &mut trials_b,
                };
                if bin.len() < quota {
                    bin.push(trial);
                }
            }
        }
    }

    if trials_a.len() < quota || trials_b.len() < quota {
        warn!(
            participant,
            sweeps,
            have_a = trials_a.len(),
            have_b = trials_b.len(),
            quota,
            "rb sweep cap reached before both labels filled; block will be short"
        );
    }

    let mut combined = trials_a;
    combined.append(&mut trials_b);
    rng.shuffle(&mut combined);
    debug!(participant, sweeps, trials = combined.len(), "rb sequence built");
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::rb_label;

    fn count(trials: &[Trial], label: Label) -> usize {
        trials.iter().filter(|t| t.label == label).count()
    }

    #[test]
    fn same_participant_same_sequence() {
        let stim = StimulusConfig::default();
        let rb = RbConfig::default();
        let first = build_rb_trials("S-042", &stim, &rb);
        let second = build_rb_trials("S-042", &stim, &rb);
        assert_eq!(first, second);
        assert_ne!(first, build_rb_trials("S-043", &stim, &rb));
    }

    #[test]
    fn labels_are_balanced_and_follow_the_rule() {
        let stim = StimulusConfig::default();
        let rb = RbConfig::default();
        for participant in ["alpha", "beta", "gamma", "P001", ""] {
            let trials = build_rb_trials(participant, &stim, &rb);
            assert_eq!(trials.len(), rb.trials);
            assert_eq!(count(&trials, Label::A), rb.trials / 2);
            assert_eq!(count(&trials, Label::B), rb.trials / 2);
            for t in &trials {
                assert_eq!(t.block, Block::RuleBased);
                assert_eq!(t.label, rb_label(t.orientation, rb.threshold));
                assert!(t.orientation >= stim.orientation_min);
                assert!(t.orientation <= stim.orientation_max);
                assert!(stim.stripe_levels.contains(&t.stripes));
            }
        }
    }

    #[test]
    fn output_is_shuffled_not_grouped() {
        let trials = build_rb_trials("shuffle", &StimulusConfig::default(), &RbConfig::default());
        let first_half_a = count(&trials[..100], Label::A);
        assert!(first_half_a > 20 && first_half_a < 80, "got {}", first_half_a);
    }

    #[test]
    fn starved_label_yields_short_list() {
        let stim = StimulusConfig::default();
        let rb = RbConfig {
            threshold: 0.0,
            trials: 40,
            max_sweeps: 50,
            ..RbConfig::default()
        };
        let trials = build_rb_trials("starved", &stim, &rb);
        assert_eq!(count(&trials, Label::A), 0);
        assert_eq!(count(&trials, Label::B), 20);
        assert_eq!(trials.len(), 20);
    }

    #[test]
    fn small_block_is_balanced() {
        let stim = StimulusConfig::default();
        let rb = RbConfig {
            trials: 6,
            ..RbConfig::default()
        };
        let trials = build_rb_trials("tiny", &stim, &rb);
        assert_eq!(trials.len(), 6);
        assert_eq!(count(&trials, Label::A), 3);
    }
}
