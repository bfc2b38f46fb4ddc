use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::{IiConfig, RbConfig, StimulusConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Block {
    #[serde(rename = "RB")]
    RuleBased,
    #[serde(rename = "II")]
    InformationIntegration,
}

impl Block {
    pub fn as_str(&self) -> &'static str {
        match self {
            Block::RuleBased => "RB",
            Block::InformationIntegration => "II",
        }
    }

    /// Suffix appended to the participant id to seed this block's builder.
    pub fn seed(&self, participant: &str) -> String {
        format!("{}_{}", participant, self.as_str())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    A,
    B,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::A => "A",
            Label::B => "B",
        }
    }

    pub fn expected_response(&self) -> Response {
        match self {
            Label::A => Response::A,
            Label::B => Response::B,
        }
    }
}

/// A participant's answer, as routed by the input arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    A,
    B,
}

impl Response {
    pub fn as_str(&self) -> &'static str {
        match self {
            Response::A => "a",
            Response::B => "b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trial {
    pub block: Block,
    pub stripes: u32,
    pub orientation: f64,
    pub label: Label,
}

impl Trial {
    pub fn rule_based(stripes: u32, orientation: f64, rb: &RbConfig) -> Self {
        Self {
            block: Block::RuleBased,
            stripes,
            orientation,
            label: rb_label(orientation, rb.threshold),
        }
    }

    pub fn integration(
        stripes: u32,
        orientation: f64,
        stim: &StimulusConfig,
        ii: &IiConfig,
    ) -> Self {
        Self {
            block: Block::InformationIntegration,
            stripes,
            orientation,
            label: ii_label(stripes, orientation, stim, ii),
        }
    }
}

/// Single-dimension rule: stripe level plays no part.
pub fn rb_label(orientation: f64, threshold: f64) -> Label {
    if orientation.abs() <= threshold {
        Label::A
    } else {
        Label::B
    }
}

pub fn ii_score(stripes: u32, orientation: f64, stim: &StimulusConfig, ii: &IiConfig) -> f64 {
    let x = stim.normalize_stripes(stripes);
    let y = stim.normalize_orientation(orientation);
    ii.w_sf * x + ii.w_ori * y - ii.bias
}

pub fn ii_label(stripes: u32, orientation: f64, stim: &StimulusConfig, ii: &IiConfig) -> Label {
    if ii_score(stripes, orientation, stim, ii) > 0.0 {
        Label::A
    } else {
        Label::B
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Responded,
    TimedOut,
    Aborted,
}

/// One executed trial. Appended once to the session log and never touched again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialResult {
    pub trial: Trial,
    /// 1-based position within the block.
    pub index: usize,
    pub response: Option<Response>,
    pub correct: bool,
    pub reaction_time: Option<Duration>,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
}

impl TrialResult {
    /// Aborted trials carry the timeout flag too, matching the exported log.
    pub fn timeout_flag(&self) -> bool {
        matches!(self.outcome, Outcome::TimedOut | Outcome::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rb_boundaries() {
        assert_eq!(rb_label(-15.0, 7.0), Label::B);
        assert_eq!(rb_label(0.0, 7.0), Label::A);
        assert_eq!(rb_label(7.0, 7.0), Label::A);
        assert_eq!(rb_label(-7.0, 7.0), Label::A);
        assert_eq!(rb_label(7.0001, 7.0), Label::B);
    }

    #[test]
    fn rb_ignores_stripes() {
        let rb = RbConfig::default();
        for stripes in [3, 4, 5, 6] {
            assert_eq!(Trial::rule_based(stripes, 2.0, &rb).label, Label::A);
            assert_eq!(Trial::rule_based(stripes, 12.0, &rb).label, Label::B);
        }
    }

    #[test]
    fn ii_discriminant_extremes() {
        let stim = StimulusConfig::default();
        let ii = IiConfig::default();
        let high = ii_score(6, 15.0, &stim, &ii);
        assert!((high - 0.5).abs() < 1e-9, "score {}", high);
        assert_eq!(ii_label(6, 15.0, &stim, &ii), Label::A);

        let low = ii_score(3, -15.0, &stim, &ii);
        assert!((low + 2.3).abs() < 1e-9, "score {}", low);
        assert_eq!(ii_label(3, -15.0, &stim, &ii), Label::B);
    }

    #[test]
    fn ii_zero_score_is_b() {
        let stim = StimulusConfig::default();
        let ii = IiConfig {
            w_sf: 0.0,
            w_ori: 0.0,
            bias: 0.0,
            ..IiConfig::default()
        };
        assert_eq!(ii_label(6, 15.0, &stim, &ii), Label::B);
    }

    #[test]
    fn ii_needs_both_dimensions() {
        let stim = StimulusConfig::default();
        let ii = IiConfig::default();
        // Neither maximal stripes alone nor maximal tilt alone crosses the bound.
        assert_eq!(ii_label(6, 0.0, &stim, &ii), Label::B);
        assert_eq!(ii_label(4, 15.0, &stim, &ii), Label::B);
        assert_eq!(ii_label(6, 12.0, &stim, &ii), Label::A);
    }

    #[test]
    fn block_seeds_are_distinct() {
        assert_eq!(Block::RuleBased.seed("p1"), "p1_RB");
        assert_eq!(Block::InformationIntegration.seed("p1"), "p1_II");
    }
}
