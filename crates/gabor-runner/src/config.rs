use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::input::PointerCapability;
use crate::trial::Response;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{block} trial count must be even, got {trials}")]
    OddTrialCount { block: &'static str, trials: usize },
    #[error("stimulus.stripe_levels must not be empty")]
    EmptyStripeLevels,
    #[error("stimulus orientation range is inverted or empty: [{min}, {max}]")]
    InvertedRange { min: f64, max: f64 },
    #[error("rb.anchors must not be empty")]
    EmptyAnchors,
    #[error("ii.buckets must not be empty")]
    NoBuckets,
    #[error("ii.buckets[{index}] is degenerate: [{min}, {max}]")]
    DegenerateBucket { index: usize, min: f64, max: f64 },
    #[error("ii.buckets[{index}] lies outside the orientation range")]
    BucketOutOfRange { index: usize },
    #[error("ii.buckets[{index}] is not wider than twice ii.edge_inset ({inset})")]
    BucketNarrowerThanInset { index: usize, inset: f64 },
    #[error("ii.{field} must be a finite, non-negative number, got {value}")]
    InvalidJitterShape { field: &'static str, value: f64 },
    #[error("input.gamepad.{action} must list at least one button")]
    EmptyButtonSet { action: &'static str },
    #[error("input key '{key}' is bound to more than one action")]
    ConflictingKeys { key: String },
    #[error("input.poll_interval_ms must be positive")]
    ZeroPollInterval,
    #[error("timing.response_limit_ms must be positive")]
    ZeroResponseLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    pub stimulus: StimulusConfig,
    pub rb: RbConfig,
    pub ii: IiConfig,
    pub timing: TimingConfig,
    pub input: InputConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            stimulus: StimulusConfig::default(),
            rb: RbConfig::default(),
            ii: IiConfig::default(),
            timing: TimingConfig::default(),
            input: InputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StimulusConfig {
    pub orientation_min: f64,
    pub orientation_max: f64,
    /// Visible light+dark band counts, a proxy for spatial frequency.
    pub stripe_levels: Vec<u32>,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            orientation_min: -15.0,
            orientation_max: 15.0,
            stripe_levels: vec![3, 4, 5, 6],
        }
    }
}

impl StimulusConfig {
    /// Maps a stripe level onto [-1, 1] across the configured levels.
    pub fn normalize_stripes(&self, stripes: u32) -> f64 {
        let lo = self.stripe_levels.iter().copied().min().unwrap_or(stripes) as f64;
        let hi = self.stripe_levels.iter().copied().max().unwrap_or(stripes) as f64;
        normalize(stripes as f64, lo, hi)
    }

    /// Maps an orientation onto [-1, 1] across the orientation range.
    pub fn normalize_orientation(&self, orientation: f64) -> f64 {
        normalize(orientation, self.orientation_min, self.orientation_max)
    }
}

fn normalize(value: f64, lo: f64, hi: f64) -> f64 {
    let half = (hi - lo) / 2.0;
    if half <= 0.0 {
        return 0.0;
    }
    (value - (lo + hi) / 2.0) / half
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RbConfig {
    pub trials: usize,
    pub anchors: Vec<f64>,
    pub jitter: f64,
    /// `|orientation| <= threshold` is category A.
    pub threshold: f64,
    pub max_sweeps: usize,
}

impl Default for RbConfig {
    fn default() -> Self {
        Self {
            trials: 200,
            anchors: vec![-15.0, -9.0, -3.0, 3.0, 9.0, 15.0],
            jitter: 2.4,
            threshold: 7.0,
            max_sweeps: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IiConfig {
    pub trials: usize,
    pub buckets: Vec<[f64; 2]>,
    pub w_sf: f64,
    pub w_ori: f64,
    pub bias: f64,
    pub enforce_bucket_balance: bool,
    pub max_rounds: usize,
    /// Extra candidates per bucket/label before generation may stop early.
    pub surplus: usize,
    /// Jitter width as a fraction of bucket width.
    pub jitter_fraction: f64,
    /// Keeps jittered samples this far inside their bucket edges.
    pub edge_inset: f64,
}

impl Default for IiConfig {
    fn default() -> Self {
        Self {
            trials: 200,
            buckets: vec![
                [-15.0, -9.0],
                [-9.0, -3.0],
                [-3.0, 3.0],
                [3.0, 9.0],
                [9.0, 15.0],
            ],
            w_sf: 0.6,
            w_ori: 0.8,
            bias: 0.9,
            enforce_bucket_balance: true,
            max_rounds: 400,
            surplus: 4,
            jitter_fraction: 0.6,
            edge_inset: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub use_fixation: bool,
    pub fixation_ms: u64,
    pub use_preblank: bool,
    pub preblank_ms: u64,
    pub response_limit_ms: u64,
    pub feedback_ms: u64,
    pub iti_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            use_fixation: true,
            fixation_ms: 500,
            use_preblank: true,
            preblank_ms: 200,
            response_limit_ms: 3500,
            feedback_ms: 700,
            iti_ms: 0,
        }
    }
}

impl TimingConfig {
    pub fn fixation(&self) -> Option<Duration> {
        self.use_fixation
            .then(|| Duration::from_millis(self.fixation_ms))
    }

    pub fn preblank(&self) -> Option<Duration> {
        self.use_preblank
            .then(|| Duration::from_millis(self.preblank_ms))
    }

    pub fn response_limit(&self) -> Duration {
        Duration::from_millis(self.response_limit_ms)
    }

    pub fn feedback(&self) -> Duration {
        Duration::from_millis(self.feedback_ms)
    }

    pub fn inter_trial(&self) -> Option<Duration> {
        (self.iti_ms > 0).then(|| Duration::from_millis(self.iti_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyBindings {
    pub a: String,
    pub b: String,
    pub abort: String,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            a: "a".to_string(),
            b: "b".to_string(),
            abort: "Escape".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerTarget {
    pub id: String,
    pub response: Response,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PadBindings {
    pub a: Vec<usize>,
    pub b: Vec<usize>,
    /// Checked before the response buttons on every poll.
    pub abort: Vec<usize>,
}

impl Default for PadBindings {
    fn default() -> Self {
        Self {
            a: vec![0, 2],
            b: vec![1, 3],
            abort: vec![8, 9, 12],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    pub keys: KeyBindings,
    pub pointer_targets: Vec<PointerTarget>,
    pub pointer_capability: PointerCapability,
    pub gamepad: PadBindings,
    pub poll_interval_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            keys: KeyBindings::default(),
            pointer_targets: vec![
                PointerTarget {
                    id: "touch-a".to_string(),
                    response: Response::A,
                },
                PointerTarget {
                    id: "touch-b".to_string(),
                    response: Response::B,
                },
            ],
            pointer_capability: PointerCapability::PointerEvents,
            gamepad: PadBindings::default(),
            poll_interval_ms: 16,
        }
    }
}

impl InputConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ExperimentConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let stim = &self.stimulus;
        if !(stim.orientation_min < stim.orientation_max) {
            return Err(ConfigError::InvertedRange {
                min: stim.orientation_min,
                max: stim.orientation_max,
            });
        }
        if stim.stripe_levels.is_empty() {
            return Err(ConfigError::EmptyStripeLevels);
        }
        if self.rb.trials % 2 != 0 {
            return Err(ConfigError::OddTrialCount {
                block: "rb",
                trials: self.rb.trials,
            });
        }
        if self.rb.anchors.is_empty() {
            return Err(ConfigError::EmptyAnchors);
        }
        if self.ii.trials % 2 != 0 {
            return Err(ConfigError::OddTrialCount {
                block: "ii",
                trials: self.ii.trials,
            });
        }
        if self.ii.buckets.is_empty() {
            return Err(ConfigError::NoBuckets);
        }
        for (field, value) in [
            ("edge_inset", self.ii.edge_inset),
            ("jitter_fraction", self.ii.jitter_fraction),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidJitterShape { field, value });
            }
        }
        for (index, [min, max]) in self.ii.buckets.iter().copied().enumerate() {
            if !(min < max) {
                return Err(ConfigError::DegenerateBucket { index, min, max });
            }
            if min < stim.orientation_min || max > stim.orientation_max {
                return Err(ConfigError::BucketOutOfRange { index });
            }
            if max - min <= 2.0 * self.ii.edge_inset {
                return Err(ConfigError::BucketNarrowerThanInset {
                    index,
                    inset: self.ii.edge_inset,
                });
            }
        }
        let pad = &self.input.gamepad;
        for (action, buttons) in [("a", &pad.a), ("b", &pad.b), ("abort", &pad.abort)] {
            if buttons.is_empty() {
                return Err(ConfigError::EmptyButtonSet { action });
            }
        }
        let keys = &self.input.keys;
        let mut seen: Vec<String> = Vec::new();
        for key in [&keys.a, &keys.b, &keys.abort] {
            let folded = key.to_lowercase();
            if seen.contains(&folded) {
                return Err(ConfigError::ConflictingKeys { key: key.clone() });
            }
            seen.push(folded);
        }
        if self.input.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.timing.response_limit_ms == 0 {
            return Err(ConfigError::ZeroResponseLimit);
        }
        Ok(())
    }
}

/// Loads a config from an optional YAML file, applies `key.path=value`
/// overrides, then validates.
pub fn load_config(path: Option<&Path>, set_values: &[String]) -> Result<ExperimentConfig> {
    let mut value = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
            let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)?;
            serde_json::to_value(yaml)?
        }
        None => json!({}),
    };
    if value.is_null() {
        value = json!({});
    }
    for raw in set_values {
        let (key, parsed) = parse_set_binding(raw)?;
        set_json_pointer_value(&mut value, &dotted_to_pointer(&key), parsed)?;
    }
    let config: ExperimentConfig = serde_json::from_value(value)
        .map_err(|e| anyhow!("invalid experiment config: {}", e))?;
    config.validate()?;
    Ok(config)
}

/// Writes the default config as YAML. Refuses to clobber unless `force`.
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(anyhow!(
            "config file already exists (use --force): {}",
            path.display()
        ));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let yaml = serde_yaml::to_string(&ExperimentConfig::default())?;
    fs::write(path, yaml)?;
    Ok(())
}

fn parse_set_binding(raw: &str) -> Result<(String, Value)> {
    let (key, val_raw) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
    if key.trim().is_empty() {
        return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
    }
    let parsed =
        serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
    Ok((key.trim().to_string(), parsed))
}

fn dotted_to_pointer(key: &str) -> String {
    let mut pointer = String::new();
    for part in key.split('.') {
        pointer.push('/');
        pointer.push_str(&part.replace('~', "~0").replace('/', "~1"));
    }
    pointer
}

fn decode_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn set_json_pointer_value(root: &mut Value, pointer: &str, new_value: Value) -> Result<()> {
    if !pointer.starts_with('/') {
        return Err(anyhow!("json_pointer must start with '/': {}", pointer));
    }
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(decode_pointer_token)
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        *root = new_value;
        return Ok(());
    };

    let mut cur = root;
    for token in parents {
        match cur {
            Value::Object(map) => {
                cur = map.entry(token.clone()).or_insert_with(|| json!({}));
            }
            Value::Array(arr) => {
                let idx = array_index(token, arr.len(), pointer)?;
                cur = &mut arr[idx];
            }
            _ => {
                return Err(anyhow!(
                    "override path hit non-container at '{}' in {}",
                    token,
                    pointer
                ));
            }
        }
    }

    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), new_value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx = array_index(last, arr.len(), pointer)?;
            arr[idx] = new_value;
            Ok(())
        }
        _ => Err(anyhow!(
            "override target is not an object/array for {}",
            pointer
        )),
    }
}

fn array_index(token: &str, len: usize, pointer: &str) -> Result<usize> {
    let idx: usize = token
        .parse()
        .map_err(|_| anyhow!("'{}' is not a valid array index in {}", token, pointer))?;
    if idx >= len {
        return Err(anyhow!("array index {} out of bounds in {}", idx, pointer));
    }
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gabor_config_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn defaults_validate() {
        ExperimentConfig::default()
            .validate()
            .expect("defaults must be valid");
    }

    #[test]
    fn normalization_spans_unit_interval() {
        let stim = StimulusConfig::default();
        assert_eq!(stim.normalize_stripes(6), 1.0);
        assert_eq!(stim.normalize_stripes(3), -1.0);
        assert_eq!(stim.normalize_orientation(15.0), 1.0);
        assert_eq!(stim.normalize_orientation(-15.0), -1.0);
        assert_eq!(stim.normalize_orientation(0.0), 0.0);
    }

    #[test]
    fn set_overrides_apply_without_file() {
        let cfg = load_config(
            None,
            &[
                "timing.response_limit_ms=1200".to_string(),
                "ii.enforce_bucket_balance=false".to_string(),
                "input.keys.a=f".to_string(),
            ],
        )
        .expect("load");
        assert_eq!(cfg.timing.response_limit_ms, 1200);
        assert!(!cfg.ii.enforce_bucket_balance);
        assert_eq!(cfg.input.keys.a, "f");
        assert_eq!(cfg.rb, RbConfig::default());
    }

    #[test]
    fn odd_trial_count_is_rejected() {
        let err = load_config(None, &["rb.trials=7".to_string()]).expect_err("odd");
        assert!(err.to_string().contains("even"), "unexpected: {}", err);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = load_config(None, &["timing.fixaton_ms=5".to_string()]).expect_err("typo");
        assert!(err.to_string().contains("fixaton_ms"), "unexpected: {}", err);
    }

    #[test]
    fn bucket_outside_range_is_rejected() {
        let mut cfg = ExperimentConfig::default();
        cfg.ii.buckets.push([14.0, 20.0]);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BucketOutOfRange { index: 5 })
        );
    }

    #[test]
    fn bucket_inside_its_own_inset_is_rejected() {
        let err = load_config(
            None,
            &["ii.buckets=[[-15,0],[0,0.15],[0.15,15]]".to_string()],
        )
        .expect_err("narrow bucket");
        assert!(err.to_string().contains("ii.buckets[1]"), "unexpected: {}", err);

        let mut cfg = ExperimentConfig::default();
        cfg.ii.edge_inset = 3.5;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BucketNarrowerThanInset {
                index: 0,
                inset: 3.5
            })
        );
    }

    #[test]
    fn negative_or_non_finite_jitter_shape_is_rejected() {
        let mut cfg = ExperimentConfig::default();
        cfg.ii.edge_inset = -0.1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidJitterShape {
                field: "edge_inset",
                ..
            })
        ));

        let mut cfg = ExperimentConfig::default();
        cfg.ii.jitter_fraction = f64::INFINITY;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidJitterShape {
                field: "jitter_fraction",
                ..
            })
        ));
    }

    #[test]
    fn conflicting_keys_are_rejected() {
        let mut cfg = ExperimentConfig::default();
        cfg.input.keys.b = "A".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ConflictingKeys { .. })
        ));
    }

    #[test]
    fn malformed_set_is_rejected() {
        assert!(load_config(None, &["novalue".to_string()]).is_err());
        assert!(load_config(None, &["=3".to_string()]).is_err());
    }

    #[test]
    fn default_file_round_trips_through_loader() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("gabor.yaml");
        write_default_config(&path, false).expect("write");
        assert!(write_default_config(&path, false).is_err());
        let cfg = load_config(Some(&path), &[]).expect("load");
        assert_eq!(cfg, ExperimentConfig::default());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let dir = temp_dir("partial");
        let path = dir.join("partial.yaml");
        fs::write(&path, "rb:\n  trials: 40\ntiming:\n  iti_ms: 250\n").expect("write");
        let cfg = load_config(Some(&path), &[]).expect("load");
        assert_eq!(cfg.rb.trials, 40);
        assert_eq!(cfg.rb.threshold, 7.0);
        assert_eq!(cfg.timing.inter_trial(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.timing.fixation(), Some(Duration::from_millis(500)));
        let _ = fs::remove_dir_all(dir);
    }
}
