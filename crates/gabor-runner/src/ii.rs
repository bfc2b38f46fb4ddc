//! Information-integration block builder.
//!
//! Labels come from a linear discriminant over normalized stripe level and
//! orientation, so category membership cannot be read off either dimension
//! alone. On top of the hard per-label balance the builder tries to spread
//! each label evenly over a fixed partition of the orientation range
//! ("buckets"). Bucket balance is relaxed when the discriminant leaves a
//! bucket without enough candidates of one label; the overall count and the
//! per-label count are not.
//!
//! Construction runs in two phases:
//!
//! 1. *Generation* fills per-bucket, per-label candidate pools with jittered
//!    samples, bounded by `max_rounds`.
//! 2. *Selection* draws each bucket's quota, backfills shortages from a
//!    cross-bucket leftover pool and, only when leftovers run dry, pads by
//!    duplicating already-selected trials.

use tracing::{debug, warn};

use crate::config::{IiConfig, StimulusConfig};
use crate::rng::SeededRng;
use crate::trial::{Block, Label, Trial};

/// A slice of the orientation range with one candidate pool per label.
#[derive(Debug, Clone)]
pub struct OrientationBucket {
    pub min: f64,
    pub max: f64,
    pool_a: Vec<Trial>,
    pool_b: Vec<Trial>,
}

impl OrientationBucket {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            pool_a: Vec::new(),
            pool_b: Vec::new(),
        }
    }

    pub fn center(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, orientation: f64) -> bool {
        orientation >= self.min && orientation <= self.max
    }

    pub fn pool(&self, label: Label) -> &[Trial] {
        match label {
            Label::A => &self.pool_a,
            Label::B => &self.pool_b,
        }
    }

    fn pool_mut(&mut self, label: Label) -> &mut Vec<Trial> {
        match label {
            Label::A => &mut self.pool_a,
            Label::B => &mut self.pool_b,
        }
    }
}

/// Index of the first bucket containing `orientation`, falling back to a
/// proportional position across the orientation range.
pub fn bucket_index(orientation: f64, buckets: &[[f64; 2]], stim: &StimulusConfig) -> usize {
    if let Some(idx) = buckets
        .iter()
        .position(|[min, max]| orientation >= *min && orientation <= *max)
    {
        return idx;
    }
    let span = stim.orientation_max - stim.orientation_min + 0.0001;
    let raw = ((orientation - stim.orientation_min) / span * buckets.len() as f64).floor();
    (raw.max(0.0) as usize).min(buckets.len().saturating_sub(1))
}

/// Per-label quota for each bucket; sums to exactly `per_label`.
pub fn bucket_quotas(per_label: usize, bucket_count: usize) -> Vec<usize> {
    if bucket_count == 0 {
        return Vec::new();
    }
    let base = per_label / bucket_count;
    let remainder = per_label - base * bucket_count;
    (0..bucket_count)
        .map(|bi| base + usize::from(bi < remainder))
        .collect()
}

/// Result of building an II block, with counters for the relaxation paths.
#[derive(Debug, Clone)]
pub struct IiSequence {
    pub trials: Vec<Trial>,
    pub rounds: usize,
    /// Trials pulled from another bucket's leftovers.
    pub backfilled: usize,
    /// Copies of already-selected trials appended as a last resort.
    pub duplicated: usize,
}

pub fn build_ii_trials(participant: &str, stim: &StimulusConfig, ii: &IiConfig) -> Vec<Trial> {
    build_ii_sequence(participant, stim, ii).trials
}

pub fn build_ii_sequence(participant: &str, stim: &StimulusConfig, ii: &IiConfig) -> IiSequence {
    let mut rng = SeededRng::from_seed(&Block::InformationIntegration.seed(participant));
    let per_label = ii.trials / 2;
    let quotas = bucket_quotas(per_label, ii.buckets.len());
    let mut buckets: Vec<OrientationBucket> = ii
        .buckets
        .iter()
        .map(|[min, max]| OrientationBucket::new(*min, *max))
        .collect();

    let rounds = generate(&mut rng, &mut buckets, &quotas, stim, ii);

    let mut selected_a: Vec<Trial> = Vec::with_capacity(per_label);
    let mut selected_b: Vec<Trial> = Vec::with_capacity(per_label);
    let mut leftovers_a: Vec<Trial> = Vec::new();
    let mut leftovers_b: Vec<Trial> = Vec::new();
    let mut backfilled = 0;

    for (bucket, &desired) in buckets.iter_mut().zip(&quotas) {
        for label in [Label::A, Label::B] {
            let (selected, leftovers) = match label {
                Label::A => (&mut selected_a, &mut leftovers_a),
                Label::B => (&mut selected_b, &mut leftovers_b),
            };
            let pool = bucket.pool_mut(label);
            rng.shuffle(pool);
            let take = desired.min(pool.len());
            let picked = pool.split_off(pool.len() - take);
            selected.extend(picked.into_iter().rev());
            leftovers.append(pool);

            let shortage = desired - take;
            if shortage > 0 {
                rng.shuffle(leftovers);
                let moved = draw_front(leftovers, shortage);
                backfilled += moved.len();
                selected.extend(moved);
            }
        }
    }

    for (selected, leftovers) in [
        (&mut selected_a, &mut leftovers_a),
        (&mut selected_b, &mut leftovers_b),
    ] {
        let need = per_label.saturating_sub(selected.len());
        if need > 0 {
            rng.shuffle(leftovers);
            let moved = draw_front(leftovers, need);
            backfilled += moved.len();
            selected.extend(moved);
        }
        selected.truncate(per_label);
    }

    if backfilled > 0 {
        debug!(
            participant,
            backfilled, "ii bucket shortages backfilled from leftovers"
        );
    }

    let duplicated = pad_by_duplication(&mut selected_a, &mut selected_b, per_label, ii.trials);
    if duplicated > 0 {
        warn!(
            participant,
            duplicated,
            trials = ii.trials,
            "ii candidates exhausted; padded block with duplicate trials"
        );
    }

    let mut combined = selected_a;
    combined.append(&mut selected_b);
    combined.truncate(ii.trials);
    rng.shuffle(&mut combined);
    debug!(participant, rounds, trials = combined.len(), "ii sequence built");

    IiSequence {
        trials: combined,
        rounds,
        backfilled,
        duplicated,
    }
}

fn generate(
    rng: &mut SeededRng,
    buckets: &mut [OrientationBucket],
    quotas: &[usize],
    stim: &StimulusConfig,
    ii: &IiConfig,
) -> usize {
    let bounds: Vec<[f64; 2]> = buckets.iter().map(|b| [b.min, b.max]).collect();
    let mut rounds = 0;
    while rounds < ii.max_rounds {
        rounds += 1;
        for bi in 0..buckets.len() {
            let (center, width, min, max) = {
                let b = &buckets[bi];
                (b.center(), b.width(), b.min, b.max)
            };
            for &stripes in &stim.stripe_levels {
                let (lo, hi) = jitter_bounds(min, max, ii.edge_inset);
                let orientation = rng.jitter(center, width * ii.jitter_fraction, lo, hi);
                let trial = Trial::integration(stripes, orientation, stim, ii);
                let target = bucket_index(orientation, &bounds, stim);
                buckets[target].pool_mut(trial.label).push(trial);
            }
        }
        if !ii.enforce_bucket_balance {
            break;
        }
        let satisfied = buckets.iter().zip(quotas).all(|(b, &q)| {
            b.pool(Label::A).len() >= q + ii.surplus && b.pool(Label::B).len() >= q + ii.surplus
        });
        if satisfied {
            break;
        }
    }
    rounds
}

/// Inset sampling range for a bucket, or the whole bucket when the inset
/// leaves nothing to sample from.
fn jitter_bounds(min: f64, max: f64, inset: f64) -> (f64, f64) {
    let (lo, hi) = (min + inset, max - inset);
    if lo <= hi {
        (lo, hi)
    } else {
        (min.min(max), min.max(max))
    }
}

fn draw_front(items: &mut Vec<Trial>, n: usize) -> Vec<Trial> {
    let n = n.min(items.len());
    items.drain(..n).collect()
}

/// Last-resort padding. Cycles through a label's own selections so label
/// balance survives; a label with nothing selected borrows from the other.
fn pad_by_duplication(
    selected_a: &mut Vec<Trial>,
    selected_b: &mut Vec<Trial>,
    per_label: usize,
    total: usize,
) -> usize {
    let mut duplicated = 0;
    for selected in [&mut *selected_a, &mut *selected_b] {
        if !selected.is_empty() && selected.len() < per_label {
            let template = selected.clone();
            let mut idx = 0;
            while selected.len() < per_label {
                selected.push(template[idx % template.len()]);
                idx += 1;
                duplicated += 1;
            }
        }
    }

    let have = selected_a.len() + selected_b.len();
    if have < total && have > 0 {
        let template: Vec<Trial> = selected_a.iter().chain(selected_b.iter()).copied().collect();
        let mut idx = 0;
        while selected_a.len() + selected_b.len() < total {
            let base = template[idx % template.len()];
            match base.label {
                Label::A => selected_a.push(base),
                Label::B => selected_b.push(base),
            }
            idx += 1;
            duplicated += 1;
        }
    }
    duplicated
}

/// Per-bucket `[A, B]` counts of a finished sequence.
pub fn bucket_label_counts(
    trials: &[Trial],
    buckets: &[[f64; 2]],
    stim: &StimulusConfig,
) -> Vec<[usize; 2]> {
    let mut counts = vec![[0usize; 2]; buckets.len()];
    if buckets.is_empty() {
        return counts;
    }
    for t in trials {
        let bi = bucket_index(t.orientation, buckets, stim);
        let slot = match t.label {
            Label::A => 0,
            Label::B => 1,
        };
        counts[bi][slot] += 1;
    }
    counts
}
