//! Score models.
//!
//! Scores are not derived from the captured samples: the default model draws
//! a uniform integer in `1..=100` per equipment. The model is pluggable so a
//! real scoring algorithm can replace it without touching the sequencer.

use crate::sample::SampleMatrix;
use crate::store::{EquipmentScore, ReferenceChannel, ReferenceScore};
use rand::Rng;
use std::ops::RangeInclusive;

/// Computes the scores recorded for a completed cycle.
pub trait ScoreModel: Send + Sync {
    /// Score every equipment of every reference channel.
    fn score(&self, refs: &[ReferenceChannel], matrix: &SampleMatrix) -> Vec<ReferenceScore>;
}

/// Map every equipment of `refs` through `value`.
fn score_each(refs: &[ReferenceChannel], mut value: impl FnMut() -> u32) -> Vec<ReferenceScore> {
    refs.iter()
        .map(|r| ReferenceScore {
            id: r.id,
            values: r
                .eq
                .iter()
                .map(|eq| EquipmentScore {
                    eq: eq.clone(),
                    value: value(),
                })
                .collect(),
        })
        .collect()
}

/// Uniform random scores.
#[derive(Debug, Clone)]
pub struct SyntheticScores {
    range: RangeInclusive<u32>,
}

impl Default for SyntheticScores {
    fn default() -> Self {
        Self { range: 1..=100 }
    }
}

impl SyntheticScores {
    /// Random scores drawn from `range`.
    pub fn new(range: RangeInclusive<u32>) -> Self {
        Self { range }
    }
}

impl ScoreModel for SyntheticScores {
    fn score(&self, refs: &[ReferenceChannel], _matrix: &SampleMatrix) -> Vec<ReferenceScore> {
        let mut rng = rand::thread_rng();
        score_each(refs, || {
            if self.range.is_empty() {
                *self.range.start()
            } else {
                rng.gen_range(self.range.clone())
            }
        })
    }
}

/// The same score for every equipment.
#[derive(Debug, Clone, Copy)]
pub struct FixedScore(pub u32);

impl ScoreModel for FixedScore {
    fn score(&self, refs: &[ReferenceChannel], _matrix: &SampleMatrix) -> Vec<ReferenceScore> {
        score_each(refs, || self.0)
    }
}
