//! Character error rate.
//!
//! For each prediction/target pair the ignored tokens are stripped from both
//! sequences, then the edit distance is divided by the longer of the two
//! lengths. The metric is the mean of those per-pair rates.

use crate::core::RecResult;
use crate::core::validation::validate_same_length;
use std::collections::HashSet;

/// Edit distance between two sequences (insertions, deletions, substitutions).
pub fn levenshtein_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let m = a.len();
    let n = b.len();

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    // Two rows are enough
    let mut prev = (0..=n).collect::<Vec<_>>();
    let mut curr = vec![0; n + 1];

    for (i, a_item) in a.iter().enumerate() {
        curr[0] = i + 1;

        for (j, b_item) in b.iter().enumerate() {
            let cost = usize::from(a_item != b_item);
            curr[j + 1] = (prev[j + 1] + 1) // deletion
                .min(curr[j] + 1) // insertion
                .min(prev[j] + cost); // substitution
        }

        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Accumulating character error rate over token sequences.
#[derive(Debug, Clone, Default)]
pub struct CharacterErrorRate {
    ignore_tokens: HashSet<u32>,
    error: f64,
    total: usize,
}

impl CharacterErrorRate {
    /// Creates a metric that skips `ignore_tokens` in both predictions and targets.
    pub fn new(ignore_tokens: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ignore_tokens: ignore_tokens.into_iter().collect(),
            error: 0.0,
            total: 0,
        }
    }

    /// Error rate of a single pair.
    pub fn pair_rate(&self, pred: &[u32], target: &[u32]) -> f64 {
        let pred: Vec<u32> = self.strip(pred);
        let target: Vec<u32> = self.strip(target);
        let length = pred.len().max(target.len());
        if length == 0 {
            return 0.0;
        }
        levenshtein_distance(&pred, &target) as f64 / length as f64
    }

    /// Adds a batch of prediction/target pairs.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the batches have different sizes.
    pub fn update(&mut self, preds: &[Vec<u32>], targets: &[Vec<u32>]) -> RecResult<()> {
        validate_same_length(preds, targets, "predictions", "targets")?;
        for (pred, target) in preds.iter().zip(targets) {
            self.error += self.pair_rate(pred, target);
            self.total += 1;
        }
        Ok(())
    }

    /// Mean error rate over every pair seen since the last reset; 0 when empty.
    pub fn compute(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.error / self.total as f64
        }
    }

    /// Number of pairs accumulated.
    pub fn count(&self) -> usize {
        self.total
    }

    /// Clears the accumulated state, keeping the ignored tokens.
    pub fn reset(&mut self) {
        self.error = 0.0;
        self.total = 0;
    }

    fn strip(&self, tokens: &[u32]) -> Vec<u32> {
        tokens
            .iter()
            .copied()
            .filter(|t| !self.ignore_tokens.contains(t))
            .collect()
    }
}
