// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptive per-signature rate computation.
//!
//! Every signature keeps an exponentially decayed count of the traces seen
//! for it. The count is divided by `decay_factor` once per decay period, so
//! in steady state a signature receiving `n` traces per period settles at
//! `n / (F - 1)` right after a decay, which gives its throughput estimate.
//!
//! After every decay the backend computes the offset `o` for which
//! `sum(min(tps_i, o)) == target_tps`. A signature is then sampled at
//! `min(1, o / tps)`: low volume signatures are kept entirely and the
//! remaining budget is shared evenly among the busy ones.

use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::Signature;

pub const DEFAULT_DECAY_FACTOR: f64 = 1.125;
const SHARDS: usize = 16;
// Scores under this value are dropped on decay.
const MIN_SCORE: f64 = 0.01;

#[derive(Debug)]
pub struct Backend {
    shards: Vec<Mutex<HashMap<Signature, f64>>>,
    target_tps: f64,
    decay_factor: f64,
    decay_period: Duration,
    // f64 bits of the current offset, INFINITY while under budget.
    offset: AtomicU64,
    sampled: AtomicU64,
}

impl Backend {
    pub fn new(target_tps: f64, decay_period: Duration) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            target_tps,
            decay_factor: DEFAULT_DECAY_FACTOR,
            decay_period,
            offset: AtomicU64::new(f64::INFINITY.to_bits()),
            sampled: AtomicU64::new(0),
        }
    }

    pub fn decay_period(&self) -> Duration {
        self.decay_period
    }

    fn shard(&self, signature: Signature) -> MutexGuard<'_, HashMap<Signature, f64>> {
        let mut h = FnvHasher::default();
        signature.hash(&mut h);
        let index = (h.finish() as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Converts a decayed score to traces per second.
    fn score_to_tps(&self, score: f64) -> f64 {
        score * (self.decay_factor - 1.0) / self.decay_period.as_secs_f64()
    }

    pub fn count_signature(&self, signature: Signature) {
        *self.shard(signature).entry(signature).or_insert(0.0) += 1.0;
    }

    pub fn count_sample(&self) {
        self.sampled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sampled(&self) -> u64 {
        self.sampled.load(Ordering::Relaxed)
    }

    /// Estimated throughput of `signature`, in traces per second.
    pub fn signature_tps(&self, signature: Signature) -> f64 {
        let score = self
            .shard(signature)
            .get(&signature)
            .copied()
            .unwrap_or_default();
        self.score_to_tps(score)
    }

    pub fn offset(&self) -> f64 {
        f64::from_bits(self.offset.load(Ordering::Relaxed))
    }

    /// Rate at which traces of `signature` should be kept.
    pub fn rate(&self, signature: Signature) -> f64 {
        let tps = self.signature_tps(signature);
        if tps <= 0.0 {
            return 1.0;
        }
        (self.offset() / tps).min(1.0)
    }

    /// Whether `signature` still has a score, false once decay evicted it.
    pub fn contains(&self, signature: Signature) -> bool {
        self.shard(signature).contains_key(&signature)
    }

    pub fn signature_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Decays every score, then recomputes the offset from the decayed scores.
    pub fn decay(&self) {
        let mut tps = Vec::new();
        for shard in &self.shards {
            let mut scores = shard.lock().unwrap_or_else(PoisonError::into_inner);
            scores.retain(|_, score| {
                *score /= self.decay_factor;
                *score >= MIN_SCORE
            });
            tps.extend(scores.values().map(|score| self.score_to_tps(*score)));
        }
        let offset = water_fill(tps, self.target_tps);
        self.offset.store(offset.to_bits(), Ordering::Relaxed);
    }
}

/// Returns the level `o` such that `sum(min(v, o)) == target`, or infinity
/// when the values already fit the target.
pub fn water_fill(mut values: Vec<f64>, target: f64) -> f64 {
    let total: f64 = values.iter().sum();
    if total <= target {
        return f64::INFINITY;
    }
    values.sort_by(f64::total_cmp);
    let mut remaining = target;
    let count = values.len();
    for (i, value) in values.iter().enumerate() {
        let share = remaining / (count - i) as f64;
        if *value > share {
            return share;
        }
        remaining -= value;
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_fill() {
        assert_eq!(water_fill(vec![1.0, 2.0], 10.0), f64::INFINITY);
        assert_eq!(water_fill(vec![10.0, 10.0], 10.0), 5.0);
        // 1 is kept entirely, the 9 remaining are split between the two busy ones.
        assert_eq!(water_fill(vec![100.0, 1.0, 50.0], 10.0), 4.5);
        assert_eq!(water_fill(vec![], 10.0), f64::INFINITY);
    }

    #[test]
    fn test_rate_is_one_before_data() {
        let backend = Backend::new(10.0, Duration::from_secs(5));
        assert_eq!(backend.rate(42), 1.0);
        backend.count_signature(42);
        assert_eq!(backend.rate(42), 1.0);
    }

    #[test]
    fn test_converges_toward_target() {
        let period = Duration::from_secs(1);
        let backend = Backend::new(10.0, period);
        // 100 traces per period on one signature, 2 on another.
        for _ in 0..100 {
            for _ in 0..100 {
                backend.count_signature(1);
            }
            backend.count_signature(2);
            backend.count_signature(2);
            backend.decay();
        }
        let busy = backend.signature_tps(1);
        assert!((busy - 100.0).abs() < 1.0, "busy tps {busy}");
        // The quiet signature fits in its share and is kept in full.
        assert_eq!(backend.rate(2), 1.0);
        let kept = backend.rate(1) * 100.0 + 2.0;
        assert!((kept - 10.0).abs() < 0.5, "kept tps {kept}");
    }

    #[test]
    fn test_decay_evicts_idle_signatures() {
        let backend = Backend::new(10.0, Duration::from_secs(5));
        backend.count_signature(7);
        assert_eq!(backend.signature_count(), 1);
        for _ in 0..100 {
            backend.decay();
        }
        assert_eq!(backend.signature_count(), 0);
        assert_eq!(backend.offset(), f64::INFINITY);
    }
}
