// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use super::{
    compute_signature_with_root_and_env, sample_by_rate, Backend, SamplingDecision, TraceSampler,
};
use crate::agent::ProcessedTrace;

/// Signature based sampling shared by the score and error samplers.
pub struct ScoreEngine {
    backend: Backend,
    extra_rate: f64,
}

impl ScoreEngine {
    pub fn new(target_tps: f64, extra_rate: f64, decay_period: Duration) -> Self {
        Self {
            backend: Backend::new(target_tps, decay_period),
            extra_rate,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn sample(&self, trace: &ProcessedTrace) -> SamplingDecision {
        let signature = compute_signature_with_root_and_env(&trace.trace, trace.root, &trace.env);
        self.backend.count_signature(signature);
        let rate = self.backend.rate(signature) * self.extra_rate;
        let keep = sample_by_rate(trace.root_span().trace_id, rate);
        if keep {
            self.backend.count_sample();
        }
        SamplingDecision::new(keep, rate)
    }
}

/// Samples traces without priority and without errors.
pub struct ScoreSampler(ScoreEngine);

impl ScoreSampler {
    pub fn new(target_tps: f64, extra_rate: f64, decay_period: Duration) -> Self {
        Self(ScoreEngine::new(target_tps, extra_rate, decay_period))
    }

    pub fn engine(&self) -> &ScoreEngine {
        &self.0
    }
}

impl TraceSampler for ScoreSampler {
    fn name(&self) -> &'static str {
        "score"
    }

    fn evaluate(&self, trace: &ProcessedTrace) -> SamplingDecision {
        self.0.sample(trace)
    }

    fn tick(&self) {
        self.0.backend.decay();
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.0.backend.decay_period())
    }
}

/// Samples traces containing at least one error, with its own budget.
pub struct ErrorsSampler(ScoreEngine);

impl ErrorsSampler {
    pub fn new(target_tps: f64, extra_rate: f64, decay_period: Duration) -> Self {
        Self(ScoreEngine::new(target_tps, extra_rate, decay_period))
    }

    pub fn engine(&self) -> &ScoreEngine {
        &self.0
    }
}

impl TraceSampler for ErrorsSampler {
    fn name(&self) -> &'static str {
        "errors"
    }

    fn evaluate(&self, trace: &ProcessedTrace) -> SamplingDecision {
        self.0.sample(trace)
    }

    fn tick(&self) {
        self.0.backend.decay();
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.0.backend.decay_period())
    }
}
