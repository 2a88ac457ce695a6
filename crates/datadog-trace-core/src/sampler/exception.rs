// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Catches traces with top level or measured span shapes that no other
//! sampler kept recently.

use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{get_sampling_priority, RateLimiter, SamplingDecision, Signature, TraceSampler};
use crate::agent::ProcessedTrace;
use crate::pb::Span;
use crate::traceutil::{has_top_level, is_measured};

pub struct ExceptionSampler {
    ttl: Duration,
    seen: Mutex<HashMap<Signature, Instant>>,
    limiter: RateLimiter,
}

fn span_signature(span: &Span, env: &str) -> Signature {
    let mut h = FnvHasher::default();
    h.write(env.as_bytes());
    h.write(span.service.as_bytes());
    h.write(span.name.as_bytes());
    h.write(span.resource.as_bytes());
    h.write(&span.error.to_le_bytes());
    if let Some(code) = span.meta.get("http.status_code") {
        h.write(code.as_bytes());
    }
    h.finish()
}

impl ExceptionSampler {
    pub fn new(ttl: Duration, tps: f64) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
            limiter: RateLimiter::new(tps),
        }
    }

    fn signatures(trace: &ProcessedTrace) -> Vec<Signature> {
        trace
            .trace
            .iter()
            .filter(|span| has_top_level(span) || is_measured(span))
            .map(|span| span_signature(span, &trace.env))
            .collect()
    }

    pub fn evaluate_at(&self, trace: &ProcessedTrace, now: Instant) -> SamplingDecision {
        let signatures = Self::signatures(trace);
        if signatures.is_empty() {
            return SamplingDecision::new(false, 1.0);
        }
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if get_sampling_priority(trace.root_span()).is_some_and(|p| p > 0) {
            for signature in signatures {
                seen.insert(signature, now);
            }
            return SamplingDecision::new(false, 1.0);
        }
        let unseen = signatures.iter().any(|signature| {
            seen.get(signature)
                .map_or(true, |at| now.saturating_duration_since(*at) > self.ttl)
        });
        if !unseen || !self.limiter.allow_at(now) {
            return SamplingDecision::new(false, 1.0);
        }
        for signature in signatures {
            seen.insert(signature, now);
        }
        SamplingDecision::new(true, 1.0)
    }

    pub fn expire_at(&self, now: Instant) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.retain(|_, at| now.saturating_duration_since(*at) <= self.ttl);
    }

    pub fn tracked(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl TraceSampler for ExceptionSampler {
    fn name(&self) -> &'static str {
        "exception"
    }

    fn evaluate(&self, trace: &ProcessedTrace) -> SamplingDecision {
        self.evaluate_at(trace, Instant::now())
    }

    fn tick(&self) {
        self.expire_at(Instant::now());
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.ttl)
    }
}
