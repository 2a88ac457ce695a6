// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace samplers and the helpers they share.

use fnv::FnvHasher;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::ProcessedTrace;
use crate::pb::Span;

pub mod backend;
pub mod exception;
pub mod priority;
pub mod rate_limiter;
pub mod score;

pub use backend::Backend;
pub use exception::ExceptionSampler;
pub use priority::PrioritySampler;
pub use rate_limiter::RateLimiter;
pub use score::{ErrorsSampler, ScoreEngine, ScoreSampler};

/// Metric holding the sampling priority on the root span.
pub const KEY_SAMPLING_PRIORITY: &str = "_sampling_priority_v1";
/// Metric holding the cumulated rate at which the trace was sampled.
pub const KEY_SAMPLE_RATE: &str = "_sample_rate";
/// Metric holding the rate applied by the client before sending the trace.
pub const KEY_CLIENT_RATE: &str = "_dd1.sr.rcusr";

const KNUTH_FACTOR: u64 = 1_111_111_111_111_111_111;

pub type Signature = u64;

/// Outcome of a sampler for one trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDecision {
    pub keep: bool,
    /// Effective rate in (0, 1].
    pub rate: f64,
}

impl SamplingDecision {
    pub fn new(keep: bool, rate: f64) -> Self {
        Self { keep, rate }
    }
}

/// A sampler shared by every worker.
pub trait TraceSampler: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, trace: &ProcessedTrace) -> SamplingDecision;

    /// Periodic maintenance, run every [`TraceSampler::tick_interval`].
    fn tick(&self) {}

    fn tick_interval(&self) -> Option<Duration> {
        None
    }
}

/// Runs the maintenance loop of `sampler` until `cancel` fires.
pub async fn run_maintenance(sampler: Arc<dyn TraceSampler>, cancel: CancellationToken) {
    let Some(period) = sampler.tick_interval() else {
        return;
    };
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stopping {} sampler", sampler.name());
                return;
            }
            _ = interval.tick() => sampler.tick(),
        }
    }
}

/// Deterministically keeps a trace with probability `rate` based on its id.
pub fn sample_by_rate(trace_id: u64, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 || rate.is_nan() {
        return false;
    }
    trace_id.wrapping_mul(KNUTH_FACTOR) < (rate * u64::MAX as f64) as u64
}

/// Combines the rates of two independent samplers that both had a chance to keep a trace.
pub fn combine_rates(rate1: f64, rate2: f64) -> f64 {
    if rate1 <= 0.0 || rate2 <= 0.0 {
        return rate1.max(rate2);
    }
    1.0 / (1.0 / rate1 + 1.0 / rate2 - 1.0)
}

pub fn get_sampling_priority(root: &Span) -> Option<i32> {
    root.metrics
        .get(KEY_SAMPLING_PRIORITY)
        .map(|priority| *priority as i32)
}

pub fn get_trace_rate(root: &Span) -> f64 {
    root.metrics
        .get(KEY_SAMPLE_RATE)
        .copied()
        .filter(|rate| *rate > 0.0 && *rate <= 1.0)
        .unwrap_or(1.0)
}

pub fn set_trace_rate(root: &mut Span, rate: f64) {
    if rate < 1.0 {
        root.metrics.insert(KEY_SAMPLE_RATE.to_string(), rate);
    }
}

/// Multiplies `rate` into the rate already applied to the trace.
pub fn add_trace_rate(root: &mut Span, rate: f64) {
    let current = get_trace_rate(root);
    set_trace_rate(root, current * rate);
}

pub fn get_client_rate(root: &Span) -> f64 {
    root.metrics
        .get(KEY_CLIENT_RATE)
        .copied()
        .filter(|rate| *rate > 0.0 && *rate <= 1.0)
        .unwrap_or(1.0)
}

pub fn set_client_rate(root: &mut Span, rate: f64) {
    if rate < 1.0 {
        root.metrics.insert(KEY_CLIENT_RATE.to_string(), rate);
    } else {
        root.metrics.remove(KEY_CLIENT_RATE);
    }
}

fn span_hash(span: &Span, env: &str, with_resource: bool) -> u64 {
    let mut h = FnvHasher::default();
    h.write(env.as_bytes());
    h.write(span.service.as_bytes());
    h.write(span.name.as_bytes());
    if with_resource {
        h.write(span.resource.as_bytes());
    }
    h.write(&span.error.to_le_bytes());
    h.finish()
}

/// Signature of a trace: its root combined with the distinct span shapes it contains.
pub fn compute_signature_with_root_and_env(trace: &[Span], root: usize, env: &str) -> Signature {
    let root_hash = trace
        .get(root)
        .map(|root| span_hash(root, env, true))
        .unwrap_or_default();
    let mut hashes: Vec<u64> = trace.iter().map(|s| span_hash(s, env, false)).collect();
    hashes.sort_unstable();
    hashes.dedup();
    hashes.into_iter().fold(root_hash, |acc, h| acc ^ h)
}

/// Signature of a `(service, env)` pair.
pub fn service_signature(service: &str, env: &str) -> Signature {
    let mut h = FnvHasher::default();
    h.write(service.as_bytes());
    h.write(b",");
    h.write(env.as_bytes());
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(service: &str, name: &str, resource: &str, error: i32) -> Span {
        Span {
            service: service.to_string(),
            name: name.to_string(),
            resource: resource.to_string(),
            error,
            ..Default::default()
        }
    }

    #[test]
    fn test_combine_rates() {
        let combined = combine_rates(0.5, 0.5);
        assert!((combined - 1.0 / 3.0).abs() < 1e-12);
        assert!((combine_rates(0.1, 0.2) - 1.0 / (10.0 + 5.0 - 1.0)).abs() < 1e-12);
        assert!((combine_rates(1.0, 0.3) - 0.3).abs() < 1e-12);
        assert_eq!(combine_rates(0.0, 0.3), 0.3);
    }

    #[test]
    fn test_sample_by_rate_is_deterministic_and_proportional() {
        assert!(sample_by_rate(12345, 1.0));
        assert!(!sample_by_rate(12345, 0.0));
        let id = 987654321;
        assert_eq!(sample_by_rate(id, 0.5), sample_by_rate(id, 0.5));

        let kept = (1..=10_000u64)
            .filter(|id| sample_by_rate(id.wrapping_mul(0x9E37_79B9_7F4A_7C15), 0.3))
            .count();
        assert!((2_500..3_500).contains(&kept), "kept {kept}");
    }

    #[test]
    fn test_trace_rate_helpers() {
        let mut root = Span::default();
        assert_eq!(get_trace_rate(&root), 1.0);
        add_trace_rate(&mut root, 0.5);
        add_trace_rate(&mut root, 0.5);
        assert_eq!(root.metrics[KEY_SAMPLE_RATE], 0.25);

        set_client_rate(&mut root, 0.2);
        assert_eq!(get_client_rate(&root), 0.2);
        set_client_rate(&mut root, 1.0);
        assert!(!root.metrics.contains_key(KEY_CLIENT_RATE));
    }

    #[test]
    fn test_signature_ignores_span_order_and_duplicates() {
        let a = vec![
            span("web", "req", "GET /", 0),
            span("db", "query", "SELECT", 0),
            span("db", "query", "UPDATE", 0),
        ];
        let b = vec![
            span("web", "req", "GET /", 0),
            span("db", "query", "UPDATE", 0),
        ];
        assert_eq!(
            compute_signature_with_root_and_env(&a, 0, "prod"),
            compute_signature_with_root_and_env(&b, 0, "prod")
        );

        let mut c = a.clone();
        c[2].error = 1;
        assert_ne!(
            compute_signature_with_root_and_env(&a, 0, "prod"),
            compute_signature_with_root_and_env(&c, 0, "prod")
        );
        assert_ne!(
            compute_signature_with_root_and_env(&a, 0, "prod"),
            compute_signature_with_root_and_env(&a, 0, "staging")
        );
    }

    #[test]
    fn test_service_signature() {
        let web = service_signature("web", "prod");
        assert_eq!(web, service_signature("web", "prod"));
        assert_ne!(web, service_signature("web,", "prod"));
    }
}
