// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Analytics events: spans extracted from a trace on their own, whether the
//! trace itself is kept or not.

use crate::pb::Span;
use crate::sampler::{
    get_client_rate, get_sampling_priority, sample_by_rate, RateLimiter, KEY_CLIENT_RATE,
    KEY_SAMPLING_PRIORITY,
};
use crate::stats::WeightedTrace;
use crate::traceutil::set_metric;

/// Metric set by tracers with the rate at which a span is extracted as an event.
pub const KEY_EXTRACTION_RATE: &str = "_dd1.sr.eausr";
/// Metric holding the rate applied by the max events per second limiter.
pub const KEY_MAX_EPS_RATE: &str = "_dd1.sr.eamax";
pub const KEY_ANALYZED: &str = "_dd.analyzed";

const PRIORITY_USER_KEEP: i32 = 2;

pub trait EventExtractor: Send + Sync {
    /// Returns the events kept for `trace` and the number of spans that were
    /// extracted before the events per second limit applied.
    fn extract(&self, root: &Span, trace: &WeightedTrace) -> (Vec<Span>, usize);
}

/// Extracts the spans carrying an extraction rate metric, limited to
/// `max_eps` events per second.
#[derive(Debug)]
pub struct MetricBasedExtractor {
    limiter: RateLimiter,
}

impl MetricBasedExtractor {
    pub fn new(max_eps: f64) -> Self {
        Self {
            limiter: RateLimiter::new(max_eps),
        }
    }

    fn extraction_rate(span: &Span, priority: Option<i32>) -> Option<f64> {
        let rate = *span.metrics.get(KEY_EXTRACTION_RATE)?;
        if priority.is_some_and(|p| p >= PRIORITY_USER_KEEP) {
            return Some(1.0);
        }
        Some(rate)
    }
}

impl EventExtractor for MetricBasedExtractor {
    fn extract(&self, root: &Span, trace: &WeightedTrace) -> (Vec<Span>, usize) {
        let priority = get_sampling_priority(root);
        let client_rate = get_client_rate(root);
        let mut events = Vec::new();
        let mut extracted = 0;

        for weighted in trace {
            let span = &weighted.span;
            let Some(rate) = Self::extraction_rate(span, priority) else {
                continue;
            };
            if !sample_by_rate(span.trace_id, rate) {
                continue;
            }
            extracted += 1;

            let eps_rate = if priority == Some(PRIORITY_USER_KEEP) {
                1.0
            } else if self.limiter.allow() {
                self.limiter.effective_rate()
            } else {
                continue;
            };

            let mut event = span.clone();
            set_metric(&mut event, KEY_MAX_EPS_RATE, eps_rate);
            set_metric(&mut event, KEY_CLIENT_RATE, client_rate);
            set_metric(&mut event, KEY_EXTRACTION_RATE, rate);
            set_metric(&mut event, KEY_ANALYZED, 1.0);
            if let Some(priority) = priority {
                set_metric(&mut event, KEY_SAMPLING_PRIORITY, f64::from(priority));
            }
            events.push(event);
        }
        (events, extracted)
    }
}

/// Never extracts anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExtractor;

impl EventExtractor for NoopExtractor {
    fn extract(&self, _root: &Span, _trace: &WeightedTrace) -> (Vec<Span>, usize) {
        (Vec::new(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::new_weighted_trace;

    fn span(span_id: u64, extraction_rate: Option<f64>) -> Span {
        let mut span = Span {
            trace_id: 42,
            span_id,
            parent_id: if span_id == 1 { 0 } else { 1 },
            service: "web".to_string(),
            name: "op".to_string(),
            ..Default::default()
        };
        if let Some(rate) = extraction_rate {
            span.metrics.insert(KEY_EXTRACTION_RATE.to_string(), rate);
        }
        span
    }

    #[test]
    fn test_extracts_only_spans_with_rate() {
        let trace = vec![span(1, Some(1.0)), span(2, None), span(3, Some(0.0))];
        let weighted = new_weighted_trace(&trace, 0);
        let (events, extracted) = MetricBasedExtractor::new(100.0).extract(&trace[0], &weighted);
        assert_eq!(extracted, 1);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.span_id, 1);
        assert_eq!(event.metrics[KEY_ANALYZED], 1.0);
        assert_eq!(event.metrics[KEY_EXTRACTION_RATE], 1.0);
        assert_eq!(event.metrics[KEY_MAX_EPS_RATE], 1.0);
        assert!(!event.metrics.contains_key(KEY_SAMPLING_PRIORITY));
    }

    #[test]
    fn test_user_keep_forces_extraction() {
        let mut root = span(1, Some(0.0));
        root.metrics.insert(KEY_SAMPLING_PRIORITY.to_string(), 2.0);
        let trace = vec![root, span(2, Some(0.0))];
        let weighted = new_weighted_trace(&trace, 0);
        // A zero limit would drop everything not kept by the user.
        let (events, extracted) = MetricBasedExtractor::new(0.0).extract(&trace[0], &weighted);
        assert_eq!(extracted, 2);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.metrics[KEY_SAMPLING_PRIORITY] == 2.0));
    }

    #[test]
    fn test_max_eps_limits_events_but_not_extracted_count() {
        let trace: Vec<Span> = (1..=5).map(|id| span(id, Some(1.0))).collect();
        let weighted = new_weighted_trace(&trace, 0);
        let (events, extracted) = MetricBasedExtractor::new(2.0).extract(&trace[0], &weighted);
        assert_eq!(extracted, 5);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_fractional_max_eps_still_extracts() {
        let trace = vec![span(1, Some(1.0))];
        let weighted = new_weighted_trace(&trace, 0);
        let extractor = MetricBasedExtractor::new(0.5);
        let (events, extracted) = extractor.extract(&trace[0], &weighted);
        assert_eq!(extracted, 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_noop_extractor() {
        let trace = vec![span(1, Some(1.0))];
        let weighted = new_weighted_trace(&trace, 0);
        assert_eq!(NoopExtractor.extract(&trace[0], &weighted), (Vec::new(), 0));
    }
}
