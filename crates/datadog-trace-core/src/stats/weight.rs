// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::pb::Span;
use crate::sampler::get_trace_rate;
use crate::traceutil::{has_top_level, is_measured};

/// A span with the weight of the traffic it stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedSpan {
    pub span: Span,
    /// Inverse of the rate the client sampled the trace at.
    pub weight: f64,
    pub top_level: bool,
    pub measured: bool,
}

pub type WeightedTrace = Vec<WeightedSpan>;

/// Weight of every span of the trace rooted at `root`.
pub fn weight(root: &Span) -> f64 {
    1.0 / get_trace_rate(root)
}

pub fn new_weighted_trace(trace: &[Span], root: usize) -> WeightedTrace {
    let weight = trace.get(root).map_or(1.0, weight);
    trace
        .iter()
        .map(|span| WeightedSpan {
            span: span.clone(),
            weight,
            top_level: has_top_level(span),
            measured: is_measured(span),
        })
        .collect()
}
