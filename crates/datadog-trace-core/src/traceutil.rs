// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers reading and updating trace-level metadata carried by spans.

use std::collections::{HashMap, HashSet};

use crate::pb::{Span, Trace};

/// Span metric the agent sets for the backend to recognize top level spans.
pub const TOP_LEVEL_KEY: &str = "_top_level";
/// Span metric the tracer sets to denote a top level span.
pub const TRACER_TOP_LEVEL_KEY: &str = "_dd.top_level";
const MEASURED_KEY: &str = "_dd.measured";
const ENV_KEY: &str = "env";

// Fixed per-value overheads of the msgpack encoding, used for size estimates.
const MSGP_STR_PREFIX: usize = 5;
const MSGP_MAP_PREFIX: usize = 5;
const MSGP_ARRAY_PREFIX: usize = 5;
const MSGP_INT: usize = 9;
const MSGP_FLOAT: usize = 9;
// service, name, resource, trace_id, span_id, parent_id, start, duration, error, meta, metrics, type
const SPAN_FIELD_NAMES_SIZE: usize = 8 + 5 + 9 + 9 + 8 + 10 + 6 + 9 + 6 + 5 + 8 + 5;

/// Returns the index of the root span of a non-empty trace.
///
/// The root is the span whose parent is not part of the trace. When several
/// spans qualify, spans with a zero parent id win, then the earliest start.
/// When none qualifies the earliest starting span is returned.
pub fn get_root(trace: &[Span]) -> usize {
    let span_ids: HashSet<u64> = trace.iter().map(|s| s.span_id).collect();
    let mut root: Option<usize> = None;
    for (i, span) in trace.iter().enumerate() {
        if span.parent_id != 0 && span_ids.contains(&span.parent_id) {
            continue;
        }
        root = match root {
            None => Some(i),
            Some(current) if better_root(&trace[current], span) => Some(i),
            keep => keep,
        };
    }
    root.unwrap_or_else(|| earliest(trace))
}

fn better_root(current: &Span, candidate: &Span) -> bool {
    match (current.parent_id == 0, candidate.parent_id == 0) {
        (false, true) => true,
        (true, false) => false,
        _ => candidate.start < current.start,
    }
}

fn earliest(trace: &[Span]) -> usize {
    trace
        .iter()
        .enumerate()
        .min_by_key(|(_, s)| s.start)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Returns the first non-empty `env` tag found in the trace.
pub fn get_env(trace: &[Span]) -> Option<&str> {
    trace
        .iter()
        .filter_map(|s| s.meta.get(ENV_KEY))
        .find(|v| !v.is_empty())
        .map(String::as_str)
}

fn set_top_level_span(span: &mut Span, is_top_level: bool) {
    if !is_top_level {
        span.metrics.remove(TOP_LEVEL_KEY);
        return;
    }
    span.metrics.insert(TOP_LEVEL_KEY.to_string(), 1.0);
}

/// Marks every span of `trace` as top level or not.
///
/// Top level spans are the entry points of a service: spans without a
/// parent, spans whose parent is missing from the trace, and spans whose
/// parent runs in a different service.
pub fn compute_top_level(trace: &mut [Span]) {
    let span_id_to_service: HashMap<u64, String> = trace
        .iter()
        .map(|s| (s.span_id, s.service.clone()))
        .collect();
    for span in trace.iter_mut() {
        let is_top_level = span.parent_id == 0
            || span_id_to_service
                .get(&span.parent_id)
                .map_or(true, |parent_service| *parent_service != span.service);
        set_top_level_span(span, is_top_level);
    }
}

/// Return true if the span has a top level key set
pub fn has_top_level(span: &Span) -> bool {
    span.metrics
        .get(TRACER_TOP_LEVEL_KEY)
        .is_some_and(|v| *v == 1.0)
        || span.metrics.get(TOP_LEVEL_KEY).is_some_and(|v| *v == 1.0)
}

// Returns true if a span should be measured (i.e., it should get trace metrics calculated).
pub fn is_measured(span: &Span) -> bool {
    span.metrics.get(MEASURED_KEY).is_some_and(|v| *v == 1.0)
}

pub fn trace_contains_error(trace: &[Span]) -> bool {
    trace.iter().any(|s| s.error != 0)
}

pub fn set_meta(span: &mut Span, key: &str, value: &str) {
    span.meta.insert(key.to_string(), value.to_string());
}

pub fn set_metric(span: &mut Span, key: &str, value: f64) {
    span.metrics.insert(key.to_string(), value);
}

/// Upper bound estimate of the msgpack encoded size of a span.
pub fn span_msgsize(span: &Span) -> usize {
    let strings = [&span.service, &span.name, &span.resource, &span.r#type]
        .iter()
        .map(|s| MSGP_STR_PREFIX + s.len())
        .sum::<usize>();
    let meta = span
        .meta
        .iter()
        .map(|(k, v)| 2 * MSGP_STR_PREFIX + k.len() + v.len())
        .sum::<usize>();
    let metrics = span
        .metrics
        .keys()
        .map(|k| MSGP_STR_PREFIX + k.len() + MSGP_FLOAT)
        .sum::<usize>();
    MSGP_MAP_PREFIX
        + SPAN_FIELD_NAMES_SIZE
        + strings
        + 6 * MSGP_INT
        + 2 * MSGP_MAP_PREFIX
        + meta
        + metrics
}

/// Upper bound estimate of the msgpack encoded size of a trace.
pub fn trace_msgsize(trace: &Trace) -> usize {
    MSGP_ARRAY_PREFIX + trace.iter().map(span_msgsize).sum::<usize>()
}
