// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Execution time breakdown of subtraces by service and span type.
//!
//! A subtrace is a top level span with all its descendants. Its duration is
//! cut in slices at every span start and end. Within a slice, the time is
//! split evenly among the active spans, those that are open and have no
//! open child.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::pb::Span;
use crate::traceutil::has_top_level;

pub const SUBLAYER_DURATION_BY_SERVICE: &str = "_sublayers.duration.by_service";
pub const SUBLAYER_DURATION_BY_TYPE: &str = "_sublayers.duration.by_type";
pub const SUBLAYER_SPAN_COUNT: &str = "_sublayers.span_count";
pub const SUBLAYER_SERVICE_TAG: &str = "sublayer_service";
pub const SUBLAYER_TYPE_TAG: &str = "sublayer_type";

#[derive(Debug, Clone, PartialEq)]
pub struct SublayerValue {
    pub metric: &'static str,
    /// Tag name and value, absent for the span count.
    pub tag: Option<(&'static str, String)>,
    pub value: f64,
}

impl SublayerValue {
    /// Name of the span metric this value is stored under.
    pub fn metric_name(&self) -> String {
        match &self.tag {
            Some((name, value)) => format!("{}.{name}:{value}", self.metric),
            None => self.metric.to_string(),
        }
    }
}

/// Indices of a subtrace root and of every span below it, root included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtrace {
    pub root: usize,
    pub spans: Vec<usize>,
}

/// Returns one subtrace per top level span and one for the trace root.
pub fn extract_subtraces(trace: &[Span], root: usize) -> Vec<Subtrace> {
    let mut children: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, span) in trace.iter().enumerate() {
        if span.parent_id != 0 {
            children.entry(span.parent_id).or_default().push(i);
        }
    }
    trace
        .iter()
        .enumerate()
        .filter(|(i, span)| *i == root || has_top_level(span))
        .map(|(i, _)| {
            let mut visited = HashSet::from([i]);
            let mut stack = vec![i];
            let mut spans = Vec::new();
            while let Some(current) = stack.pop() {
                spans.push(current);
                for child in children.get(&trace[current].span_id).into_iter().flatten() {
                    if visited.insert(*child) {
                        stack.push(*child);
                    }
                }
            }
            spans.sort_unstable();
            Subtrace { root: i, spans }
        })
        .collect()
}

/// Computes sublayer values, reusing its buffers across calls.
#[derive(Debug, Default)]
pub struct SublayerCalculator {
    timestamps: Vec<i64>,
    open: Vec<bool>,
    has_open_child: Vec<bool>,
    durations: Vec<f64>,
}

impl SublayerCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute_sublayers(&mut self, spans: &[&Span]) -> Vec<SublayerValue> {
        let n = spans.len();
        if n == 0 {
            return Vec::new();
        }
        self.timestamps.clear();
        for span in spans {
            let end = span.start.saturating_add(span.duration);
            self.timestamps.push(span.start);
            self.timestamps.push(end);
        }
        self.timestamps.sort_unstable();
        self.timestamps.dedup();
        self.durations.clear();
        self.durations.resize(n, 0.0);

        let index: HashMap<u64, usize> = spans
            .iter()
            .enumerate()
            .map(|(i, span)| (span.span_id, i))
            .collect();

        for window in self.timestamps.windows(2) {
            let (t0, t1) = (window[0], window[1]);
            self.open.clear();
            for s in spans {
                let end = s.start.saturating_add(s.duration);
                self.open.push(s.start <= t0 && end >= t1);
            }
            self.has_open_child.clear();
            self.has_open_child.resize(n, false);
            for (i, span) in spans.iter().enumerate() {
                if !self.open[i] {
                    continue;
                }
                if let Some(parent) = index.get(&span.parent_id) {
                    if *parent != i {
                        self.has_open_child[*parent] = true;
                    }
                }
            }
            let active: Vec<usize> = (0..n)
                .filter(|i| self.open[*i] && !self.has_open_child[*i])
                .collect();
            if active.is_empty() {
                continue;
            }
            let share = (t1 - t0) as f64 / active.len() as f64;
            for i in active {
                self.durations[i] += share;
            }
        }

        let mut by_service: BTreeMap<&str, f64> = BTreeMap::new();
        let mut by_type: BTreeMap<&str, f64> = BTreeMap::new();
        for (span, duration) in spans.iter().zip(&self.durations) {
            *by_service.entry(span.service.as_str()).or_default() += duration;
            if !span.r#type.is_empty() {
                *by_type.entry(span.r#type.as_str()).or_default() += duration;
            }
        }

        let mut values = Vec::with_capacity(by_service.len() + by_type.len() + 1);
        values.extend(by_service.into_iter().map(|(service, value)| SublayerValue {
            metric: SUBLAYER_DURATION_BY_SERVICE,
            tag: Some((SUBLAYER_SERVICE_TAG, service.to_string())),
            value,
        }));
        values.extend(by_type.into_iter().map(|(span_type, value)| SublayerValue {
            metric: SUBLAYER_DURATION_BY_TYPE,
            tag: Some((SUBLAYER_TYPE_TAG, span_type.to_string())),
            value,
        }));
        values.push(SublayerValue {
            metric: SUBLAYER_SPAN_COUNT,
            tag: None,
            value: n as f64,
        });
        values
    }
}

/// Stores sublayer values as metrics of `span`.
pub fn set_sublayers_on_span(span: &mut Span, values: &[SublayerValue]) {
    for value in values {
        span.metrics.insert(value.metric_name(), value.value);
    }
}
