// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread-safe traffic counters.
//!
//! Every payload carries an `Arc<TagStats>` for the tracer that sent it, so
//! workers update the same counters concurrently through atomics. The
//! [`ReceiverStats`] registry hands out one `TagStats` per tracer identity
//! and produces serializable snapshots for reporting.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use crate::error::NormalizeError;

macro_rules! counters {
    ($(#[$meta:meta])* $name:ident, $snapshot:ident { $($field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: AtomicU64,)+
        }

        #[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
        pub struct $snapshot {
            $(pub $field: u64,)+
        }

        impl $name {
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }

        impl $snapshot {
            pub fn total(&self) -> u64 {
                0 $(+ self.$field)+
            }
        }
    };
}

counters!(
    /// Traces rejected by the normalizer, by reason.
    TracesDropped,
    TracesDroppedSnapshot {
        empty_trace,
        trace_id_zero,
        span_id_zero,
        foreign_span,
        duplicate_span_id,
    }
);

counters!(
    /// Span fields fixed up by the normalizer.
    SpansMalformed,
    SpansMalformedSnapshot {
        service_empty,
        service_truncate,
        service_invalid,
        span_name_empty,
        span_name_truncate,
        span_name_invalid,
        resource_empty,
        type_truncate,
        invalid_start_date,
        invalid_duration,
        invalid_http_status_code,
        parent_id_is_span_id,
    }
);

counters!(
    /// Per-tracer traffic counters.
    Counters,
    CountersSnapshot {
        payloads_received,
        traces_received,
        spans_received,
        traces_filtered,
        spans_filtered,
        spans_dropped,
        traces_priority_none,
        traces_priority_neg,
        traces_priority_0,
        traces_priority_1,
        traces_priority_2,
        traces_kept,
        events_extracted,
        events_sampled,
    }
);

impl TracesDropped {
    pub fn record(&self, err: &NormalizeError) {
        let counter = match err {
            NormalizeError::EmptyTrace => &self.empty_trace,
            NormalizeError::TraceIdZero { .. } => &self.trace_id_zero,
            NormalizeError::SpanIdZero { .. } => &self.span_id_zero,
            NormalizeError::ForeignSpan { .. } => &self.foreign_span,
            NormalizeError::DuplicateSpanId { .. } => &self.duplicate_span_id,
        };
        incr(counter);
    }
}

#[inline]
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[inline]
pub fn incr(counter: &AtomicU64) {
    add(counter, 1);
}

/// Identity of the tracer a payload came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Tags {
    pub lang: String,
    pub lang_version: String,
    pub interpreter: String,
    pub tracer_version: String,
}

/// Counters for one tracer identity.
#[derive(Debug, Default)]
pub struct TagStats {
    pub tags: Tags,
    pub counters: Counters,
    pub traces_dropped: TracesDropped,
    pub spans_malformed: SpansMalformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagStatsSnapshot {
    pub tags: Tags,
    #[serde(flatten)]
    pub counters: CountersSnapshot,
    pub traces_dropped: TracesDroppedSnapshot,
    pub spans_malformed: SpansMalformedSnapshot,
}

impl TagStats {
    pub fn new(tags: Tags) -> Self {
        Self {
            tags,
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> TagStatsSnapshot {
        TagStatsSnapshot {
            tags: self.tags.clone(),
            counters: self.counters.snapshot(),
            traces_dropped: self.traces_dropped.snapshot(),
            spans_malformed: self.spans_malformed.snapshot(),
        }
    }
}

/// Registry of [`TagStats`], one per tracer identity.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    stats: Mutex<HashMap<Tags, Arc<TagStats>>>,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counters for `tags`, creating them on first use.
    pub fn get_tag_stats(&self, tags: &Tags) -> Arc<TagStats> {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            stats
                .entry(tags.clone())
                .or_insert_with(|| Arc::new(TagStats::new(tags.clone()))),
        )
    }

    pub fn snapshot(&self) -> Vec<TagStatsSnapshot> {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshots: Vec<TagStatsSnapshot> = stats.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.tags.lang.cmp(&b.tags.lang));
        snapshots
    }

    /// Logs a summary line for every tracer that sent traffic.
    pub fn log_stats(&self) {
        for snapshot in self.snapshot() {
            let c = &snapshot.counters;
            if c.payloads_received == 0 {
                continue;
            }
            info!(
                "[lang:{} lang_version:{} tracer_version:{}] -> traces received: {}, traces filtered: {}, traces kept: {}, spans received: {}, spans dropped: {}, events extracted: {}, events sampled: {}, malformed traces: {}",
                snapshot.tags.lang,
                snapshot.tags.lang_version,
                snapshot.tags.tracer_version,
                c.traces_received,
                c.traces_filtered,
                c.traces_kept,
                c.spans_received,
                c.spans_dropped,
                c.events_extracted,
                c.events_sampled,
                snapshot.traces_dropped.total(),
            );
        }
    }
}
