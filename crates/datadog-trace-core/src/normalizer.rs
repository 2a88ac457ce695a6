// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Validation and canonicalization of incoming traces and client stats.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::NormalizeError;
use crate::info::{incr, SpansMalformed, TagStats};
use crate::pb::{ClientGroupedStats, Span, Trace};

pub const MAX_SERVICE_LEN: usize = 100;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_TYPE_LEN: usize = 100;
pub const MAX_TAG_LEN: usize = 200;
pub const MAX_RESOURCE_LEN: usize = 5000;
pub const MAX_META_KEY_LEN: usize = 200;
pub const MAX_META_VALUE_LEN: usize = 25000;
pub const MAX_METRIC_KEY_LEN: usize = 200;

pub const DEFAULT_SPAN_NAME: &str = "unnamed_operation";
pub const DEFAULT_SERVICE_NAME: &str = "unnamed-service";

// 2000-01-01T00:00:00Z
const YEAR_2000_NANOS: i64 = 946_684_800_000_000_000;
const HTTP_STATUS_CODE_KEY: &str = "http.status_code";

/// Returns the longest prefix of `s` of at most `limit` bytes ending on a char boundary.
pub fn truncate_utf8(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn truncate_in_place(s: &mut String, limit: usize) -> bool {
    let len = truncate_utf8(s, limit).len();
    if len == s.len() {
        return false;
    }
    s.truncate(len);
    true
}

/// Normalizes a tag following the Datadog tag rules: lowercase, starting with
/// a letter, only `[a-z0-9_:./-]` characters with invalid runs replaced by a
/// single `_`, no trailing `_`, at most 200 bytes.
pub fn normalize_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len().min(MAX_TAG_LEN));
    for c in value.chars().flat_map(char::to_lowercase) {
        if out.len() + c.len_utf8() > MAX_TAG_LEN {
            break;
        }
        if out.is_empty() {
            if c.is_alphabetic() {
                out.push(c);
            }
            continue;
        }
        if c.is_alphanumeric() || matches!(c, ':' | '.' | '/' | '-') {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Normalizes a metric name: starts with a letter, only `[a-zA-Z0-9_.]`
/// characters, invalid runs collapsed to one `_`, `_.` folded into `.`.
/// Returns `None` when nothing valid remains.
pub fn normalize_name(name: &str) -> Option<String> {
    let name = truncate_utf8(name, MAX_NAME_LEN);
    let start = name.find(|c: char| c.is_ascii_alphabetic())?;
    let mut out = String::with_capacity(name.len() - start);
    for c in name[start..].chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if c == '.' {
            if out.ends_with('_') {
                out.pop();
            }
            out.push('.');
        } else if !out.ends_with('_') && !out.ends_with('.') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        return None;
    }
    Some(out)
}

fn count(malformed: Option<&SpansMalformed>, counter: impl Fn(&SpansMalformed) -> &AtomicU64) {
    if let Some(malformed) = malformed {
        incr(counter(malformed));
    }
}

fn fallback_service(lang: &str) -> String {
    if lang.is_empty() {
        return DEFAULT_SERVICE_NAME.to_string();
    }
    format!("unnamed-{lang}-service")
}

fn normalize_service(service: &str, lang: &str, malformed: Option<&SpansMalformed>) -> String {
    if service.is_empty() {
        count(malformed, |m| &m.service_empty);
        return fallback_service(lang);
    }
    if service.len() > MAX_SERVICE_LEN {
        count(malformed, |m| &m.service_truncate);
    }
    let normalized = normalize_tag(truncate_utf8(service, MAX_SERVICE_LEN));
    if normalized.is_empty() {
        count(malformed, |m| &m.service_invalid);
        return fallback_service(lang);
    }
    normalized
}

fn normalize_span_name(name: &str, malformed: Option<&SpansMalformed>) -> String {
    if name.is_empty() {
        count(malformed, |m| &m.span_name_empty);
        return DEFAULT_SPAN_NAME.to_string();
    }
    if name.len() > MAX_NAME_LEN {
        count(malformed, |m| &m.span_name_truncate);
    }
    match normalize_name(name) {
        Some(name) => name,
        None => {
            count(malformed, |m| &m.span_name_invalid);
            DEFAULT_SPAN_NAME.to_string()
        }
    }
}

fn is_valid_status_code(code: &str) -> bool {
    code.parse::<u16>()
        .is_ok_and(|code| (100..600).contains(&code))
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn normalize_span(span: &mut Span, lang: &str, malformed: &SpansMalformed) {
    span.service = normalize_service(&span.service, lang, Some(malformed));
    span.name = normalize_span_name(&span.name, Some(malformed));

    if span.resource.is_empty() {
        incr(&malformed.resource_empty);
        span.resource = span.name.clone();
    }
    if span.parent_id == span.span_id {
        incr(&malformed.parent_id_is_span_id);
        span.parent_id = 0;
    }
    if span.duration < 0 {
        incr(&malformed.invalid_duration);
        span.duration = 0;
    }
    if span.duration > i64::MAX - span.start.max(0) {
        incr(&malformed.invalid_duration);
        span.duration = 0;
    }
    if span.start < YEAR_2000_NANOS {
        incr(&malformed.invalid_start_date);
        let now = now_nanos();
        span.start = now - span.duration;
        if span.start < 0 {
            span.start = now;
        }
    }
    if truncate_in_place(&mut span.r#type, MAX_TYPE_LEN) {
        incr(&malformed.type_truncate);
    }
    if let Some(env) = span.meta.get_mut("env") {
        *env = normalize_tag(env);
    }
    if span
        .meta
        .get(HTTP_STATUS_CODE_KEY)
        .is_some_and(|code| !is_valid_status_code(code))
    {
        incr(&malformed.invalid_http_status_code);
        span.meta.remove(HTTP_STATUS_CODE_KEY);
    }
}

fn check_ids(trace: &Trace) -> Result<(), NormalizeError> {
    let first = trace.first().ok_or(NormalizeError::EmptyTrace)?;
    let trace_id = first.trace_id;
    let mut span_ids = HashSet::with_capacity(trace.len());
    for span in trace {
        if span.trace_id == 0 {
            return Err(NormalizeError::TraceIdZero {
                span_id: span.span_id,
            });
        }
        if span.span_id == 0 {
            return Err(NormalizeError::SpanIdZero {
                trace_id: span.trace_id,
            });
        }
        if span.trace_id != trace_id {
            return Err(NormalizeError::ForeignSpan {
                expected: trace_id,
                found: span.trace_id,
                span_id: span.span_id,
            });
        }
        if !span_ids.insert(span.span_id) {
            return Err(NormalizeError::DuplicateSpanId {
                trace_id,
                span_id: span.span_id,
            });
        }
    }
    Ok(())
}

/// Validates `trace` as a unit and fixes its spans in place.
///
/// A rejected trace is counted under its drop reason in `stats` and must not
/// be processed further.
pub fn normalize_trace(stats: &TagStats, trace: &mut Trace) -> Result<(), NormalizeError> {
    if let Err(err) = check_ids(trace) {
        debug!("Dropping invalid trace: {err}");
        stats.traces_dropped.record(&err);
        return Err(err);
    }
    for span in trace.iter_mut() {
        normalize_span(span, &stats.tags.lang, &stats.spans_malformed);
    }
    Ok(())
}

/// Enforces the size limits on span fields the backend accepts.
pub fn truncate(span: &mut Span) {
    truncate_in_place(&mut span.resource, MAX_RESOURCE_LEN);

    if span
        .meta
        .iter()
        .any(|(k, v)| k.len() > MAX_META_KEY_LEN || v.len() > MAX_META_VALUE_LEN)
    {
        span.meta = std::mem::take(&mut span.meta)
            .into_iter()
            .map(|(mut k, mut v)| {
                if truncate_in_place(&mut k, MAX_META_KEY_LEN) {
                    k.push_str("...");
                }
                if truncate_in_place(&mut v, MAX_META_VALUE_LEN) {
                    v.push_str("...");
                }
                (k, v)
            })
            .collect();
    }
    if span.metrics.keys().any(|k| k.len() > MAX_METRIC_KEY_LEN) {
        span.metrics = std::mem::take(&mut span.metrics)
            .into_iter()
            .map(|(mut k, v)| {
                if truncate_in_place(&mut k, MAX_METRIC_KEY_LEN) {
                    k.push_str("...");
                }
                (k, v)
            })
            .collect();
    }
}

/// Canonicalizes a client stats group the same way spans are normalized.
pub fn normalize_stats_group(group: &mut ClientGroupedStats, lang: &str) {
    group.service = normalize_service(&group.service, lang, None);
    group.name = normalize_span_name(&group.name, None);
    if group.resource.is_empty() {
        group.resource = group.name.clone();
    }
    truncate_in_place(&mut group.resource, MAX_RESOURCE_LEN);
    truncate_in_place(&mut group.r#type, MAX_TYPE_LEN);
    if group.http_status_code != 0 && !(100..600).contains(&group.http_status_code) {
        group.http_status_code = 0;
    }
}
