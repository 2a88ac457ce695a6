// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Reasons a trace is rejected as a whole by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("empty trace")]
    EmptyTrace,

    #[error("empty `TraceID` on span {span_id}")]
    TraceIdZero { span_id: u64 },

    #[error("empty `SpanID` in trace {trace_id}")]
    SpanIdZero { trace_id: u64 },

    #[error("trace has foreign span (trace {expected}, span {span_id} belongs to trace {found})")]
    ForeignSpan {
        expected: u64,
        found: u64,
        span_id: u64,
    },

    #[error("duplicate `SpanID` {span_id} in trace {trace_id}")]
    DuplicateSpanId { trace_id: u64, span_id: u64 },
}

/// Errors raised while building the agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid replace rule for tag {name}: {source}")]
    InvalidReplaceRule {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid ignore resource pattern {pattern}: {source}")]
    InvalidIgnorePattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Could not parse DD_APM_REPLACE_TAGS: {0}")]
    ReplaceTagsJson(#[from] serde_json::Error),
}

/// Errors returned by output writers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriterError {
    #[error("writer is stopped")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = NormalizeError::ForeignSpan {
            expected: 1,
            found: 2,
            span_id: 3,
        };
        assert_eq!(
            error.to_string(),
            "trace has foreign span (trace 1, span 3 belongs to trace 2)"
        );
        let error = ConfigError::InvalidConfig("max tps must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: max tps must be positive"
        );
    }
}
