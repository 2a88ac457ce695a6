// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire-level data model shared by the decoder, the pipeline and the writers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Span {
    /// service is the name of the service with which this span is associated.
    #[serde(default)]
    pub service: String,
    /// name is the operation name of this span.
    pub name: String,
    /// resource is the resource name of this span, also sometimes called the endpoint (for web spans).
    pub resource: String,
    /// traceID is the ID of the trace to which this span belongs.
    pub trace_id: u64,
    /// spanID is the ID of this span.
    pub span_id: u64,
    /// parentID is the ID of this span's parent, or zero if this span has no parent.
    #[serde(default)]
    pub parent_id: u64,
    /// start is the number of nanoseconds between the Unix epoch and the beginning of this span.
    pub start: i64,
    /// duration is the time length of this span in nanoseconds.
    pub duration: i64,
    /// error is 1 if there is an error associated with this span, or 0 if there is not.
    #[serde(default)]
    pub error: i32,
    /// meta is a mapping from tag name to tag value for string-valued tags.
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// metrics is a mapping from tag name to tag value for numeric-valued tags.
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// type is the type of the service with which this span is associated.  Example values: web, db, lambda.
    #[serde(default, rename = "type")]
    pub r#type: String,
}

/// A trace is the list of spans sharing one trace id, in the order the client sent them.
pub type Trace = Vec<Span>;

/// ClientStatsPayload is the first layer of span stats aggregation. It is also
/// the payload sent by tracers to the agent when stats in tracer are enabled.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ClientStatsPayload {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub stats: Vec<ClientStatsBucket>,
}

/// ClientStatsBucket is a time bucket containing aggregated stats.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ClientStatsBucket {
    /// bucket start in nanoseconds
    pub start: u64,
    /// bucket duration in nanoseconds
    pub duration: u64,
    #[serde(default)]
    pub stats: Vec<ClientGroupedStats>,
}

/// ClientGroupedStats aggregate stats on spans grouped by service, name, resource, status_code, type
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ClientGroupedStats {
    #[serde(default)]
    pub service: String,
    pub name: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default, rename = "HTTP_status_code")]
    pub http_status_code: u32,
    #[serde(default, rename = "type")]
    pub r#type: String,
    #[serde(default, rename = "DB_type")]
    pub db_type: String,
    pub hits: u64,
    pub errors: u64,
    pub duration: u64,
}
