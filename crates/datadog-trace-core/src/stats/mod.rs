// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time bucketed hits, errors and duration aggregation.

use serde::Serialize;

pub mod bucket;
pub mod concentrator;
pub mod grain;
pub mod sublayers;
pub mod weight;

pub use bucket::{Bucket, Count, RawBucket};
pub use concentrator::{Concentrator, Input};
pub use grain::{assemble_grain, grain_key, TagSet};
pub use sublayers::{extract_subtraces, set_sublayers_on_span, SublayerCalculator, SublayerValue};
pub use weight::{new_weighted_trace, WeightedSpan, WeightedTrace};

pub const HITS: &str = "hits";
pub const ERRORS: &str = "errors";
pub const DURATION: &str = "duration";

/// Buckets handed to the stats writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsPayload {
    pub hostname: String,
    pub env: String,
    pub stats: Vec<Bucket>,
}
