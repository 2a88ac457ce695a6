// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use fnv::FnvHasher;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use super::grain::{grain_key, span_grain, TagSet};
use super::sublayers::SublayerValue;
use super::weight::WeightedSpan;
use super::{DURATION, ERRORS, HITS};

const SHARDS: usize = 8;

/// One measure of one grain within a bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Count {
    pub key: String,
    pub name: String,
    pub measure: String,
    pub tag_set: TagSet,
    /// Weight of the contributions that came from top level spans.
    pub top_level: f64,
    pub value: f64,
}

impl Count {
    pub fn new(name: &str, measure: &str, grain: &str, tag_set: TagSet) -> Self {
        Self {
            key: grain_key(name, measure, grain),
            name: name.to_string(),
            measure: measure.to_string(),
            tag_set,
            top_level: 0.0,
            value: 0.0,
        }
    }

    pub fn with_values(mut self, value: f64, top_level: f64) -> Self {
        self.value = value;
        self.top_level = top_level;
        self
    }

    pub fn merge(&mut self, other: &Count) {
        self.value += other.value;
        self.top_level += other.top_level;
    }
}

/// A closed time window of counts, keyed by count key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Bucket {
    /// Start of the window, in nanoseconds since the epoch.
    pub start: u64,
    pub duration: u64,
    pub counts: HashMap<String, Count>,
}

impl Bucket {
    pub fn new(start: u64, duration: u64) -> Self {
        Self {
            start,
            duration,
            counts: HashMap::new(),
        }
    }

    /// Adds `count`, accumulating into an existing count with the same key.
    pub fn add_count(&mut self, count: Count) {
        match self.counts.get_mut(&count.key) {
            Some(existing) => existing.merge(&count),
            None => {
                self.counts.insert(count.key.clone(), count);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// A live bucket receiving concurrent contributions.
///
/// Counts are sharded by key hash behind mutexes: contributions to the same
/// key serialize while different keys mostly proceed in parallel.
#[derive(Debug)]
pub struct RawBucket {
    start: u64,
    duration: u64,
    shards: Vec<Mutex<HashMap<String, Count>>>,
}

impl RawBucket {
    pub fn new(start: u64, duration: u64) -> Self {
        Self {
            start,
            duration,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    fn add(
        &self,
        name: &str,
        measure: &str,
        grain: &str,
        tag_set: &TagSet,
        value: f64,
        top_level: f64,
    ) {
        let key = grain_key(name, measure, grain);
        let mut h = FnvHasher::default();
        key.hash(&mut h);
        let shard = (h.finish() as usize) % self.shards.len();
        let mut counts = self.shards[shard]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = counts
            .entry(key)
            .or_insert_with(|| Count::new(name, measure, grain, tag_set.clone()));
        count.value += value;
        count.top_level += top_level;
    }

    /// Folds one span into the bucket. With `sublayers_only`, only the
    /// sublayer counts of subtrace roots are added.
    pub fn handle_span(
        &self,
        span: &WeightedSpan,
        env: &str,
        aggregators: &[String],
        sublayers: Option<&[SublayerValue]>,
        sublayers_only: bool,
    ) {
        let (grain, tag_set) = span_grain(&span.span, env, aggregators);
        let name = span.span.name.as_str();
        let top_level = if span.top_level { span.weight } else { 0.0 };

        if !sublayers_only {
            let error = if span.span.error != 0 {
                span.weight
            } else {
                0.0
            };
            self.add(name, HITS, &grain, &tag_set, span.weight, top_level);
            self.add(name, ERRORS, &grain, &tag_set, error, top_level);
            self.add(
                name,
                DURATION,
                &grain,
                &tag_set,
                span.weight * span.span.duration as f64,
                top_level,
            );
        }

        for sublayer in sublayers.unwrap_or_default() {
            let (sub_grain, sub_tags) = match &sublayer.tag {
                Some((tag, value)) => {
                    let mut tags = tag_set.clone();
                    tags.insert(tag.to_string(), value.clone());
                    (format!("{grain},{tag}:{value}"), tags)
                }
                None => (grain.clone(), tag_set.clone()),
            };
            self.add(
                name,
                sublayer.metric,
                &sub_grain,
                &sub_tags,
                span.weight * sublayer.value,
                top_level,
            );
        }
    }

    pub fn export(self) -> Bucket {
        let mut bucket = Bucket::new(self.start, self.duration);
        for shard in self.shards {
            let counts = shard.into_inner().unwrap_or_else(PoisonError::into_inner);
            bucket.counts.extend(counts);
        }
        bucket
    }
}
