// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use datadog_trace_core::{
    agent::{Agent, Components, Samplers},
    config::AgentConfig,
    event::NoopExtractor,
    filters::FilterChain,
    info::{TagStats, Tags},
    pb::Span,
    sampler::TraceSampler,
    writer::{StatsWriter, TraceWriter},
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::mocks::{RecordingStatsWriter, RecordingTraceWriter, SpySampler};

pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_nanos() as i64
}

/// A valid span of trace 42 that ended just now.
pub fn create_test_span(span_id: u64, parent_id: u64, service: &str, resource: &str) -> Span {
    Span {
        trace_id: 42,
        span_id,
        parent_id,
        service: service.to_string(),
        name: "http.request".to_string(),
        resource: resource.to_string(),
        start: now_nanos() - 2_000_000,
        duration: 1_000_000,
        ..Default::default()
    }
}

pub fn create_tag_stats() -> Arc<TagStats> {
    Arc::new(TagStats::new(Tags {
        lang: "python".to_string(),
        tracer_version: "2.0.0".to_string(),
        ..Default::default()
    }))
}

/// Spies standing in for the four samplers.
pub struct Spies {
    pub priority: Arc<SpySampler>,
    pub score: Arc<SpySampler>,
    pub errors: Arc<SpySampler>,
    pub exception: Arc<SpySampler>,
}

impl Spies {
    pub fn new(
        priority: SpySampler,
        score: SpySampler,
        errors: SpySampler,
        exception: SpySampler,
    ) -> Self {
        Self {
            priority: Arc::new(priority),
            score: Arc::new(score),
            errors: Arc::new(errors),
            exception: Arc::new(exception),
        }
    }

    /// Spies keeping every trace at rate 1, except the exception one.
    pub fn keep_all() -> Self {
        Self::new(
            SpySampler::new("priority", true, 1.0),
            SpySampler::new("score", true, 1.0),
            SpySampler::new("errors", true, 1.0),
            SpySampler::new("exception", false, 1.0),
        )
    }

    pub fn total_calls(&self) -> usize {
        self.priority.calls() + self.score.calls() + self.errors.calls() + self.exception.calls()
    }

    fn samplers(&self) -> Samplers {
        Samplers {
            priority: Arc::clone(&self.priority) as Arc<dyn TraceSampler>,
            score: Arc::clone(&self.score) as Arc<dyn TraceSampler>,
            errors: Arc::clone(&self.errors) as Arc<dyn TraceSampler>,
            exception: Arc::clone(&self.exception) as Arc<dyn TraceSampler>,
        }
    }
}

pub struct TestAgent {
    pub agent: Agent,
    pub spies: Spies,
    pub traces: Arc<RecordingTraceWriter>,
    pub stats: Arc<RecordingStatsWriter>,
}

/// An agent wired to spy samplers and recording writers.
pub fn create_test_agent(config: AgentConfig, spies: Spies) -> TestAgent {
    let traces = Arc::new(RecordingTraceWriter::default());
    let stats = Arc::new(RecordingStatsWriter::default());
    let components = Components {
        filters: FilterChain::default(),
        samplers: spies.samplers(),
        extractor: Box::new(NoopExtractor),
        trace_writer: Arc::clone(&traces) as Arc<dyn TraceWriter>,
        stats_writer: Arc::clone(&stats) as Arc<dyn StatsWriter>,
    };
    TestAgent {
        agent: Agent::new(config, components),
        spies,
        traces,
        stats,
    }
}
