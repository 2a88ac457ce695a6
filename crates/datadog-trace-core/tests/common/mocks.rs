// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock implementations of agent components for testing

use datadog_trace_core::{
    agent::ProcessedTrace,
    error::WriterError,
    sampler::{SamplingDecision, TraceSampler},
    stats::StatsPayload,
    writer::{SampledSpans, StatsWriter, TraceWriter},
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Sampler returning a fixed decision and recording how often it was asked.
pub struct SpySampler {
    name: &'static str,
    decision: SamplingDecision,
    calls: AtomicUsize,
}

impl SpySampler {
    pub fn new(name: &'static str, keep: bool, rate: f64) -> Self {
        Self {
            name,
            decision: SamplingDecision::new(keep, rate),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TraceSampler for SpySampler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn evaluate(&self, _trace: &ProcessedTrace) -> SamplingDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}

/// Trace writer keeping every batch it receives
#[derive(Default)]
pub struct RecordingTraceWriter {
    pub batches: Mutex<Vec<SampledSpans>>,
}

impl RecordingTraceWriter {
    pub fn batches(&self) -> Vec<SampledSpans> {
        self.batches.lock().expect("batches lock").clone()
    }
}

#[async_trait::async_trait]
impl TraceWriter for RecordingTraceWriter {
    async fn write(&self, batch: SampledSpans) -> Result<(), WriterError> {
        self.batches.lock().expect("batches lock").push(batch);
        Ok(())
    }

    async fn stop(&self) {}
}

/// Stats writer keeping every payload it receives
#[derive(Default)]
pub struct RecordingStatsWriter {
    pub payloads: Mutex<Vec<StatsPayload>>,
}

impl RecordingStatsWriter {
    pub fn payloads(&self) -> Vec<StatsPayload> {
        self.payloads.lock().expect("payloads lock").clone()
    }
}

#[async_trait::async_trait]
impl StatsWriter for RecordingStatsWriter {
    async fn write(&self, payload: StatsPayload) -> Result<(), WriterError> {
        self.payloads.lock().expect("payloads lock").push(payload);
        Ok(())
    }

    async fn stop(&self) {}
}
