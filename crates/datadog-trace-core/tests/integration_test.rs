// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{create_tag_stats, create_test_agent, create_test_span, Spies};
use common::mocks::SpySampler;
use datadog_trace_core::{
    agent::{ingestion_channel, Agent, AgentState, Payload, ProcessedTrace},
    config::AgentConfig,
    pb::{ClientGroupedStats, ClientStatsBucket, ClientStatsPayload, Span, Trace},
    sampler::{KEY_SAMPLE_RATE, KEY_SAMPLING_PRIORITY},
    stats::{Count, StatsPayload, SublayerCalculator, DURATION, ERRORS, HITS},
    writer::{ChannelWriter, SampledSpans},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// 2001-01-01T00:00:00Z
const YEAR_2001_NANOS: i64 = 978_307_200_000_000_000;

fn trace_with_priority(priority: Option<f64>, error: bool) -> Trace {
    let mut root = create_test_span(1, 0, "web", "GET /users");
    if let Some(priority) = priority {
        root.metrics
            .insert(KEY_SAMPLING_PRIORITY.to_string(), priority);
    }
    if error {
        root.error = 1;
    }
    vec![root]
}

fn counts_by_measure(payload: &StatsPayload) -> HashMap<String, Count> {
    payload
        .stats
        .iter()
        .flat_map(|bucket| bucket.counts.values())
        .map(|count| (count.measure.clone(), count.clone()))
        .collect()
}

async fn process(agent: &Agent, traces: Vec<Trace>) -> Arc<datadog_trace_core::info::TagStats> {
    let source = create_tag_stats();
    let payload = Payload::new(traces, Arc::clone(&source));
    let mut calculator = SublayerCalculator::new();
    agent.process(payload, &mut calculator).await;
    source
}

#[tokio::test]
async fn test_negative_priority_invokes_no_sampler() {
    let test = create_test_agent(AgentConfig::default(), Spies::keep_all());
    let stats = create_tag_stats();
    let mut pt = ProcessedTrace::new(trace_with_priority(Some(-1.0), true), "prod");

    let (events, keep) = test.agent.sample(&stats, &mut pt);

    assert!(!keep);
    assert!(events.is_empty());
    assert_eq!(test.spies.total_calls(), 0);
    let counters = stats.counters.snapshot();
    assert_eq!(counters.traces_priority_neg, 1);
    assert_eq!(counters.traces_kept, 0);
}

#[tokio::test]
async fn test_negative_priority_trace_still_counted_in_stats() {
    let test = create_test_agent(AgentConfig::default(), Spies::keep_all());
    process(&test.agent, vec![trace_with_priority(Some(-1.0), false)]).await;

    assert!(test.traces.batches().is_empty());
    assert_eq!(test.spies.total_calls(), 0);
    let payload = test.agent.concentrator().flush(0, true).expect("stats");
    assert_eq!(counts_by_measure(&payload)["hits"].value, 1.0);
}

#[tokio::test]
async fn test_user_keep_trace_is_kept_without_error_sampler() {
    let test = create_test_agent(AgentConfig::default(), Spies::keep_all());
    let source = process(&test.agent, vec![trace_with_priority(Some(2.0), false)]).await;

    let batches = test.traces.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].traces.len(), 1);
    assert_eq!(source.counters.snapshot().traces_priority_2, 1);
    assert_eq!(test.spies.priority.calls(), 1);
    assert_eq!(test.spies.errors.calls(), 0);
}

#[tokio::test]
async fn test_dropped_error_trace_still_feeds_stats() {
    let spies = Spies::new(
        SpySampler::new("priority", true, 1.0),
        SpySampler::new("score", true, 1.0),
        SpySampler::new("errors", false, 0.5),
        SpySampler::new("exception", false, 1.0),
    );
    let test = create_test_agent(AgentConfig::default(), spies);
    let source = process(&test.agent, vec![trace_with_priority(None, true)]).await;

    assert_eq!(test.spies.errors.calls(), 1);
    assert_eq!(test.spies.score.calls(), 0);
    assert_eq!(test.spies.priority.calls(), 0);
    assert!(test.traces.batches().is_empty());
    assert_eq!(source.counters.snapshot().traces_priority_none, 1);

    let payload = test.agent.concentrator().flush(0, true).expect("stats");
    let counts = counts_by_measure(&payload);
    assert_eq!(counts["hits"].value, 1.0);
    assert_eq!(counts["errors"].value, 1.0);
    assert_eq!(counts["duration"].value, 1_000_000.0);
}

#[tokio::test]
async fn test_error_rates_combine_with_priority_rate() {
    let spies = Spies::new(
        SpySampler::new("priority", true, 0.5),
        SpySampler::new("score", true, 1.0),
        SpySampler::new("errors", true, 0.5),
        SpySampler::new("exception", true, 1.0),
    );
    let test = create_test_agent(AgentConfig::default(), spies);
    process(&test.agent, vec![trace_with_priority(Some(1.0), true)]).await;

    let batches = test.traces.batches();
    let rate = batches[0].traces[0][0].metrics[KEY_SAMPLE_RATE];
    assert!((rate - 1.0 / 3.0).abs() < 1e-12, "rate {rate}");
    // Error traces never reach the exception sampler.
    assert_eq!(test.spies.exception.calls(), 0);
}

#[tokio::test]
async fn test_exception_sampler_overrides_priority_drop() {
    let spies = Spies::new(
        SpySampler::new("priority", false, 0.8),
        SpySampler::new("score", false, 1.0),
        SpySampler::new("errors", false, 1.0),
        SpySampler::new("exception", true, 1.0),
    );
    let test = create_test_agent(AgentConfig::default(), spies);
    process(&test.agent, vec![trace_with_priority(Some(0.0), false)]).await;

    let batches = test.traces.batches();
    assert_eq!(batches.len(), 1);
    assert!(!batches[0].traces[0][0].metrics.contains_key(KEY_SAMPLE_RATE));
}

async fn batch_sizes(ceiling: usize, traces: usize) -> Vec<usize> {
    let config = AgentConfig {
        max_payload_size: ceiling,
        ..Default::default()
    };
    let test = create_test_agent(config, Spies::keep_all());
    let traces = (0..traces).map(|_| trace_with_priority(None, false)).collect();
    process(&test.agent, traces).await;
    test.traces
        .batches()
        .iter()
        .map(|batch| batch.traces.len())
        .collect()
}

#[tokio::test]
async fn test_batches_flush_at_ceiling() {
    let single = create_test_agent(AgentConfig::default(), Spies::keep_all());
    process(&single.agent, vec![trace_with_priority(None, false)]).await;
    let size = single.traces.batches()[0].size;

    assert_eq!(batch_sizes(3 * size, 7).await, vec![3, 3, 1]);
    // Reaching the ceiling exactly flushes once, never early.
    assert_eq!(batch_sizes(3 * size, 6).await, vec![3, 3]);
    assert_eq!(batch_sizes(3 * size + 1, 6).await, vec![4, 2]);
}

#[tokio::test]
async fn test_client_stats_merge_with_agent_stats() {
    let test = create_test_agent(AgentConfig::default(), Spies::keep_all());
    let payload = ClientStatsPayload {
        stats: vec![ClientStatsBucket {
            start: 0,
            duration: 10_000_000_000,
            stats: vec![ClientGroupedStats {
                service: "S".to_string(),
                name: "http.request".to_string(),
                resource: "R".to_string(),
                hits: 10,
                errors: 2,
                duration: 500,
                ..Default::default()
            }],
        }],
        ..Default::default()
    };
    test.agent.process_stats(payload, "python").await;

    let client = test.stats.payloads();
    assert_eq!(client.len(), 1);
    let mut bucket = client[0].stats[0].clone();
    assert_eq!(bucket.counts.len(), 3);
    // Services are tag normalized on both paths.
    let grain = "env:none,resource:R,service:s";
    let hits = format!("http.request|hits|{grain}");
    let errors = format!("http.request|errors|{grain}");
    let duration = format!("http.request|duration|{grain}");
    assert_eq!(bucket.counts[&hits].value, 10.0);
    assert_eq!(bucket.counts[&errors].value, 2.0);
    assert_eq!(bucket.counts[&duration].value, 500.0);

    process(&test.agent, vec![vec![create_test_span(1, 0, "S", "R")]]).await;
    let concentrator = test.agent.concentrator();
    let agent_stats = concentrator.flush(0, true).expect("agent stats");
    // Sublayer counts only exist on the agent path.
    let measures = [HITS, ERRORS, DURATION];
    for count in agent_stats.stats[0]
        .counts
        .values()
        .filter(|count| measures.contains(&count.measure.as_str()))
    {
        assert!(bucket.counts.contains_key(&count.key), "{}", count.key);
        bucket.add_count(count.clone());
    }
    assert_eq!(bucket.counts.len(), 3);
    assert_eq!(bucket.counts[&hits].value, 11.0);
}

#[tokio::test]
async fn test_late_spans_are_dropped_and_counted() {
    let test = create_test_agent(AgentConfig::default(), Spies::keep_all());
    let mut late = create_test_span(1, 0, "web", "GET /");
    late.start = YEAR_2001_NANOS;
    let mut child = create_test_span(2, 1, "db", "SELECT");
    child.start = YEAR_2001_NANOS;
    process(&test.agent, vec![vec![late, child]]).await;

    // Both spans are top level.
    assert_eq!(test.agent.concentrator().late_spans(), 2);
    assert!(test.agent.concentrator().flush(0, true).is_none());
    // The trace itself is still sampled and written.
    assert_eq!(test.traces.batches().len(), 1);
}

#[tokio::test]
async fn test_cancelled_agent_counts_queued_payloads() {
    let config = AgentConfig {
        workers: 2,
        ..Default::default()
    };
    let test = create_test_agent(config, Spies::keep_all());
    let agent = Arc::new(test.agent);
    let (tx, rx) = ingestion_channel(agent.config());
    for _ in 0..3 {
        let traces = vec![trace_with_priority(Some(1.0), false)];
        let payload = Payload::new(traces, create_tag_stats());
        tx.send(payload).await.expect("queue has room");
    }
    let cancel = CancellationToken::new();
    cancel.cancel();

    Arc::clone(&agent).run(rx, cancel).await;

    assert_eq!(agent.state().await, AgentState::Stopped);
    assert_eq!(agent.payloads_dropped(), 3);
    assert!(test.traces.batches().is_empty());
    assert!(tx.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_process_every_payload() {
    let config = AgentConfig {
        workers: 4,
        bucket_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let (trace_writer, mut traces_rx) = ChannelWriter::<SampledSpans>::new(8);
    let (stats_writer, mut stats_rx) = ChannelWriter::<StatsPayload>::new(8);
    let agent = Arc::new(
        Agent::from_config(config, Arc::new(trace_writer), Arc::new(stats_writer))
            .expect("valid config"),
    );
    let (tx, rx) = ingestion_channel(agent.config());
    let handle = tokio::spawn(Arc::clone(&agent).run(rx, CancellationToken::new()));

    let collector = tokio::spawn(async move {
        let mut traces = 0;
        while let Some(batch) = traces_rx.recv().await {
            traces += batch.traces.len();
        }
        traces
    });

    let source = create_tag_stats();
    for i in 0..50u64 {
        let mut root: Span = create_test_span(1, 0, "web", "GET /users");
        root.trace_id = i + 1;
        root.metrics.insert(KEY_SAMPLING_PRIORITY.to_string(), 1.0);
        tx.send(Payload::new(vec![vec![root]], Arc::clone(&source)))
            .await
            .expect("agent is receiving");
    }
    drop(tx);
    handle.await.expect("agent task");

    assert_eq!(collector.await.expect("collector task"), 50);
    let counters = source.counters.snapshot();
    assert_eq!(counters.payloads_received, 50);
    assert_eq!(counters.traces_priority_1, 50);

    let mut hits = 0.0;
    while let Some(payload) = stats_rx.recv().await {
        hits += payload
            .stats
            .iter()
            .flat_map(|bucket| bucket.counts.values())
            .filter(|count| count.measure == "hits")
            .map(|count| count.value)
            .sum::<f64>();
    }
    assert_eq!(hits, 50.0);
}
