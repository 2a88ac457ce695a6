// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregates the weighted spans of every processed trace into fixed width
//! time buckets, and periodically emits the buckets that can no longer
//! receive data.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bucket::RawBucket;
use super::grain::DEFAULT_AGGREGATORS;
use super::sublayers::SublayerValue;
use super::weight::{WeightedSpan, WeightedTrace};
use super::StatsPayload;
use crate::config::AgentConfig;
use crate::writer::StatsWriter;

/// Number of most recent buckets kept open for late spans.
const BUFFER_LEN: u64 = 2;

/// Stats contribution of one processed trace.
#[derive(Debug, Clone, Default)]
pub struct Input {
    pub trace: WeightedTrace,
    /// Sublayer values keyed by the span id of their subtrace root.
    pub sublayers: HashMap<u64, Vec<SublayerValue>>,
    pub env: String,
    /// Set when the client already computed the regular stats.
    pub sublayers_only: bool,
}

#[derive(Debug)]
struct State {
    buckets: BTreeMap<u64, RawBucket>,
    // Spans ending before this timestamp are late.
    oldest_ts: u64,
}

#[derive(Debug)]
pub struct Concentrator {
    bsize: u64,
    aggregators: Vec<String>,
    hostname: String,
    env: String,
    state: RwLock<State>,
    late_spans: AtomicU64,
}

pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl Concentrator {
    pub fn new(
        bucket_interval: Duration,
        extra_aggregators: &[String],
        hostname: &str,
        env: &str,
        now: u64,
    ) -> Self {
        let bsize = u64::try_from(bucket_interval.as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);
        let mut aggregators: Vec<String> =
            DEFAULT_AGGREGATORS.iter().map(|a| a.to_string()).collect();
        for extra in extra_aggregators {
            if !aggregators.contains(extra) {
                aggregators.push(extra.clone());
            }
        }
        let oldest_ts = (now - now % bsize).saturating_sub((BUFFER_LEN - 1) * bsize);
        Self {
            bsize,
            aggregators,
            hostname: hostname.to_string(),
            env: env.to_string(),
            state: RwLock::new(State {
                buckets: BTreeMap::new(),
                oldest_ts,
            }),
            late_spans: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AgentConfig, now: u64) -> Self {
        Self::new(
            config.bucket_interval,
            &config.extra_aggregators,
            &config.hostname,
            &config.default_env,
            now,
        )
    }

    pub fn bucket_size(&self) -> u64 {
        self.bsize
    }

    pub fn aggregators(&self) -> &[String] {
        &self.aggregators
    }

    /// Spans dropped so far because their bucket was already flushed.
    pub fn late_spans(&self) -> u64 {
        self.late_spans.load(Ordering::Relaxed)
    }

    pub fn add(&self, inputs: &[Input]) {
        for input in inputs {
            let mut late = 0u64;
            for span in input
                .trace
                .iter()
                .filter(|span| span.top_level || span.measured)
            {
                if !self.add_span(span, input) {
                    late += 1;
                }
            }
            if late > 0 {
                self.late_spans.fetch_add(late, Ordering::Relaxed);
                warn!("Dropped {late} late spans of env {}", input.env);
            }
        }
    }

    // Returns false when the span is too late to be aggregated.
    fn add_span(&self, span: &WeightedSpan, input: &Input) -> bool {
        let end = u64::try_from(span.span.start.saturating_add(span.span.duration)).unwrap_or(0);
        let ts = end - end % self.bsize;
        let sublayers = input.sublayers.get(&span.span.span_id).map(Vec::as_slice);
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if ts < state.oldest_ts {
                return false;
            }
            if let Some(bucket) = state.buckets.get(&ts) {
                bucket.handle_span(
                    span,
                    &input.env,
                    &self.aggregators,
                    sublayers,
                    input.sublayers_only,
                );
                return true;
            }
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if ts < state.oldest_ts {
            return false;
        }
        let bsize = self.bsize;
        state
            .buckets
            .entry(ts)
            .or_insert_with(|| RawBucket::new(ts, bsize))
            .handle_span(
                span,
                &input.env,
                &self.aggregators,
                sublayers,
                input.sublayers_only,
            );
        true
    }

    /// Emits every bucket older than the `BUFFER_LEN` most recent ones, or
    /// every bucket when `force` is set. Returns `None` when nothing was emitted.
    pub fn flush(&self, now: u64, force: bool) -> Option<StatsPayload> {
        let flushed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if force {
                std::mem::take(&mut state.buckets)
            } else {
                let cutoff = (now - now % self.bsize).saturating_sub((BUFFER_LEN - 1) * self.bsize);
                let kept = state.buckets.split_off(&cutoff);
                if cutoff > state.oldest_ts {
                    state.oldest_ts = cutoff;
                }
                std::mem::replace(&mut state.buckets, kept)
            }
        };
        let stats: Vec<_> = flushed
            .into_values()
            .map(RawBucket::export)
            .filter(|bucket| !bucket.is_empty())
            .collect();
        if stats.is_empty() {
            return None;
        }
        debug!("Flushing {} stats buckets", stats.len());
        Some(StatsPayload {
            hostname: self.hostname.clone(),
            env: self.env.clone(),
            stats,
        })
    }

    /// Flushes on every bucket interval until `cancel` fires, then flushes
    /// everything left.
    pub async fn run(self: Arc<Self>, writer: Arc<dyn StatsWriter>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_nanos(self.bsize));
        interval.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Some(payload) = self.flush(now_nanos(), true) {
                        write_payload(writer.as_ref(), payload).await;
                    }
                    info!("Stats concentrator stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Some(payload) = self.flush(now_nanos(), false) {
                        write_payload(writer.as_ref(), payload).await;
                    }
                }
            }
        }
    }
}

async fn write_payload(writer: &dyn StatsWriter, payload: StatsPayload) {
    if let Err(e) = writer.write(payload).await {
        error!("Failed to write stats payload: {e}");
    }
}
