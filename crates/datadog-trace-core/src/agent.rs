// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The pipeline driver: a pool of workers pulling payloads from a shared
//! bounded queue and running every trace through normalization, filtering,
//! sampling, stats aggregation and batching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::ConfigError;
use crate::event::{EventExtractor, MetricBasedExtractor};
use crate::filters::FilterChain;
use crate::info::{add, incr, ReceiverStats, TagStats};
use crate::normalizer::{normalize_stats_group, normalize_tag, normalize_trace};
use crate::pb::{ClientStatsPayload, Span, Trace};
use crate::sampler::{
    add_trace_rate, combine_rates, get_sampling_priority, get_trace_rate, run_maintenance,
    set_client_rate, ErrorsSampler, ExceptionSampler, PrioritySampler, SamplingDecision,
    ScoreSampler, TraceSampler,
};
use crate::stats::grain::{HTTP_STATUS_CODE_TAG, VERSION_TAG};
use crate::stats::{
    assemble_grain, extract_subtraces, new_weighted_trace, set_sublayers_on_span, Bucket,
    Concentrator, Count, Input, StatsPayload, SublayerCalculator, SublayerValue, WeightedTrace,
    DURATION, ERRORS, HITS,
};
use crate::traceutil::{compute_top_level, get_env, get_root, set_meta, trace_contains_error};
use crate::writer::{BatchAssembler, SampledSpans, StatsWriter, TraceWriter};

/// Root span meta holding the tags of the container the tracer runs in.
pub const KEY_CONTAINER_TAGS: &str = "_dd.tags.container";

/// A trace along with what the pipeline derives from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedTrace {
    pub trace: Trace,
    pub root: usize,
    pub env: String,
    /// Spans weighted by the inverse of the client sampling rate, for stats.
    pub weighted_trace: WeightedTrace,
    /// Sublayer values keyed by the span id of each subtrace root.
    pub sublayers: HashMap<u64, Vec<SublayerValue>>,
}

impl ProcessedTrace {
    /// `trace` must not be empty.
    pub fn new(trace: Trace, env: &str) -> Self {
        let root = get_root(&trace);
        Self::with_root(trace, root, env)
    }

    pub fn with_root(trace: Trace, root: usize, env: &str) -> Self {
        let weighted_trace = new_weighted_trace(&trace, root);
        Self {
            trace,
            root,
            env: env.to_string(),
            weighted_trace,
            sublayers: HashMap::new(),
        }
    }

    pub fn root_span(&self) -> &Span {
        &self.trace[self.root]
    }

    pub fn root_span_mut(&mut self) -> &mut Span {
        &mut self.trace[self.root]
    }
}

/// A decoded tracer payload.
#[derive(Debug, Clone)]
pub struct Payload {
    pub traces: Vec<Trace>,
    pub container_tags: String,
    pub client_computed_top_level: bool,
    pub client_computed_stats: bool,
    /// Counters of the tracer that sent the payload.
    pub source: Arc<TagStats>,
}

impl Payload {
    pub fn new(traces: Vec<Trace>, source: Arc<TagStats>) -> Self {
        Self {
            traces,
            container_tags: String::new(),
            client_computed_top_level: false,
            client_computed_stats: false,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// The four samplers consulted for every trace.
#[derive(Clone)]
pub struct Samplers {
    pub priority: Arc<dyn TraceSampler>,
    pub score: Arc<dyn TraceSampler>,
    pub errors: Arc<dyn TraceSampler>,
    pub exception: Arc<dyn TraceSampler>,
}

impl Samplers {
    fn all(&self) -> [&Arc<dyn TraceSampler>; 4] {
        [&self.priority, &self.score, &self.errors, &self.exception]
    }
}

/// Everything an [`Agent`] hands traces and stats to.
pub struct Components {
    pub filters: FilterChain,
    pub samplers: Samplers,
    pub extractor: Box<dyn EventExtractor>,
    pub trace_writer: Arc<dyn TraceWriter>,
    pub stats_writer: Arc<dyn StatsWriter>,
}

pub struct Agent {
    config: Arc<AgentConfig>,
    receiver_stats: Arc<ReceiverStats>,
    filters: FilterChain,
    samplers: Samplers,
    extractor: Box<dyn EventExtractor>,
    concentrator: Arc<Concentrator>,
    trace_writer: Arc<dyn TraceWriter>,
    stats_writer: Arc<dyn StatsWriter>,
    priority_sampler: Option<Arc<PrioritySampler>>,
    state: RwLock<AgentState>,
    payloads_dropped: AtomicU64,
}

/// Creates the bounded queue producers hand payloads to the agent through.
pub fn ingestion_channel(config: &AgentConfig) -> (Sender<Payload>, Receiver<Payload>) {
    mpsc::channel(config.ingestion_queue_size.max(1))
}

impl Agent {
    pub fn new(config: AgentConfig, components: Components) -> Self {
        let now = crate::stats::concentrator::now_nanos();
        let concentrator = Arc::new(Concentrator::from_config(&config, now));
        Self {
            config: Arc::new(config),
            receiver_stats: Arc::new(ReceiverStats::new()),
            filters: components.filters,
            samplers: components.samplers,
            extractor: components.extractor,
            concentrator,
            trace_writer: components.trace_writer,
            stats_writer: components.stats_writer,
            priority_sampler: None,
            state: RwLock::new(AgentState::Idle),
            payloads_dropped: AtomicU64::new(0),
        }
    }

    /// Builds an agent with the default samplers, filters and event extractor.
    pub fn from_config(
        config: AgentConfig,
        trace_writer: Arc<dyn TraceWriter>,
        stats_writer: Arc<dyn StatsWriter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let priority = Arc::new(PrioritySampler::new(
            config.max_tps,
            &config.default_env,
            config.decay_period,
        ));
        let samplers = Samplers {
            priority: Arc::clone(&priority) as Arc<dyn TraceSampler>,
            score: Arc::new(ScoreSampler::new(
                config.max_tps,
                config.extra_sample_rate,
                config.decay_period,
            )),
            errors: Arc::new(ErrorsSampler::new(
                config.error_tps,
                config.extra_sample_rate,
                config.decay_period,
            )),
            exception: Arc::new(ExceptionSampler::new(config.exception_ttl, config.exception_tps)),
        };
        let components = Components {
            filters: FilterChain::from_config(&config)?,
            samplers,
            extractor: Box::new(MetricBasedExtractor::new(config.max_eps)),
            trace_writer,
            stats_writer,
        };
        let mut agent = Self::new(config, components);
        agent.priority_sampler = Some(priority);
        Ok(agent)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn receiver_stats(&self) -> &Arc<ReceiverStats> {
        &self.receiver_stats
    }

    pub fn concentrator(&self) -> &Arc<Concentrator> {
        &self.concentrator
    }

    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Payloads still queued when the agent stopped.
    pub fn payloads_dropped(&self) -> u64 {
        self.payloads_dropped.load(Ordering::Relaxed)
    }

    /// Sampling rates by `service:<s>,env:<e>` to feed back to tracers.
    pub fn rates_by_service(&self) -> HashMap<String, f64> {
        self.priority_sampler
            .as_ref()
            .map(|sampler| sampler.rates_by_service())
            .unwrap_or_default()
    }

    /// Runs every trace of `payload` through the pipeline, then hands the
    /// stats inputs to the concentrator.
    pub async fn process(&self, payload: Payload, calculator: &mut SublayerCalculator) {
        let stats = Arc::clone(&payload.source);
        incr(&stats.counters.payloads_received);
        let mut assembler = BatchAssembler::new(self.config.max_payload_size);
        let mut inputs = Vec::with_capacity(payload.traces.len());

        for mut trace in payload.traces {
            incr(&stats.counters.traces_received);
            add(&stats.counters.spans_received, trace.len() as u64);

            if let Err(e) = normalize_trace(&stats, &mut trace) {
                debug!("Dropping invalid trace: {e}");
                add(&stats.counters.spans_dropped, trace.len() as u64);
                continue;
            }
            let root = get_root(&trace);
            if !self.filters.apply(&mut trace, root) {
                debug!("Trace rejected by ignore resources rules");
                incr(&stats.counters.traces_filtered);
                add(&stats.counters.spans_filtered, trace.len() as u64);
                continue;
            }
            let root_span = &mut trace[root];
            let client_rate = get_trace_rate(root_span);
            set_client_rate(root_span, client_rate);
            if !payload.container_tags.is_empty() {
                set_meta(root_span, KEY_CONTAINER_TAGS, &payload.container_tags);
            }
            if !payload.client_computed_top_level {
                compute_top_level(&mut trace);
            }
            let env = get_env(&trace)
                .map(str::to_string)
                .unwrap_or_else(|| self.config.default_env.clone());

            let mut pt = ProcessedTrace::with_root(trace, root, &env);
            let (events, keep) = self.sample(&stats, &mut pt);
            Self::compute_sublayers(&mut pt, calculator, keep);

            let ProcessedTrace {
                trace,
                weighted_trace,
                sublayers,
                env,
                ..
            } = pt;
            inputs.push(Input {
                trace: weighted_trace,
                sublayers,
                env,
                sublayers_only: payload.client_computed_stats,
            });
            if let Some(batch) = assembler.add(keep.then_some(trace), events) {
                self.write_traces(batch).await;
            }
        }

        if let Some(batch) = assembler.finish() {
            self.write_traces(batch).await;
        }
        if !inputs.is_empty() {
            self.concentrator.add(&inputs);
        }
    }

    fn compute_sublayers(
        pt: &mut ProcessedTrace,
        calculator: &mut SublayerCalculator,
        keep: bool,
    ) {
        for subtrace in extract_subtraces(&pt.trace, pt.root) {
            let spans: Vec<&Span> = subtrace.spans.iter().map(|i| &pt.trace[*i]).collect();
            let values = calculator.compute_sublayers(&spans);
            if keep {
                set_sublayers_on_span(&mut pt.trace[subtrace.root], &values);
            }
            pt.sublayers.insert(pt.trace[subtrace.root].span_id, values);
        }
    }

    async fn write_traces(&self, batch: SampledSpans) {
        if let Err(e) = self.trace_writer.write(batch).await {
            error!("Failed to write trace batch: {e}");
        }
    }

    /// Decides whether the trace is kept and extracts its analytics events.
    pub fn sample(&self, stats: &TagStats, pt: &mut ProcessedTrace) -> (Vec<Span>, bool) {
        let counters = &stats.counters;
        let priority = get_sampling_priority(pt.root_span());
        match priority {
            None => incr(&counters.traces_priority_none),
            Some(p) if p < 0 => incr(&counters.traces_priority_neg),
            Some(0) => incr(&counters.traces_priority_0),
            Some(1) => incr(&counters.traces_priority_1),
            Some(_) => incr(&counters.traces_priority_2),
        }
        if priority.is_some_and(|p| p < 0) {
            return (Vec::new(), false);
        }

        let decision = match priority {
            Some(_) => self.sample_priority_trace(pt),
            None => self.sample_no_priority_trace(pt),
        };
        if decision.keep {
            add_trace_rate(pt.root_span_mut(), decision.rate);
            incr(&counters.traces_kept);
        }

        let (events, extracted) = self.extractor.extract(pt.root_span(), &pt.weighted_trace);
        add(&counters.events_extracted, extracted as u64);
        add(&counters.events_sampled, events.len() as u64);
        (events, decision.keep)
    }

    fn sample_priority_trace(&self, pt: &ProcessedTrace) -> SamplingDecision {
        let decision = self.samplers.priority.evaluate(pt);
        if trace_contains_error(&pt.trace) {
            let errors = self.samplers.errors.evaluate(pt);
            return SamplingDecision::new(
                decision.keep || errors.keep,
                combine_rates(decision.rate, errors.rate),
            );
        }
        if self.samplers.exception.evaluate(pt).keep {
            return SamplingDecision::new(true, 1.0);
        }
        decision
    }

    fn sample_no_priority_trace(&self, pt: &ProcessedTrace) -> SamplingDecision {
        if trace_contains_error(&pt.trace) {
            return self.samplers.errors.evaluate(pt);
        }
        self.samplers.score.evaluate(pt)
    }

    /// Converts pre-aggregated client stats to buckets keyed like the ones
    /// computed from traces, and hands them to the stats writer.
    pub async fn process_stats(&self, payload: ClientStatsPayload, lang: &str) {
        let env = match normalize_tag(&payload.env) {
            env if env.is_empty() => self.config.default_env.clone(),
            env => env,
        };
        let mut stats = Vec::with_capacity(payload.stats.len());
        for client_bucket in payload.stats {
            let mut bucket = Bucket::new(client_bucket.start, client_bucket.duration);
            for mut group in client_bucket.stats {
                normalize_stats_group(&mut group, lang);
                self.filters.apply_stats_group(&mut group);

                let status_code = group.http_status_code.to_string();
                let mut extra = vec![(VERSION_TAG, payload.version.as_str())];
                if group.http_status_code != 0 {
                    extra.push((HTTP_STATUS_CODE_TAG, status_code.as_str()));
                }
                let (grain, tags) = assemble_grain(&env, &group.resource, &group.service, extra);
                let hits = group.hits as f64;
                bucket.add_count(
                    Count::new(&group.name, HITS, &grain, tags.clone()).with_values(hits, hits),
                );
                bucket.add_count(
                    Count::new(&group.name, ERRORS, &grain, tags.clone())
                        .with_values(group.errors as f64, hits),
                );
                bucket.add_count(
                    Count::new(&group.name, DURATION, &grain, tags)
                        .with_values(group.duration as f64, hits),
                );
            }
            stats.push(bucket);
        }
        if stats.is_empty() {
            return;
        }
        let hostname = if payload.hostname.is_empty() {
            self.config.hostname.clone()
        } else {
            payload.hostname
        };
        let payload = StatsPayload {
            hostname,
            env,
            stats,
        };
        if let Err(e) = self.stats_writer.write(payload).await {
            error!("Failed to write client stats: {e}");
        }
    }

    /// Runs the agent until `cancel` fires or every producer hangs up, then
    /// shuts down in reverse order of startup.
    pub async fn run(self: Arc<Self>, ingestion: Receiver<Payload>, cancel: CancellationToken) {
        {
            let mut state = self.state.write().await;
            if *state != AgentState::Idle {
                warn!("Trace agent already started");
                return;
            }
            *state = AgentState::Running;
        }

        let stats_cancel = CancellationToken::new();
        let stats_writer = Arc::clone(&self.stats_writer);
        let concentrator = Arc::clone(&self.concentrator);
        let concentrator = tokio::spawn(concentrator.run(stats_writer, stats_cancel.clone()));

        let samplers_cancel = CancellationToken::new();
        let mut maintenance = JoinSet::new();
        for sampler in self.samplers.all() {
            let cancel = samplers_cancel.clone();
            maintenance.spawn(run_maintenance(Arc::clone(sampler), cancel));
        }

        let ingestion = Arc::new(Mutex::new(ingestion));
        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            let agent = Arc::clone(&self);
            let ingestion = Arc::clone(&ingestion);
            let cancel = cancel.clone();
            workers.spawn(async move { agent.work(id, ingestion, cancel).await });
        }
        info!(workers = self.config.workers.max(1), "Trace agent started");

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Trace agent worker failed: {e}");
            }
        }

        *self.state.write().await = AgentState::Draining;
        info!("Trace agent draining");
        {
            let mut rx = ingestion.lock().await;
            rx.close();
            let mut left = 0u64;
            while rx.try_recv().is_ok() {
                left += 1;
            }
            if left > 0 {
                self.payloads_dropped.fetch_add(left, Ordering::Relaxed);
                warn!("Dropped {left} payloads left in the ingestion queue");
            }
        }

        stats_cancel.cancel();
        if let Err(e) = concentrator.await {
            error!("Stats concentrator failed: {e}");
        }
        samplers_cancel.cancel();
        while let Some(result) = maintenance.join_next().await {
            if let Err(e) = result {
                error!("Sampler maintenance failed: {e}");
            }
        }
        self.trace_writer.stop().await;
        self.stats_writer.stop().await;

        *self.state.write().await = AgentState::Stopped;
        self.receiver_stats.log_stats();
        info!("Trace agent stopped");
    }

    async fn work(
        &self,
        id: usize,
        ingestion: Arc<Mutex<Receiver<Payload>>>,
        cancel: CancellationToken,
    ) {
        let mut calculator = SublayerCalculator::new();
        loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                payload = async { ingestion.lock().await.recv().await } => payload,
            };
            let Some(payload) = payload else {
                break;
            };
            self.process(payload, &mut calculator).await;
        }
        debug!("Trace agent worker {id} stopped");
    }
}
