// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output side of the agent: size bounded trace batches and the writers
//! receiving them.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::WriterError;
use crate::pb::{Span, Trace};
use crate::stats::StatsPayload;
use crate::traceutil::{span_msgsize, trace_msgsize};

/// A batch of kept traces and analytics events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampledSpans {
    pub traces: Vec<Trace>,
    pub events: Vec<Span>,
    /// Estimated encoded size in bytes.
    pub size: usize,
    pub span_count: usize,
}

impl SampledSpans {
    pub fn add_trace(&mut self, trace: Trace) {
        self.size += trace_msgsize(&trace);
        self.span_count += trace.len();
        self.traces.push(trace);
    }

    pub fn add_events(&mut self, events: Vec<Span>) {
        self.size += events.iter().map(span_msgsize).sum::<usize>();
        self.span_count += events.len();
        self.events.extend(events);
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty() && self.events.is_empty()
    }
}

/// Accumulates the output of one payload, cutting a batch every time its
/// size reaches `ceiling`.
#[derive(Debug)]
pub struct BatchAssembler {
    ceiling: usize,
    current: SampledSpans,
}

impl BatchAssembler {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            current: SampledSpans::default(),
        }
    }

    /// Appends the kept trace, if any, and the events of one processed trace.
    /// Returns the batch to hand off once the ceiling is reached.
    pub fn add(&mut self, trace: Option<Trace>, events: Vec<Span>) -> Option<SampledSpans> {
        if let Some(trace) = trace {
            self.current.add_trace(trace);
        }
        if !events.is_empty() {
            self.current.add_events(events);
        }
        if self.current.size >= self.ceiling && !self.current.is_empty() {
            return Some(std::mem::take(&mut self.current));
        }
        None
    }

    /// Returns what is left, if anything.
    pub fn finish(&mut self) -> Option<SampledSpans> {
        if self.current.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.current))
    }
}

#[async_trait]
pub trait TraceWriter: Send + Sync {
    /// Hands a batch to the writer, waiting while its queue is full.
    async fn write(&self, batch: SampledSpans) -> Result<(), WriterError>;

    /// Stops accepting batches.
    async fn stop(&self);
}

#[async_trait]
pub trait StatsWriter: Send + Sync {
    async fn write(&self, payload: StatsPayload) -> Result<(), WriterError>;

    async fn stop(&self);
}

/// A writer backed by a bounded channel. Whoever holds the receiver ships
/// the items.
#[derive(Debug)]
pub struct ChannelWriter<T> {
    tx: RwLock<Option<Sender<T>>>,
    dropped: AtomicU64,
}

impl<T: Send> ChannelWriter<T> {
    pub fn new(capacity: usize) -> (Self, Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: RwLock::new(Some(tx)),
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Items refused because the writer was stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn send(&self, item: T) -> Result<(), WriterError> {
        // The lock is released before awaiting capacity so `close` never waits
        // on a full channel.
        let tx = self.tx.read().await.clone();
        let sent = match tx {
            Some(tx) => tx.send(item).await.is_ok(),
            None => false,
        };
        if sent {
            return Ok(());
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping output, writer is stopped");
        Err(WriterError::Closed)
    }

    async fn close(&self) {
        if self.tx.write().await.take().is_some() {
            debug!("Writer stopped");
        }
    }
}

#[async_trait]
impl TraceWriter for ChannelWriter<SampledSpans> {
    async fn write(&self, batch: SampledSpans) -> Result<(), WriterError> {
        self.send(batch).await
    }

    async fn stop(&self) {
        self.close().await;
    }
}

#[async_trait]
impl StatsWriter for ChannelWriter<StatsPayload> {
    async fn write(&self, payload: StatsPayload) -> Result<(), WriterError> {
        self.send(payload).await
    }

    async fn stop(&self) {
        self.close().await;
    }
}
