// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampling of traces carrying a client priority.
//!
//! The keep decision always follows the client: priority above zero keeps
//! the trace. Traces with an automatic priority (0 or 1) feed a backend
//! keyed by `(service, env)` whose rates are published in the rate by
//! service table, which tracers poll to adjust their own sampling.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

use super::{
    get_sampling_priority, service_signature, Backend, SamplingDecision, Signature, TraceSampler,
};
use crate::agent::ProcessedTrace;

pub struct PrioritySampler {
    backend: Backend,
    default_env: String,
    catalog: Mutex<HashMap<Signature, String>>,
    rates_by_service: RwLock<HashMap<String, f64>>,
}

/// Key of the rate by service table.
pub fn rate_by_service_key(service: &str, env: &str) -> String {
    format!("service:{service},env:{env}")
}

impl PrioritySampler {
    pub fn new(target_tps: f64, default_env: &str, decay_period: Duration) -> Self {
        Self {
            backend: Backend::new(target_tps, decay_period),
            default_env: default_env.to_string(),
            catalog: Mutex::new(HashMap::new()),
            rates_by_service: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, service: &str, env: &str) -> Signature {
        let signature = service_signature(service, env);
        let mut catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        catalog
            .entry(signature)
            .or_insert_with(|| rate_by_service_key(service, env));
        signature
    }

    /// Latest per `(service, env)` rates.
    pub fn rates_by_service(&self) -> HashMap<String, f64> {
        self.rates_by_service
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TraceSampler for PrioritySampler {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn evaluate(&self, trace: &ProcessedTrace) -> SamplingDecision {
        let root = trace.root_span();
        let priority = get_sampling_priority(root).unwrap_or(0);
        let keep = priority > 0;
        // Only automatic priorities take part in the feedback loop.
        if !(0..=1).contains(&priority) {
            return SamplingDecision::new(keep, 1.0);
        }
        let env = if trace.env.is_empty() {
            self.default_env.as_str()
        } else {
            trace.env.as_str()
        };
        let signature = self.register(&root.service, env);
        self.backend.count_signature(signature);
        if keep {
            self.backend.count_sample();
        }
        SamplingDecision::new(keep, self.backend.rate(signature))
    }

    fn tick(&self) {
        self.backend.decay();
        let mut catalog = self.catalog.lock().unwrap_or_else(PoisonError::into_inner);
        catalog.retain(|signature, _| self.backend.contains(*signature));
        let rates: HashMap<String, f64> = catalog
            .iter()
            .map(|(signature, key)| (key.clone(), self.backend.rate(*signature)))
            .collect();
        drop(catalog);
        debug!("Updated rates of {} services", rates.len());
        *self
            .rates_by_service
            .write()
            .unwrap_or_else(PoisonError::into_inner) = rates;
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.backend.decay_period())
    }
}
