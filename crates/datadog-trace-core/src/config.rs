// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_ENV: &str = "none";
const DEFAULT_MAX_TPS: f64 = 10.0;
const DEFAULT_MAX_EPS: f64 = 200.0;
const DEFAULT_BUCKET_INTERVAL_SECS: u64 = 10;
const DEFAULT_QUEUE_SIZE: usize = 64;
/// Ceiling of an encoded trace batch, in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 3_200_000;

/// A tag replacement rule before its pattern is compiled.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReplaceRuleConfig {
    /// Tag the rule applies to: `resource.name`, `*` for every tag, or a meta key.
    pub name: String,
    pub pattern: String,
    pub repl: String,
}

/// Configuration of the trace processing core.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Default env for traces and stats that carry none.
    pub default_env: String,
    pub hostname: String,
    /// Target traces per second of the priority and score samplers.
    pub max_tps: f64,
    /// Target traces per second of the error sampler.
    pub error_tps: f64,
    /// Maximum analytics events per second.
    pub max_eps: f64,
    /// Rate multiplied into every score and error sampler rate.
    pub extra_sample_rate: f64,
    /// Resource patterns of traces that are filtered out.
    pub ignore_resources: Vec<String>,
    pub replace_tags: Vec<ReplaceRuleConfig>,
    /// Span tags added to the stats grain beside `version` and `http.status_code`.
    pub extra_aggregators: Vec<String>,
    /// Number of payload processing workers.
    pub workers: usize,
    pub bucket_interval: Duration,
    pub decay_period: Duration,
    pub exception_ttl: Duration,
    pub exception_tps: f64,
    pub ingestion_queue_size: usize,
    pub trace_queue_size: usize,
    pub stats_queue_size: usize,
    pub max_payload_size: usize,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_env: DEFAULT_ENV.to_string(),
            hostname: String::new(),
            max_tps: DEFAULT_MAX_TPS,
            error_tps: DEFAULT_MAX_TPS,
            max_eps: DEFAULT_MAX_EPS,
            extra_sample_rate: 1.0,
            ignore_resources: Vec::new(),
            replace_tags: Vec::new(),
            extra_aggregators: Vec::new(),
            workers: default_workers(),
            bucket_interval: Duration::from_secs(DEFAULT_BUCKET_INTERVAL_SECS),
            decay_period: Duration::from_secs(5),
            exception_ttl: Duration::from_secs(120),
            exception_tps: 5.0,
            ingestion_queue_size: DEFAULT_QUEUE_SIZE,
            trace_queue_size: DEFAULT_QUEUE_SIZE,
            stats_queue_size: DEFAULT_QUEUE_SIZE,
            max_payload_size: MAX_PAYLOAD_SIZE,
            log_level: "info".to_string(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_env<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        _ => Ok(None),
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

// Accepts both comma and space separated lists.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl AgentConfig {
    /// Builds the configuration from `DD_` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(env) = env::var("DD_ENV") {
            if !env.trim().is_empty() {
                config.default_env = env.trim().to_string();
            }
        }
        if let Ok(hostname) = env::var("DD_HOSTNAME") {
            config.hostname = hostname;
        }
        if let Some(max_tps) = parse_env("DD_APM_MAX_TPS")? {
            config.max_tps = max_tps;
        }
        if let Some(error_tps) = parse_env("DD_APM_ERROR_TPS")? {
            config.error_tps = error_tps;
        }
        if let Some(max_eps) = parse_env("DD_APM_MAX_EPS")? {
            config.max_eps = max_eps;
        }
        if let Some(rate) = parse_env("DD_APM_EXTRA_SAMPLE_RATE")? {
            config.extra_sample_rate = rate;
        }
        if let Ok(resources) = env::var("DD_APM_IGNORE_RESOURCES") {
            config.ignore_resources = resources
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(rules) = env::var("DD_APM_REPLACE_TAGS") {
            if !rules.trim().is_empty() {
                config.replace_tags = serde_json::from_str(&rules)?;
            }
        }
        if let Ok(aggregators) = env::var("DD_APM_EXTRA_AGGREGATORS") {
            config.extra_aggregators = parse_list(&aggregators);
        }
        if let Some(workers) = parse_env("DD_APM_WORKERS")? {
            config.workers = workers;
        }
        if let Some(secs) = parse_env::<u64>("DD_APM_BUCKET_INTERVAL_SECS")? {
            config.bucket_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse_env("DD_APM_INGESTION_QUEUE_SIZE")? {
            config.ingestion_queue_size = size;
        }
        if let Ok(level) = env::var("DD_LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !positive(self.max_tps) || !positive(self.error_tps) {
            return Err(ConfigError::InvalidConfig(
                "max tps and error tps must be positive".to_string(),
            ));
        }
        if !positive(self.max_eps) {
            return Err(ConfigError::InvalidConfig("max eps must be positive".to_string()));
        }
        if !positive(self.extra_sample_rate) || self.extra_sample_rate > 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "extra sample rate must be in (0, 1], got {}",
                self.extra_sample_rate
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidConfig("at least one worker is required".to_string()));
        }
        if self.bucket_interval.is_zero() || self.decay_period.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "bucket interval and decay period must be greater than 0".to_string(),
            ));
        }
        if self.ingestion_queue_size == 0
            || self.trace_queue_size == 0
            || self.stats_queue_size == 0
        {
            return Err(ConfigError::InvalidConfig(
                "queue sizes must be greater than 0".to_string(),
            ));
        }
        for pattern in &self.ignore_resources {
            regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidIgnorePattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        for rule in &self.replace_tags {
            regex::Regex::new(&rule.pattern).map_err(|source| ConfigError::InvalidReplaceRule {
                name: rule.name.clone(),
                source,
            })?;
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error, off",
                self.log_level
            )));
        }
        Ok(())
    }
}
