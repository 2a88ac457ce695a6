// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span transforms applied between normalization and sampling.

use regex::Regex;

use crate::config::{AgentConfig, ReplaceRuleConfig};
use crate::error::ConfigError;
use crate::normalizer;
use crate::pb::{ClientGroupedStats, Span, Trace};

const RESOURCE_TAG: &str = "resource.name";
const ALL_TAGS: &str = "*";

pub trait Obfuscator: Send + Sync {
    fn obfuscate(&self, span: &mut Span);
    fn obfuscate_stats_group(&self, group: &mut ClientGroupedStats);
}

pub trait Replacer: Send + Sync {
    fn replace(&self, trace: &mut Trace);
    fn replace_stats_group(&self, group: &mut ClientGroupedStats);
}

pub trait Blacklister: Send + Sync {
    /// Returns false when the trace rooted at `root` must be filtered out.
    fn allows(&self, root: &Span) -> bool;
}

/// Leaves spans untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObfuscator;

impl Obfuscator for NoopObfuscator {
    fn obfuscate(&self, _span: &mut Span) {}
    fn obfuscate_stats_group(&self, _group: &mut ClientGroupedStats) {}
}

#[derive(Debug, Clone)]
struct ReplaceRule {
    name: String,
    re: Regex,
    repl: String,
}

/// Rewrites tag values matching configured patterns.
#[derive(Debug, Clone, Default)]
pub struct TagReplacer {
    rules: Vec<ReplaceRule>,
}

impl TagReplacer {
    pub fn new(rules: &[ReplaceRuleConfig]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| ReplaceRule {
                        name: rule.name.clone(),
                        re,
                        repl: rule.repl.clone(),
                    })
                    .map_err(|source| ConfigError::InvalidReplaceRule {
                        name: rule.name.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    fn replace_span(&self, span: &mut Span) {
        for rule in &self.rules {
            match rule.name.as_str() {
                ALL_TAGS => {
                    for value in span.meta.values_mut() {
                        replace_value(&rule.re, &rule.repl, value);
                    }
                    replace_value(&rule.re, &rule.repl, &mut span.resource);
                }
                RESOURCE_TAG => replace_value(&rule.re, &rule.repl, &mut span.resource),
                key => {
                    if let Some(value) = span.meta.get_mut(key) {
                        replace_value(&rule.re, &rule.repl, value);
                    }
                }
            }
        }
    }
}

fn replace_value(re: &Regex, repl: &str, value: &mut String) {
    if let std::borrow::Cow::Owned(replaced) = re.replace_all(value, repl) {
        *value = replaced;
    }
}

impl Replacer for TagReplacer {
    fn replace(&self, trace: &mut Trace) {
        for span in trace.iter_mut() {
            self.replace_span(span);
        }
    }

    fn replace_stats_group(&self, group: &mut ClientGroupedStats) {
        for rule in &self.rules {
            if rule.name == ALL_TAGS || rule.name == RESOURCE_TAG {
                replace_value(&rule.re, &rule.repl, &mut group.resource);
            }
        }
    }
}

/// Filters out traces whose root resource matches any configured pattern.
#[derive(Debug, Clone, Default)]
pub struct ResourceBlacklister {
    patterns: Vec<Regex>,
}

impl ResourceBlacklister {
    pub fn new(patterns: &[String]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidIgnorePattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }
}

impl Blacklister for ResourceBlacklister {
    fn allows(&self, root: &Span) -> bool {
        !self.patterns.iter().any(|re| re.is_match(&root.resource))
    }
}

/// Obfuscation, truncation, tag replacement and blacklisting, in that order.
pub struct FilterChain {
    obfuscator: Box<dyn Obfuscator>,
    replacer: Box<dyn Replacer>,
    blacklister: Box<dyn Blacklister>,
}

impl FilterChain {
    pub fn new(
        obfuscator: Box<dyn Obfuscator>,
        replacer: Box<dyn Replacer>,
        blacklister: Box<dyn Blacklister>,
    ) -> Self {
        Self {
            obfuscator,
            replacer,
            blacklister,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            Box::new(NoopObfuscator),
            Box::new(TagReplacer::new(&config.replace_tags)?),
            Box::new(ResourceBlacklister::new(&config.ignore_resources)?),
        ))
    }

    /// Transforms every span of `trace` and returns whether the trace rooted
    /// at `root` passes the blacklist.
    pub fn apply(&self, trace: &mut Trace, root: usize) -> bool {
        for span in trace.iter_mut() {
            self.obfuscator.obfuscate(span);
            normalizer::truncate(span);
        }
        self.replacer.replace(trace);
        trace
            .get(root)
            .map_or(true, |root| self.blacklister.allows(root))
    }

    pub fn apply_stats_group(&self, group: &mut ClientGroupedStats) {
        self.obfuscator.obfuscate_stats_group(group);
        self.replacer.replace_stats_group(group);
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new(
            Box::new(NoopObfuscator),
            Box::new(TagReplacer::default()),
            Box::new(ResourceBlacklister::default()),
        )
    }
}
